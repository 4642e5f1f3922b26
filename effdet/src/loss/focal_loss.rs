use crate::common::*;

/// Focal loss initializer.
#[derive(Debug, Clone)]
pub struct FocalLossInit {
    /// The weight of positive targets. Negatives get `1 - alpha`.
    pub alpha: R64,
    /// The exponent of the modulating factor.
    pub gamma: R64,
}

impl Default for FocalLossInit {
    fn default() -> Self {
        Self {
            alpha: r64(0.25),
            gamma: r64(1.5),
        }
    }
}

impl FocalLossInit {
    /// Build a focal loss calculator.
    pub fn build(self) -> Result<FocalLoss> {
        let Self { alpha, gamma } = self;

        ensure!(
            (0.0..=1.0).contains(&alpha.raw()),
            Error::Config("alpha must be in range [0, 1]".into())
        );
        ensure!(
            gamma >= 0.0,
            Error::Config("gamma must be non-negative".into())
        );

        Ok(FocalLoss {
            alpha: alpha.raw() as f32,
            gamma: gamma.raw() as f32,
        })
    }
}

/// Sigmoid focal loss on logits.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    alpha: f32,
    gamma: f32,
}

impl FocalLoss {
    /// Compute the loss of one logit against a binary target.
    pub fn forward(&self, logit: f32, target: bool) -> f32 {
        let Self { alpha, gamma } = *self;
        let prob = 1.0 / (1.0 + (-logit).exp());

        let (alpha_factor, modulating_factor) = if target {
            (alpha, (1.0 - prob).powf(gamma))
        } else {
            (1.0 - alpha, prob.powf(gamma))
        };

        alpha_factor * modulating_factor * bce_with_logits(logit, target)
    }

    /// Sum the loss over a row of per-class logits. `class` is the positive
    /// channel, if any.
    pub fn forward_row(&self, logits: &[f32], class: Option<usize>) -> f32 {
        logits
            .iter()
            .enumerate()
            .map(|(channel, &logit)| self.forward(logit, Some(channel) == class))
            .sum()
    }
}

/// Binary cross entropy on a logit, in the form that does not overflow.
pub fn bce_with_logits(logit: f32, target: bool) -> f32 {
    let target = if target { 1.0 } else { 0.0 };
    logit.max(0.0) - logit * target + (-logit.abs()).exp().ln_1p()
}
