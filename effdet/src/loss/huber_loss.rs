use crate::common::*;

/// Huber loss, quadratic below `delta` and linear above.
#[derive(Debug, Clone)]
pub struct HuberLoss {
    delta: f32,
}

impl HuberLoss {
    pub fn new(delta: R64) -> Result<Self> {
        ensure!(delta > 0.0, Error::Config("delta must be positive".into()));
        Ok(Self {
            delta: delta.raw() as f32,
        })
    }

    pub fn forward(&self, input: f32, target: f32) -> f32 {
        let abs_error = (input - target).abs();
        let quadratic = abs_error.min(self.delta);
        let linear = abs_error - quadratic;
        0.5 * quadratic * quadratic + self.delta * linear
    }

    /// The summed loss over the four box coordinates.
    pub fn forward_box(&self, input: &[f32; 4], target: &[f32; 4]) -> f32 {
        izip!(input, target)
            .map(|(&input, &target)| self.forward(input, target))
            .sum()
    }
}
