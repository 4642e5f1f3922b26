use crate::common::*;

/// Softmax cross entropy against sparse class labels, averaged over the batch.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    num_classes: usize,
}

impl CrossEntropyLoss {
    pub fn new(num_classes: usize) -> Result<Self> {
        ensure!(
            num_classes > 0,
            Error::Config("num_classes must be positive".into())
        );
        Ok(Self { num_classes })
    }

    /// The loss of one `[num_classes]` logit vector.
    pub fn forward(&self, logits: ArrayView1<f32>, label: usize) -> Result<f32> {
        ensure!(
            logits.len() == self.num_classes,
            Error::ShapeMismatch(format!(
                "expect {} logits, but get {}",
                self.num_classes,
                logits.len()
            ))
        );
        ensure!(
            label < self.num_classes,
            Error::InvalidInput(format!(
                "classification label {} is out of range [0, {})",
                label, self.num_classes
            ))
        );

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum_exp = max + logits.iter().map(|&logit| (logit - max).exp()).sum::<f32>().ln();
        Ok(log_sum_exp - logits[label])
    }

    /// The mean loss of `[batch, num_classes]` logits. An empty batch costs zero.
    pub fn forward_batch(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32> {
        ensure!(
            logits.nrows() == labels.len(),
            Error::ShapeMismatch(format!(
                "get {} classification outputs but {} labels",
                logits.nrows(),
                labels.len()
            ))
        );
        if labels.is_empty() {
            return Ok(0.0);
        }

        let sum = izip!(logits.outer_iter(), labels)
            .map(|(row, &label)| self.forward(row, label))
            .sum::<Result<f32>>()?;
        Ok(sum / labels.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn cross_entropy_values() -> Result<()> {
        let loss = CrossEntropyLoss::new(3)?;

        assert_abs_diff_eq!(
            loss.forward(array![0.0, 0.0, 0.0].view(), 2)?,
            3f32.ln(),
            epsilon = 1e-6
        );
        // large logits do not overflow
        assert_abs_diff_eq!(
            loss.forward(array![1000.0, 0.0, 0.0].view(), 0)?,
            0.0,
            epsilon = 1e-6
        );

        let batch = array![[0.0, 0.0, 0.0], [1000.0, 0.0, 0.0]];
        assert_abs_diff_eq!(
            loss.forward_batch(batch.view(), &[1, 0])?,
            3f32.ln() / 2.0,
            epsilon = 1e-6
        );
        assert_eq!(
            loss.forward_batch(Array2::<f32>::zeros((0, 3)).view(), &[])?,
            0.0
        );
        Ok(())
    }

    #[test]
    fn invalid_labels_are_rejected() -> Result<()> {
        let loss = CrossEntropyLoss::new(3)?;
        let err = loss.forward(array![0.0, 0.0, 0.0].view(), 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidInput(_))
        ));

        let err = loss
            .forward_batch(Array2::<f32>::zeros((2, 3)).view(), &[0])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch(_))
        ));
        Ok(())
    }
}
