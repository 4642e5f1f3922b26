use super::{CrossEntropyLoss, FocalLoss, FocalLossInit, HuberLoss};
use crate::{common::*, AnchorTargets, HeadOutputs};

/// Detection loss initializer.
#[derive(Debug, Clone)]
pub struct DetectionLossInit {
    pub num_classes: usize,
    pub alpha: R64,
    pub gamma: R64,
    pub delta: R64,
    pub box_loss_weight: R64,
    pub classification_loss_weight: R64,
}

impl Default for DetectionLossInit {
    fn default() -> Self {
        Self {
            num_classes: 90,
            alpha: r64(0.25),
            gamma: r64(1.5),
            delta: r64(0.1),
            box_loss_weight: r64(50.0),
            classification_loss_weight: r64(1.0),
        }
    }
}

impl DetectionLossInit {
    pub fn build(self) -> Result<DetectionLoss> {
        let Self {
            num_classes,
            alpha,
            gamma,
            delta,
            box_loss_weight,
            classification_loss_weight,
        } = self;

        ensure!(
            num_classes > 0,
            Error::Config("num_classes must be positive".into())
        );
        ensure!(
            box_loss_weight >= 0.0 && classification_loss_weight >= 0.0,
            Error::Config("loss weights must be non-negative".into())
        );

        let focal_loss = FocalLossInit { alpha, gamma }.build()?;
        let huber_loss = HuberLoss::new(delta)?;

        Ok(DetectionLoss {
            num_classes,
            focal_loss,
            huber_loss,
            box_loss_weight: box_loss_weight.raw() as f32,
            classification_loss_weight: classification_loss_weight.raw() as f32,
        })
    }
}

/// Whole-image classification head outputs and their labels.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationTarget<'a> {
    /// `[batch, num_image_classes]` logits.
    pub logits: ArrayView2<'a, f32>,
    /// 0-based image labels, one per image.
    pub labels: &'a [usize],
}

/// Batch-averaged loss components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionLossOutput {
    pub total_loss: f32,
    pub classification_loss: f32,
    pub box_loss: f32,
    pub classification_head_loss: Option<f32>,
}

/// Focal classification loss plus Huber box loss, with an optional image
/// classification term.
#[derive(Debug, Clone)]
pub struct DetectionLoss {
    num_classes: usize,
    focal_loss: FocalLoss,
    huber_loss: HuberLoss,
    box_loss_weight: f32,
    classification_loss_weight: f32,
}

impl DetectionLoss {
    /// Compute the losses of a batch.
    ///
    /// Each image's terms are normalized by its clamped positive count and the
    /// results are averaged over the batch. Images whose `has_box` entry is
    /// false contribute no box loss.
    pub fn forward(
        &self,
        outputs: &HeadOutputs,
        targets: &[AnchorTargets],
        has_box: Option<&[bool]>,
        classification: Option<ClassificationTarget<'_>>,
    ) -> Result<DetectionLossOutput> {
        let batch_size = outputs.batch_size();
        ensure!(
            outputs.num_classes() == self.num_classes,
            Error::ShapeMismatch(format!(
                "head outputs have {} classes, but expect {}",
                outputs.num_classes(),
                self.num_classes
            ))
        );
        ensure!(
            targets.len() == batch_size,
            Error::ShapeMismatch(format!(
                "get {} target sets for a batch of {}",
                targets.len(),
                batch_size
            ))
        );
        if let Some(has_box) = has_box {
            ensure!(
                has_box.len() == batch_size,
                Error::ShapeMismatch(format!(
                    "get {} has_box flags for a batch of {}",
                    has_box.len(),
                    batch_size
                ))
            );
        }
        ensure!(
            batch_size > 0,
            Error::InvalidInput("cannot compute loss of an empty batch".into())
        );

        let per_image: Vec<(f32, f32)> = targets
            .par_iter()
            .enumerate()
            .map(|(image, image_targets)| {
                let has_box = has_box.map_or(true, |has_box| has_box[image]);
                self.image_loss(outputs, image, image_targets, has_box)
            })
            .collect::<Result<_>>()?;

        let classification_loss =
            per_image.iter().map(|&(cls, _)| cls).sum::<f32>() / batch_size as f32;
        let box_loss = per_image.iter().map(|&(_, bbox)| bbox).sum::<f32>() / batch_size as f32;

        let classification_head_loss = classification
            .map(|ClassificationTarget { logits, labels }| {
                ensure!(
                    logits.nrows() == batch_size,
                    Error::ShapeMismatch(format!(
                        "get {} classification head outputs for a batch of {}",
                        logits.nrows(),
                        batch_size
                    ))
                );
                CrossEntropyLoss::new(logits.ncols())?.forward_batch(logits, labels)
            })
            .transpose()?;

        let total_loss = classification_loss
            + self.box_loss_weight * box_loss
            + classification_head_loss
                .map_or(0.0, |loss| self.classification_loss_weight * loss);

        let output = DetectionLossOutput {
            total_loss,
            classification_loss,
            box_loss,
            classification_head_loss,
        };
        ensure!(
            [total_loss, classification_loss, box_loss]
                .iter()
                .chain(classification_head_loss.as_ref())
                .all(|loss| loss.is_finite()),
            Error::NumericAnomaly(format!("non-finite loss {:?}", output))
        );

        Ok(output)
    }

    /// The normalized `(classification, box)` losses of one image.
    fn image_loss(
        &self,
        outputs: &HeadOutputs,
        image: usize,
        targets: &AnchorTargets,
        has_box: bool,
    ) -> Result<(f32, f32)> {
        let num_anchors = outputs.num_anchors();
        ensure!(
            targets.cls_targets.len() == num_anchors && targets.box_targets.dim() == (num_anchors, 4),
            Error::ShapeMismatch(format!(
                "targets cover {} anchors, but outputs have {}",
                targets.cls_targets.len(),
                num_anchors
            ))
        );

        let normalizer = targets.normalizer();
        let logits: Vec<f32> = outputs.image_cls_logits(image).collect();

        let cls_loss: f32 = izip!(logits.chunks_exact(self.num_classes), &targets.cls_targets)
            .filter(|(_, target)| !target.is_ignored())
            .map(|(row, target)| self.focal_loss.forward_row(row, target.class()))
            .sum();

        let box_loss: f32 = if has_box {
            izip!(
                outputs.image_box_outputs(image),
                targets.box_targets.outer_iter(),
                &targets.cls_targets
            )
            .filter(|(_, _, target)| target.is_foreground())
            .map(|(code, box_target, _)| {
                let box_target = [box_target[0], box_target[1], box_target[2], box_target[3]];
                self.huber_loss.forward_box(&code, &box_target)
            })
            .sum()
        } else {
            0.0
        };

        Ok((cls_loss / normalizer, box_loss / (normalizer * 4.0)))
    }
}
