//! Batch-level training and evaluation pipelines around raw head outputs.

use crate::{
    common::*, AnchorLabeler, Anchors, ClassificationTarget, Config, Detection,
    DetectionGenerator, DetectionLoss, DetectionLossOutput, GroundTruth, HeadOutputs, TopKSelector,
};

/// Top-k selection followed by detection generation.
#[derive(Debug, Clone)]
struct Detector {
    anchors: Arc<Anchors>,
    topk: TopKSelector,
    generator: DetectionGenerator,
}

impl Detector {
    fn new(config: &Config, anchors: Arc<Anchors>) -> Result<Self> {
        let expect = config.anchors_init().build()?;
        ensure!(
            *anchors == expect,
            Error::Config("anchors were built from a different configuration".into())
        );

        Ok(Self {
            anchors,
            topk: config.topk_init().build()?,
            generator: config.detection_init().build()?,
        })
    }

    fn detect(&self, outputs: &HeadOutputs, image_scales: &[f32]) -> Result<Vec<Vec<Detection>>> {
        ensure!(
            image_scales.len() == outputs.batch_size(),
            Error::ShapeMismatch(format!(
                "get {} image scales for a batch of {}",
                image_scales.len(),
                outputs.batch_size()
            ))
        );

        image_scales
            .par_iter()
            .enumerate()
            .map(|(image, &image_scale)| {
                let candidates = self.topk.select(outputs, image)?;
                self.generator
                    .generate(&candidates, &self.anchors, image_scale)
            })
            .collect()
    }
}

/// Losses of a training step, with detections if requested.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub loss: DetectionLossOutput,
    /// `[batch][max_detections_per_image]` detections at unit image scale.
    pub detections: Option<Vec<Vec<Detection>>>,
}

/// The training pipeline: labels the ground truth and computes losses.
#[derive(Debug, Clone)]
pub struct DetBenchTrain {
    labeler: AnchorLabeler,
    loss: DetectionLoss,
    detector: Detector,
}

impl DetBenchTrain {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let anchors = Arc::new(config.anchors_init().build()?);
        Self::with_anchors(config, anchors)
    }

    /// Build on an existing anchor set, typically shared with a [DetBenchEval].
    pub fn with_anchors(config: &Config, anchors: Arc<Anchors>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            labeler: config.labeler_init().build(anchors.clone())?,
            loss: config.loss_init().build()?,
            detector: Detector::new(config, anchors)?,
        })
    }

    pub fn anchors(&self) -> &Arc<Anchors> {
        &self.detector.anchors
    }

    /// Run one training step.
    ///
    /// `gt` holds the ground truth of each image. `has_box` marks the images
    /// that may contribute box loss and `classification` enables the image
    /// classification term.
    pub fn forward(
        &self,
        outputs: &HeadOutputs,
        gt: &[Vec<GroundTruth>],
        has_box: Option<&[bool]>,
        classification: Option<ClassificationTarget<'_>>,
        include_pred: bool,
    ) -> Result<TrainOutput> {
        ensure!(
            gt.len() == outputs.batch_size(),
            Error::ShapeMismatch(format!(
                "get ground truth of {} images for a batch of {}",
                gt.len(),
                outputs.batch_size()
            ))
        );

        let targets = self.labeler.label_batch(gt)?;
        let loss = self.loss.forward(outputs, &targets, has_box, classification)?;
        debug!(
            "loss {:.5} (classification {:.5}, box {:.5})",
            loss.total_loss, loss.classification_loss, loss.box_loss
        );

        let detections = if include_pred {
            let image_scales = vec![1.0; outputs.batch_size()];
            Some(self.detector.detect(outputs, &image_scales)?)
        } else {
            None
        };

        Ok(TrainOutput { loss, detections })
    }
}

/// The evaluation pipeline: turns head outputs into detections.
#[derive(Debug, Clone)]
pub struct DetBenchEval {
    detector: Detector,
}

impl DetBenchEval {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let anchors = Arc::new(config.anchors_init().build()?);
        Self::with_anchors(config, anchors)
    }

    pub fn with_anchors(config: &Config, anchors: Arc<Anchors>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector: Detector::new(config, anchors)?,
        })
    }

    pub fn anchors(&self) -> &Arc<Anchors> {
        &self.detector.anchors
    }

    /// Produce `[batch][max_detections_per_image]` detections. Each image's
    /// boxes are divided by its entry in `image_scales`.
    pub fn forward(&self, outputs: &HeadOutputs, image_scales: &[f32]) -> Result<Vec<Vec<Detection>>> {
        self.detector.detect(outputs, image_scales)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn config() -> Config {
        Config {
            min_level: 3,
            max_level: 5,
            image_size: 128,
            num_classes: 3,
            max_detection_points: 100,
            max_detections_per_image: 20,
            ..Default::default()
        }
    }

    fn zero_outputs(config: &Config, anchors: &Anchors, batch_size: usize) -> Result<HeadOutputs> {
        let per_cell = anchors.anchors_per_cell();
        let (cls, boxes) = anchors
            .levels()
            .iter()
            .map(|info| {
                let (h, w) = (info.grid_h(), info.grid_w());
                (
                    Array4::from_elem((batch_size, h, w, per_cell * config.num_classes), -5.0),
                    Array4::zeros((batch_size, h, w, per_cell * 4)),
                )
            })
            .unzip();
        HeadOutputs::new(cls, boxes, anchors, config.num_classes)
    }

    #[test]
    fn eval_yields_fixed_shape() -> Result<()> {
        let config = config();
        let bench = DetBenchEval::new(&config)?;
        let outputs = zero_outputs(&config, bench.anchors(), 3)?;

        let detections = bench.forward(&outputs, &[1.0, 0.5, 2.0])?;
        assert_eq!(detections.len(), 3);
        assert!(detections.iter().all(|image| image.len() == 20));

        let err = bench.forward(&outputs, &[1.0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn train_returns_losses_and_optional_predictions() -> Result<()> {
        let config = config();
        let bench = DetBenchTrain::new(&config)?;
        let outputs = zero_outputs(&config, bench.anchors(), 2)?;
        let gt = vec![
            vec![Label::new(TLBR::try_from_tlbr([20.0, 20.0, 60.0, 60.0])?, 2)],
            vec![],
        ];

        let output = bench.forward(&outputs, &gt, None, None, false)?;
        assert!(output.detections.is_none());
        assert!(output.loss.total_loss > 0.0);

        let output = bench.forward(&outputs, &gt, Some(&[true, false]), None, true)?;
        let detections = output.detections.unwrap();
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|image| image.len() == 20));
        Ok(())
    }

    #[test]
    fn train_and_eval_share_anchors() -> Result<()> {
        let config = config();
        let train = DetBenchTrain::new(&config)?;
        let eval = DetBenchEval::with_anchors(&config, train.anchors().clone())?;
        assert!(Arc::ptr_eq(train.anchors(), eval.anchors()));

        let others = [
            Config {
                image_size: 256,
                ..config.clone()
            },
            Config {
                min_level: 4,
                max_level: 6,
                ..config.clone()
            },
            Config {
                num_scales: 2,
                ..config.clone()
            },
            Config {
                aspect_ratios: vec![(r64(1.0), r64(1.0))],
                ..config.clone()
            },
            Config {
                anchor_scale: r64(3.0),
                ..config.clone()
            },
        ];
        for other in &others {
            let err = DetBenchEval::with_anchors(other, train.anchors().clone()).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::Config(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn ground_truth_count_must_match_batch() -> Result<()> {
        let config = config();
        let bench = DetBenchTrain::new(&config)?;
        let outputs = zero_outputs(&config, bench.anchors(), 2)?;

        let err = bench
            .forward(&outputs, &[vec![]], None, None, false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch(_))
        ));
        Ok(())
    }
}
