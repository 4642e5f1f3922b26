//! Pipeline configuration format.

use crate::{
    common::*, AnchorLabelerInit, AnchorsInit, DetectionGeneratorInit, DetectionLossInit,
    TopKSelectorInit,
};

/// The EfficientDet variants and their input image sizes.
const EFFICIENTDET_IMAGE_SIZES: [(&str, usize); 8] = [
    ("efficientdet_d0", 512),
    ("efficientdet_d1", 640),
    ("efficientdet_d2", 768),
    ("efficientdet_d3", 896),
    ("efficientdet_d4", 1024),
    ("efficientdet_d5", 1280),
    ("efficientdet_d6", 1280),
    ("efficientdet_d7", 1536),
];

/// The detection pipeline configuration.
///
/// Every field has a default, so a configuration file only lists what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The finest feature level. Its stride is `2^min_level`.
    pub min_level: usize,
    /// The coarsest feature level, inclusive.
    pub max_level: usize,
    /// The number of octave scales per cell.
    pub num_scales: usize,
    /// Aspect ratios as `(width, height)` multipliers.
    pub aspect_ratios: Vec<(R64, R64)>,
    /// The anchor size relative to the level stride.
    pub anchor_scale: R64,
    /// The side length of the square network input in pixels.
    pub image_size: usize,
    /// The number of foreground classes.
    pub num_classes: usize,
    /// If set, anchors are clipped to the image.
    pub clip_anchors: bool,
    /// Anchors with best IoU at least this value become foreground.
    pub match_threshold: R64,
    /// Anchors with best IoU below this value become background. IoUs in
    /// between are ignored.
    pub unmatched_threshold: R64,
    /// If set, every ground truth claims its best anchor regardless of IoU.
    pub force_match_for_each_gt: bool,
    /// The number of candidates kept per image before suppression.
    pub max_detection_points: usize,
    /// The fixed length of the detection list per image.
    pub max_detections_per_image: usize,
    /// Boxes of the same class overlapping above this IoU are suppressed.
    pub nms_iou_threshold: R64,
    /// Candidates scoring below this value are dropped before suppression.
    pub score_threshold: Option<R64>,
    /// The focal loss balance between positives and negatives.
    pub alpha: R64,
    /// The focal loss focusing exponent.
    pub gamma: R64,
    /// The transition point of the Huber box loss.
    pub delta: R64,
    /// The weight of box loss in the total loss.
    pub box_loss_weight: R64,
    /// The weight of the image classification head loss in the total loss.
    pub classification_loss_weight: R64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_level: 3,
            max_level: 7,
            num_scales: 3,
            aspect_ratios: vec![
                (r64(1.0), r64(1.0)),
                (r64(1.4), r64(0.7)),
                (r64(0.7), r64(1.4)),
            ],
            anchor_scale: r64(4.0),
            image_size: 512,
            num_classes: 90,
            clip_anchors: false,
            match_threshold: r64(0.5),
            unmatched_threshold: r64(0.5),
            force_match_for_each_gt: false,
            max_detection_points: 5000,
            max_detections_per_image: 100,
            nms_iou_threshold: r64(0.5),
            score_threshold: None,
            alpha: r64(0.25),
            gamma: r64(1.5),
            delta: r64(0.1),
            box_loss_weight: r64(50.0),
            classification_loss_weight: r64(1.0),
        }
    }
}

impl Config {
    /// Load and validate a JSON5 configuration file.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// The default configuration of a named EfficientDet variant, e.g. `efficientdet_d2`.
    pub fn efficientdet(name: &str) -> Result<Self> {
        let image_size = EFFICIENTDET_IMAGE_SIZES
            .iter()
            .find(|(variant, _)| *variant == name)
            .map(|&(_, size)| size)
            .ok_or_else(|| Error::Config(format!("unknown model variant '{}'", name)))?;

        let config = Self {
            image_size,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn num_levels(&self) -> usize {
        (self.max_level + 1).saturating_sub(self.min_level)
    }

    pub fn anchors_per_cell(&self) -> usize {
        self.num_scales * self.aspect_ratios.len()
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            min_level,
            max_level,
            num_scales,
            ref aspect_ratios,
            anchor_scale,
            image_size,
            num_classes,
            match_threshold,
            unmatched_threshold,
            max_detection_points,
            max_detections_per_image,
            nms_iou_threshold,
            score_threshold,
            alpha,
            gamma,
            delta,
            box_loss_weight,
            classification_loss_weight,
            ..
        } = *self;

        ensure!(
            min_level <= max_level,
            Error::Config(format!(
                "max_level ({}) must not be less than min_level ({})",
                max_level, min_level
            ))
        );
        ensure!(
            max_level < usize::BITS as usize,
            Error::Config(format!("max_level ({}) is too large", max_level))
        );
        ensure!(
            num_scales > 0,
            Error::Config("num_scales must be positive".into())
        );
        ensure!(
            !aspect_ratios.is_empty(),
            Error::Config("aspect_ratios must not be empty".into())
        );
        ensure!(
            aspect_ratios.iter().all(|&(w, h)| w > 0.0 && h > 0.0),
            Error::Config("aspect ratio components must be positive".into())
        );
        ensure!(
            anchor_scale > 0.0,
            Error::Config("anchor_scale must be positive".into())
        );
        ensure!(
            image_size > 0,
            Error::Config("image_size must be positive".into())
        );
        ensure!(
            image_size % (1 << max_level) == 0,
            Error::Config(format!(
                "image_size ({}) must be divisible by the coarsest stride ({})",
                image_size,
                1usize << max_level
            ))
        );
        ensure!(
            num_classes > 0,
            Error::Config("num_classes must be positive".into())
        );
        ensure!(
            (0.0..=1.0).contains(&match_threshold.raw())
                && (0.0..=1.0).contains(&unmatched_threshold.raw()),
            Error::Config("matching thresholds must be in range [0, 1]".into())
        );
        ensure!(
            unmatched_threshold <= match_threshold,
            Error::Config("unmatched_threshold must not exceed match_threshold".into())
        );
        ensure!(
            (0.0..=1.0).contains(&nms_iou_threshold.raw()),
            Error::Config("nms_iou_threshold must be in range [0, 1]".into())
        );
        ensure!(
            score_threshold.map_or(true, |thresh| (0.0..=1.0).contains(&thresh.raw())),
            Error::Config("score_threshold must be in range [0, 1]".into())
        );
        ensure!(
            max_detection_points > 0 && max_detections_per_image > 0,
            Error::Config(
                "max_detection_points and max_detections_per_image must be positive".into()
            )
        );
        ensure!(
            (0.0..=1.0).contains(&alpha.raw()),
            Error::Config("alpha must be in range [0, 1]".into())
        );
        ensure!(
            gamma >= 0.0,
            Error::Config("gamma must be non-negative".into())
        );
        ensure!(delta > 0.0, Error::Config("delta must be positive".into()));
        ensure!(
            box_loss_weight >= 0.0 && classification_loss_weight >= 0.0,
            Error::Config("loss weights must be non-negative".into())
        );

        Ok(())
    }

    pub fn anchors_init(&self) -> AnchorsInit {
        AnchorsInit {
            min_level: self.min_level,
            max_level: self.max_level,
            num_scales: self.num_scales,
            aspect_ratios: self.aspect_ratios.clone(),
            anchor_scale: self.anchor_scale,
            image_size: self.image_size,
            clip: self.clip_anchors,
        }
    }

    pub fn labeler_init(&self) -> AnchorLabelerInit {
        AnchorLabelerInit {
            num_classes: self.num_classes,
            match_threshold: self.match_threshold,
            unmatched_threshold: Some(self.unmatched_threshold),
            force_match_for_each_gt: self.force_match_for_each_gt,
        }
    }

    pub fn topk_init(&self) -> TopKSelectorInit {
        TopKSelectorInit {
            num_classes: self.num_classes,
            k: self.max_detection_points,
        }
    }

    pub fn detection_init(&self) -> DetectionGeneratorInit {
        DetectionGeneratorInit {
            image_size: self.image_size,
            max_detections_per_image: self.max_detections_per_image,
            nms_iou_threshold: self.nms_iou_threshold,
            score_threshold: self.score_threshold,
        }
    }

    pub fn loss_init(&self) -> DetectionLossInit {
        DetectionLossInit {
            num_classes: self.num_classes,
            alpha: self.alpha,
            gamma: self.gamma,
            delta: self.delta,
            box_loss_weight: self.box_loss_weight,
            classification_loss_weight: self.classification_loss_weight,
        }
    }
}
