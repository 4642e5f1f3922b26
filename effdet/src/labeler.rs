//! Ground-truth to anchor assignment.

use crate::{box_coder, common::*, Anchors};

/// A ground-truth box labeled with its 1-based class. Label 0 is background.
pub type GroundTruth = Label<TLBR<f32>, usize>;

/// Pair `[num_boxes, 4]` TLBR boxes with their 1-based labels.
pub fn ground_truth_from_arrays(boxes: ArrayView2<f32>, labels: &[usize]) -> Result<Vec<GroundTruth>> {
    ensure!(
        boxes.ncols() == 4,
        Error::ShapeMismatch(format!(
            "ground truth boxes have shape {:?}, but expect [_, 4]",
            boxes.shape()
        ))
    );
    ensure!(
        boxes.nrows() == labels.len(),
        Error::InvalidInput(format!(
            "get {} ground truth boxes but {} labels",
            boxes.nrows(),
            labels.len()
        ))
    );

    izip!(boxes.outer_iter(), labels)
        .map(|(row, &class)| -> Result<GroundTruth> {
            let rect = TLBR::try_from_tlbr([row[0], row[1], row[2], row[3]])
                .map_err(|err| Error::InvalidInput(err.to_string()))?;
            Ok(Label::new(rect, class))
        })
        .collect()
}

/// The classification target of one anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClsTarget {
    Background,
    /// Excluded from both classification and box losses.
    Ignore,
    /// The 0-based class channel of the matched ground truth.
    Foreground(usize),
}

impl ClsTarget {
    pub fn class(&self) -> Option<usize> {
        match *self {
            Self::Foreground(class) => Some(class),
            _ => None,
        }
    }

    pub fn is_foreground(&self) -> bool {
        matches!(self, Self::Foreground(_))
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignore)
    }
}

/// Per-anchor training targets of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorTargets {
    /// One entry per anchor in flat order.
    pub cls_targets: Vec<ClsTarget>,
    /// `[num_anchors, 4]` encodings. Rows of non-foreground anchors are zero.
    pub box_targets: Array2<f32>,
    /// The number of foreground anchors.
    pub num_positives: usize,
}

impl AnchorTargets {
    /// The loss normalizer, which is the positive count clamped to at least one.
    pub fn normalizer(&self) -> f32 {
        self.num_positives.max(1) as f32
    }
}

/// Anchor labeler initializer.
#[derive(Debug, Clone)]
pub struct AnchorLabelerInit {
    pub num_classes: usize,
    pub match_threshold: R64,
    /// Defaults to `match_threshold`, in which case nothing is ignored.
    pub unmatched_threshold: Option<R64>,
    pub force_match_for_each_gt: bool,
}

impl AnchorLabelerInit {
    pub fn build(self, anchors: Arc<Anchors>) -> Result<AnchorLabeler> {
        let Self {
            num_classes,
            match_threshold,
            unmatched_threshold,
            force_match_for_each_gt,
        } = self;
        let unmatched_threshold = unmatched_threshold.unwrap_or(match_threshold);

        ensure!(
            num_classes > 0,
            Error::Config("num_classes must be positive".into())
        );
        ensure!(
            (0.0..=1.0).contains(&match_threshold.raw()),
            Error::Config("match_threshold must be in range [0, 1]".into())
        );
        ensure!(
            unmatched_threshold >= 0.0 && unmatched_threshold <= match_threshold,
            Error::Config("unmatched_threshold must be in range [0, match_threshold]".into())
        );

        Ok(AnchorLabeler {
            anchors,
            num_classes,
            match_threshold: match_threshold.raw() as f32,
            unmatched_threshold: unmatched_threshold.raw() as f32,
            force_match_for_each_gt,
        })
    }
}

/// Assigns ground truth boxes to anchors by IoU.
#[derive(Debug, Clone)]
pub struct AnchorLabeler {
    anchors: Arc<Anchors>,
    num_classes: usize,
    match_threshold: f32,
    unmatched_threshold: f32,
    force_match_for_each_gt: bool,
}

impl AnchorLabeler {
    pub fn anchors(&self) -> &Arc<Anchors> {
        &self.anchors
    }

    /// Label all anchors against the ground truth of one image.
    pub fn label_anchors(&self, gt: &[GroundTruth]) -> Result<AnchorTargets> {
        let num_anchors = self.anchors.num_anchors();

        if let Some(label) = gt
            .iter()
            .find(|label| label.class == 0 || label.class > self.num_classes)
        {
            bail!(Error::InvalidInput(format!(
                "ground truth class {} is out of range [1, {}]",
                label.class, self.num_classes
            )));
        }
        ensure!(
            gt.iter()
                .all(|label| label.rect.tlbr().iter().all(|coord| coord.is_finite())),
            Error::InvalidInput("ground truth boxes must have finite coordinates".into())
        );

        if gt.is_empty() {
            debug!("image has no ground truth, all anchors are background");
            return Ok(AnchorTargets {
                cls_targets: vec![ClsTarget::Background; num_anchors],
                box_targets: Array2::zeros((num_anchors, 4)),
                num_positives: 0,
            });
        }

        // best ground truth per anchor, the lowest index wins ties
        let mut matches: Vec<(Option<usize>, f32)> = self
            .anchors
            .boxes()
            .par_iter()
            .map(|anchor| {
                gt.iter()
                    .enumerate()
                    .fold((None, 0.0), |(best, best_iou), (gt_index, label)| {
                        let iou = anchor.iou_with(&label.rect);
                        if best.is_none() || iou > best_iou {
                            (Some(gt_index), iou)
                        } else {
                            (best, best_iou)
                        }
                    })
            })
            .collect();

        let mut forced = vec![false; num_anchors];
        if self.force_match_for_each_gt {
            for (gt_index, label) in gt.iter().enumerate() {
                let best_anchor = self
                    .anchors
                    .boxes()
                    .iter()
                    .enumerate()
                    .map(|(anchor_index, anchor)| (anchor_index, anchor.iou_with(&label.rect)))
                    .fold(None, |best: Option<(usize, f32)>, (index, iou)| match best {
                        Some((_, best_iou)) if best_iou >= iou => best,
                        _ => Some((index, iou)),
                    });

                if let Some((anchor_index, iou)) = best_anchor {
                    if iou > 0.0 {
                        matches[anchor_index] = (Some(gt_index), iou);
                        forced[anchor_index] = true;
                    }
                }
            }
        }

        let mut cls_targets = Vec::with_capacity(num_anchors);
        let mut box_targets = Array2::zeros((num_anchors, 4));
        let mut num_positives = 0;

        for (anchor_index, (anchor, &(best, iou), &forced)) in
            izip!(self.anchors.boxes(), &matches, &forced).enumerate()
        {
            let target = match best {
                Some(gt_index) if forced || iou >= self.match_threshold => {
                    let label = &gt[gt_index];
                    let code = box_coder::encode(anchor, &label.rect);
                    box_targets
                        .row_mut(anchor_index)
                        .iter_mut()
                        .zip(code)
                        .for_each(|(dst, src)| *dst = src);
                    num_positives += 1;
                    ClsTarget::Foreground(label.class - 1)
                }
                _ if iou < self.unmatched_threshold => ClsTarget::Background,
                _ => ClsTarget::Ignore,
            };
            cls_targets.push(target);
        }

        Ok(AnchorTargets {
            cls_targets,
            box_targets,
            num_positives,
        })
    }

    /// Label a batch of images in parallel.
    pub fn label_batch(&self, gt: &[Vec<GroundTruth>]) -> Result<Vec<AnchorTargets>> {
        gt.par_iter()
            .map(|image_gt| self.label_anchors(image_gt))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn gt(tlbr: [f32; 4], class: usize) -> GroundTruth {
        Label::new(TLBR::try_from_tlbr(tlbr).unwrap(), class)
    }

    fn labeler(config: &Config) -> Result<AnchorLabeler> {
        let anchors = Arc::new(config.anchors_init().build()?);
        config.labeler_init().build(anchors)
    }

    #[test]
    fn targets_respect_thresholds() -> Result<()> {
        let config = Config {
            num_classes: 3,
            unmatched_threshold: r64(0.4),
            ..Default::default()
        };
        let labeler = labeler(&config)?;
        let boxes = [gt([100.0, 100.0, 200.0, 200.0], 1), gt([300.0, 50.0, 420.0, 130.0], 3)];
        let targets = labeler.label_anchors(&boxes)?;

        assert_eq!(targets.cls_targets.len(), labeler.anchors().num_anchors());
        let mut num_foreground = 0;
        let mut num_ignored = 0;

        for (anchor, target, code) in izip!(
            labeler.anchors().boxes(),
            &targets.cls_targets,
            targets.box_targets.outer_iter()
        ) {
            let best_iou = boxes
                .iter()
                .map(|label| anchor.iou_with(&label.rect))
                .fold(0.0f32, f32::max);

            match *target {
                ClsTarget::Foreground(class) => {
                    assert!(class == 0 || class == 2);
                    assert!(best_iou >= 0.5);
                    num_foreground += 1;
                }
                ClsTarget::Ignore => {
                    assert!((0.4..0.5).contains(&best_iou));
                    assert!(code.iter().all(|&value| value == 0.0));
                    num_ignored += 1;
                }
                ClsTarget::Background => {
                    assert!(best_iou < 0.4);
                    assert!(code.iter().all(|&value| value == 0.0));
                }
            }
        }

        assert!(num_foreground > 0);
        assert!(num_ignored > 0);
        assert_eq!(targets.num_positives, num_foreground);
        Ok(())
    }

    #[test]
    fn foreground_box_targets_decode_to_ground_truth() -> Result<()> {
        let labeler = labeler(&Config::default())?;
        let boxes = [gt([100.0, 100.0, 200.0, 200.0], 1)];
        let targets = labeler.label_anchors(&boxes)?;

        for (anchor_index, target) in targets.cls_targets.iter().enumerate() {
            if target.is_foreground() {
                let row = targets.box_targets.row(anchor_index);
                let code = [row[0], row[1], row[2], row[3]];
                let decoded = box_coder::decode(&labeler.anchors().boxes()[anchor_index], code)?;
                for (lhs, rhs) in izip!(decoded.tlbr(), boxes[0].rect.tlbr()) {
                    approx::assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-2);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn no_ground_truth_means_all_background() -> Result<()> {
        let labeler = labeler(&Config::default())?;
        let targets = labeler.label_anchors(&[])?;

        assert!(targets
            .cls_targets
            .iter()
            .all(|&target| target == ClsTarget::Background));
        assert_eq!(targets.num_positives, 0);
        assert_eq!(targets.normalizer(), 1.0);
        Ok(())
    }

    #[test]
    fn forced_match_claims_best_anchor() -> Result<()> {
        // a thin box overlaps no anchor above the threshold
        let boxes = [gt([100.0, 100.0, 104.0, 180.0], 2)];

        let plain = labeler(&Config::default())?.label_anchors(&boxes)?;
        assert_eq!(plain.num_positives, 0);

        let forced = labeler(&Config {
            force_match_for_each_gt: true,
            ..Default::default()
        })?
        .label_anchors(&boxes)?;
        assert_eq!(forced.num_positives, 1);
        assert!(forced
            .cls_targets
            .iter()
            .any(|&target| target == ClsTarget::Foreground(1)));
        Ok(())
    }

    #[test]
    fn out_of_range_class_is_rejected() -> Result<()> {
        let labeler = labeler(&Config {
            num_classes: 2,
            ..Default::default()
        })?;

        for class in [0, 3] {
            let err = labeler
                .label_anchors(&[gt([0.0, 0.0, 10.0, 10.0], class)])
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::InvalidInput(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn ground_truth_from_arrays_checks_counts() -> Result<()> {
        let boxes = ndarray::array![[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 20.0, 30.0]];
        let gt = ground_truth_from_arrays(boxes.view(), &[1, 2])?;
        assert_eq!(gt.len(), 2);
        assert_eq!(gt[1].class, 2);
        assert_eq!(gt[1].rect.tlbr(), [5.0, 5.0, 20.0, 30.0]);

        let err = ground_truth_from_arrays(boxes.view(), &[1]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidInput(_))
        ));

        let inverted = ndarray::array![[10.0, 0.0, 0.0, 10.0]];
        assert!(ground_truth_from_arrays(inverted.view(), &[1]).is_err());
        Ok(())
    }
}
