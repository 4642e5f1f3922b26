//! Candidate decoding and per-class non-maximum suppression.

use crate::{box_coder, common::*, Anchors, Candidates};

/// A final detection in original image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Detection {
    pub tlbr: TLBR<f32>,
    /// The 1-based class label. Placeholders use 0.
    pub class: usize,
    /// The sigmoid confidence.
    pub score: f32,
}

impl Detection {
    /// The zero-score entry that pads detection lists.
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn is_placeholder(&self) -> bool {
        self.score == 0.0 && self.class == 0
    }

    /// The `(y1, x1, y2, x2, class, score)` row.
    pub fn to_array(&self) -> [f32; 6] {
        let [t, l, b, r] = self.tlbr.tlbr();
        [t, l, b, r, self.class as f32, self.score]
    }
}

/// Detection generator initializer.
#[derive(Debug, Clone)]
pub struct DetectionGeneratorInit {
    /// The network input size in pixels.
    pub image_size: usize,
    pub max_detections_per_image: usize,
    pub nms_iou_threshold: R64,
    pub score_threshold: Option<R64>,
}

impl DetectionGeneratorInit {
    pub fn build(self) -> Result<DetectionGenerator> {
        let Self {
            image_size,
            max_detections_per_image,
            nms_iou_threshold,
            score_threshold,
        } = self;

        ensure!(
            image_size > 0,
            Error::Config("image_size must be positive".into())
        );
        ensure!(
            max_detections_per_image > 0,
            Error::Config("max_detections_per_image must be positive".into())
        );
        ensure!(
            (0.0..=1.0).contains(&nms_iou_threshold.raw()),
            Error::Config("nms_iou_threshold must be in range [0, 1]".into())
        );
        if let Some(score_threshold) = score_threshold {
            ensure!(
                (0.0..=1.0).contains(&score_threshold.raw()),
                Error::Config("score_threshold must be in range [0, 1]".into())
            );
        }

        Ok(DetectionGenerator {
            image_size,
            max_detections_per_image,
            nms_iou_threshold: nms_iou_threshold.raw() as f32,
            score_threshold: score_threshold.map(|threshold| threshold.raw() as f32),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DetectionGenerator {
    image_size: usize,
    max_detections_per_image: usize,
    nms_iou_threshold: f32,
    score_threshold: Option<f32>,
}

/// A decoded candidate awaiting suppression.
#[derive(Debug, Clone, Copy)]
struct Decoded {
    /// Position in the candidate list, which breaks score ties.
    rank: usize,
    tlbr: TLBR<f32>,
    score: f32,
}

impl DetectionGenerator {
    pub fn max_detections_per_image(&self) -> usize {
        self.max_detections_per_image
    }

    /// Turn the top-k candidates of one image into a fixed-length detection list.
    ///
    /// `image_scale` is the factor the original image was resized by to fit
    /// the network input. Boxes are mapped back by dividing by it and clipped
    /// to `image_size / image_scale`.
    pub fn generate(
        &self,
        candidates: &Candidates,
        anchors: &Anchors,
        image_scale: f32,
    ) -> Result<Vec<Detection>> {
        let num_candidates = candidates.len();
        ensure!(
            candidates.box_topk.len() == num_candidates
                && candidates.anchor_indices.len() == num_candidates
                && candidates.class_indices.len() == num_candidates,
            Error::ShapeMismatch("candidate fields have different lengths".into())
        );
        ensure!(
            image_scale.is_finite() && image_scale > 0.0,
            Error::InvalidInput(format!("invalid image scale {}", image_scale))
        );

        let transform = Transform::try_from_scale(image_scale.recip())?;
        let extent = self.image_size as f32 / image_scale;
        let bounds = HW::try_from_hw([extent, extent])?;

        // decode and group by class
        let mut groups: BTreeMap<usize, Vec<Decoded>> = BTreeMap::new();

        for (rank, (logit, code, anchor_index, class_index)) in candidates.iter().enumerate() {
            let score = sigmoid(logit);
            if matches!(self.score_threshold, Some(threshold) if score < threshold) {
                continue;
            }

            let anchor = anchors.get(anchor_index).ok_or_else(|| {
                Error::ShapeMismatch(format!(
                    "anchor index {} is out of {} anchors",
                    anchor_index,
                    anchors.num_anchors()
                ))
            })?;
            let tlbr = (&transform * &box_coder::decode(anchor, code)?).clip_to(&bounds);
            if tlbr.is_empty() {
                continue;
            }

            groups
                .entry(class_index)
                .or_default()
                .push(Decoded { rank, tlbr, score });
        }

        let mut kept: Vec<(usize, Decoded)> = groups
            .into_iter()
            .flat_map(|(class_index, group)| {
                self.suppress(group)
                    .into_iter()
                    .map(move |decoded| (class_index, decoded))
            })
            .collect();
        kept.sort_by(|(_, lhs), (_, rhs)| compare_decoded(lhs, rhs));

        debug!(
            "{} of {} candidates survive suppression",
            kept.len(),
            num_candidates
        );

        let detections = kept
            .into_iter()
            .map(|(class_index, decoded)| Detection {
                tlbr: decoded.tlbr,
                class: class_index + 1,
                score: decoded.score,
            })
            .chain(iter::repeat(Detection::placeholder()))
            .take(self.max_detections_per_image)
            .collect();

        Ok(detections)
    }

    /// Greedy suppression within one class.
    fn suppress(&self, mut group: Vec<Decoded>) -> Vec<Decoded> {
        group.sort_by(compare_decoded);

        let mut kept: Vec<Decoded> = vec![];
        for decoded in group {
            let overlapped = kept
                .iter()
                .any(|other| other.tlbr.iou_with(&decoded.tlbr) > self.nms_iou_threshold);
            if !overlapped {
                kept.push(decoded);
            }
        }
        kept
    }
}

/// Score descending, then candidate rank ascending.
fn compare_decoded(lhs: &Decoded, rhs: &Decoded) -> Ordering {
    rhs.score
        .total_cmp(&lhs.score)
        .then(lhs.rank.cmp(&rhs.rank))
}

fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}
