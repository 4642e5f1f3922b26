//! Global top-k candidate reduction over all levels and classes.

use crate::{common::*, HeadOutputs};

/// Top-k selector initializer.
#[derive(Debug, Clone)]
pub struct TopKSelectorInit {
    pub num_classes: usize,
    /// The fixed number of candidates per image.
    pub k: usize,
}

impl TopKSelectorInit {
    pub fn build(self) -> Result<TopKSelector> {
        let Self { num_classes, k } = self;

        ensure!(
            num_classes > 0,
            Error::Config("num_classes must be positive".into())
        );
        ensure!(k > 0, Error::Config("top-k size must be positive".into()));

        Ok(TopKSelector { num_classes, k })
    }
}

/// The `k` highest scoring `(anchor, class)` pairs of one image, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidates {
    /// Raw classification logits.
    pub cls_topk: Vec<f32>,
    /// Box regression outputs of the originating anchors.
    pub box_topk: Vec<[f32; 4]>,
    pub anchor_indices: Vec<usize>,
    /// 0-based class channels.
    pub class_indices: Vec<usize>,
}

impl Candidates {
    pub fn len(&self) -> usize {
        self.cls_topk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cls_topk.is_empty()
    }

    /// Iterate `(logit, box_output, anchor_index, class_index)` tuples.
    pub fn iter(&self) -> impl Iterator<Item = (f32, [f32; 4], usize, usize)> + '_ {
        izip!(
            self.cls_topk.iter().copied(),
            self.box_topk.iter().copied(),
            self.anchor_indices.iter().copied(),
            self.class_indices.iter().copied()
        )
    }
}

#[derive(Debug, Clone)]
pub struct TopKSelector {
    num_classes: usize,
    k: usize,
}

impl TopKSelector {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Select the candidates of one image of a batch.
    pub fn select(&self, outputs: &HeadOutputs, image: usize) -> Result<Candidates> {
        ensure!(
            outputs.num_classes() == self.num_classes,
            Error::ShapeMismatch(format!(
                "head outputs have {} classes, but expect {}",
                outputs.num_classes(),
                self.num_classes
            ))
        );
        ensure!(
            image < outputs.batch_size(),
            Error::InvalidInput(format!(
                "image index {} is out of batch of size {}",
                image,
                outputs.batch_size()
            ))
        );

        let scores: Vec<f32> = outputs.image_cls_logits(image).collect();
        self.gather(&scores, |anchor_index| {
            outputs.box_output(image, anchor_index).ok_or_else(|| {
                Error::ShapeMismatch(format!("no box output for anchor {}", anchor_index)).into()
            })
        })
    }

    /// Select from already flattened `[num_anchors, num_classes]` logits and
    /// `[num_anchors, 4]` box outputs.
    pub fn select_flat(
        &self,
        cls_outputs: ArrayView2<f32>,
        box_outputs: ArrayView2<f32>,
    ) -> Result<Candidates> {
        let (num_anchors, num_classes) = cls_outputs.dim();
        ensure!(
            num_classes == self.num_classes,
            Error::ShapeMismatch(format!(
                "classification outputs have {} classes, but expect {}",
                num_classes, self.num_classes
            ))
        );
        ensure!(
            box_outputs.dim() == (num_anchors, 4),
            Error::ShapeMismatch(format!(
                "box outputs have shape {:?}, but expect [{}, 4]",
                box_outputs.shape(),
                num_anchors
            ))
        );

        let scores: Vec<f32> = cls_outputs.iter().copied().collect();
        self.gather(&scores, |anchor_index| {
            let row = box_outputs.row(anchor_index);
            Ok([row[0], row[1], row[2], row[3]])
        })
    }

    /// Select the candidates of every image in parallel.
    pub fn select_batch(&self, outputs: &HeadOutputs) -> Result<Vec<Candidates>> {
        (0..outputs.batch_size())
            .into_par_iter()
            .map(|image| self.select(outputs, image))
            .collect()
    }

    fn gather<F>(&self, scores: &[f32], mut box_output: F) -> Result<Candidates>
    where
        F: FnMut(usize) -> Result<[f32; 4]>,
    {
        let flat_indices = self.top_indices(scores)?;
        let mut candidates = Candidates {
            cls_topk: Vec::with_capacity(self.k),
            box_topk: Vec::with_capacity(self.k),
            anchor_indices: Vec::with_capacity(self.k),
            class_indices: Vec::with_capacity(self.k),
        };

        for flat_index in flat_indices {
            let anchor_index = flat_index / self.num_classes;
            let class_index = flat_index % self.num_classes;

            candidates.cls_topk.push(scores[flat_index]);
            candidates.box_topk.push(box_output(anchor_index)?);
            candidates.anchor_indices.push(anchor_index);
            candidates.class_indices.push(class_index);
        }

        Ok(candidates)
    }

    /// Flat indices of the `k` best scores, best first.
    ///
    /// Higher scores rank first and ties go to the lower flat index. When
    /// fewer than `k` scores exist, the lowest ranked one is repeated.
    fn top_indices(&self, scores: &[f32]) -> Result<Vec<usize>> {
        let k = self.k;
        ensure!(
            !scores.is_empty(),
            Error::InvalidInput("no candidate to select from".into())
        );
        ensure!(
            scores.iter().all(|score| !score.is_nan()),
            Error::NumericAnomaly("classification outputs contain NaN".into())
        );

        // NaN is rejected above, and -0.0 ties with 0.0
        let compare = |&lhs: &usize, &rhs: &usize| {
            scores[rhs]
                .partial_cmp(&scores[lhs])
                .unwrap_or(Ordering::Equal)
                .then(lhs.cmp(&rhs))
        };

        let mut indices: Vec<usize> = (0..scores.len()).collect();
        if indices.len() > k {
            indices.select_nth_unstable_by(k - 1, compare);
            indices.truncate(k);
        }
        indices.sort_unstable_by(compare);

        if indices.len() < k {
            debug!(
                "only {} candidates are available, padding to {}",
                indices.len(),
                k
            );
            let last = indices[indices.len() - 1];
            indices.resize(k, last);
        }

        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::prelude::*;

    fn selector(num_classes: usize, k: usize) -> TopKSelector {
        TopKSelectorInit { num_classes, k }.build().unwrap()
    }

    #[test]
    fn selects_highest_scores_in_order() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let num_anchors = 200;
        let num_classes = 3;
        let cls = Array2::from_shape_fn((num_anchors, num_classes), |_| rng.gen_range(-5.0f32..5.0));
        let boxes = Array2::from_shape_fn((num_anchors, 4), |(row, col)| (row * 4 + col) as f32);

        let candidates = selector(num_classes, 50).select_flat(cls.view(), boxes.view())?;
        assert_eq!(candidates.len(), 50);

        let mut expect: Vec<f32> = cls.iter().copied().collect();
        expect.sort_by(|lhs, rhs| rhs.total_cmp(lhs));
        assert_eq!(candidates.cls_topk, expect[..50].to_vec());

        for (logit, code, anchor_index, class_index) in candidates.iter() {
            assert!(class_index < num_classes);
            let flat_index = anchor_index * num_classes + class_index;
            assert_eq!(cls.iter().nth(flat_index).copied(), Some(logit));
            assert_eq!(code[0], (anchor_index * 4) as f32);
        }
        Ok(())
    }

    #[test]
    fn ties_prefer_lower_index() -> Result<()> {
        let cls = Array2::from_elem((10, 2), 1.0);
        let boxes = Array2::zeros((10, 4));
        let candidates = selector(2, 5).select_flat(cls.view(), boxes.view())?;

        assert_eq!(candidates.anchor_indices, vec![0, 0, 1, 1, 2]);
        assert_eq!(candidates.class_indices, vec![0, 1, 0, 1, 0]);
        Ok(())
    }

    #[test]
    fn signed_zeros_tie_by_index() -> Result<()> {
        let cls = Array2::from_shape_vec((2, 1), vec![-0.0, 0.0])?;
        let boxes = Array2::zeros((2, 4));
        let candidates = selector(1, 1).select_flat(cls.view(), boxes.view())?;
        assert_eq!(candidates.anchor_indices, vec![0]);
        Ok(())
    }

    #[test]
    fn pads_with_lowest_scoring_candidate() -> Result<()> {
        let cls = Array2::from_shape_vec((2, 2), vec![0.5, -1.0, 2.0, 0.0])?;
        let boxes = Array2::zeros((2, 4));
        let candidates = selector(2, 6).select_flat(cls.view(), boxes.view())?;

        assert_eq!(candidates.len(), 6);
        assert_eq!(candidates.cls_topk, vec![2.0, 0.5, 0.0, -1.0, -1.0, -1.0]);
        assert_eq!(candidates.anchor_indices, vec![1, 0, 1, 0, 0, 0]);
        assert_eq!(candidates.class_indices, vec![0, 0, 1, 1, 1, 1]);
        Ok(())
    }

    #[test]
    fn rejects_empty_and_mismatched_inputs() {
        let err = selector(2, 4)
            .select_flat(Array2::<f32>::zeros((0, 2)).view(), Array2::<f32>::zeros((0, 4)).view())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidInput(_))
        ));

        let err = selector(2, 4)
            .select_flat(Array2::<f32>::zeros((3, 2)).view(), Array2::<f32>::zeros((2, 4)).view())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch(_))
        ));
    }
}
