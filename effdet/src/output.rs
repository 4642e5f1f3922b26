//! Raw per-level head outputs and their shape contract.

use crate::{common::*, Anchors, LevelInfo};

/// The classification and box-regression outputs of a batch, one array per level.
///
/// Arrays are NHWC: classification is `[batch, h, w, anchors_per_cell * num_classes]`
/// and box regression is `[batch, h, w, anchors_per_cell * 4]`. Flattening one
/// image in logical order yields the anchor order of [Anchors].
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct HeadOutputs {
    #[derivative(Debug = "ignore")]
    cls: Vec<Array4<f32>>,
    #[derivative(Debug = "ignore")]
    boxes: Vec<Array4<f32>>,
    levels: Vec<LevelInfo>,
    num_classes: usize,
    batch_size: usize,
}

impl HeadOutputs {
    pub fn new(
        cls: Vec<Array4<f32>>,
        boxes: Vec<Array4<f32>>,
        anchors: &Anchors,
        num_classes: usize,
    ) -> Result<Self> {
        let num_levels = anchors.num_levels();
        ensure!(
            cls.len() == num_levels && boxes.len() == num_levels,
            Error::ShapeMismatch(format!(
                "expect {} levels, but get {} classification and {} box outputs",
                num_levels,
                cls.len(),
                boxes.len()
            ))
        );
        ensure!(
            num_classes > 0,
            Error::Config("num_classes must be positive".into())
        );

        let batch_size = cls[0].shape()[0];

        for (info, cls_level, box_level) in izip!(anchors.levels(), &cls, &boxes) {
            let (grid_h, grid_w, anchors_per_cell) =
                (info.grid_h(), info.grid_w(), info.anchors_per_cell());
            let expect_cls = [batch_size, grid_h, grid_w, anchors_per_cell * num_classes];
            let expect_box = [batch_size, grid_h, grid_w, anchors_per_cell * 4];

            ensure!(
                cls_level.shape() == expect_cls,
                Error::ShapeMismatch(format!(
                    "classification output of level {} has shape {:?}, but expect {:?}",
                    info.level(),
                    cls_level.shape(),
                    expect_cls
                ))
            );
            ensure!(
                box_level.shape() == expect_box,
                Error::ShapeMismatch(format!(
                    "box output of level {} has shape {:?}, but expect {:?}",
                    info.level(),
                    box_level.shape(),
                    expect_box
                ))
            );
        }

        let standardize = |array: Array4<f32>| {
            if array.is_standard_layout() {
                array
            } else {
                array.as_standard_layout().into_owned()
            }
        };

        Ok(Self {
            cls: cls.into_iter().map(standardize).collect(),
            boxes: boxes.into_iter().map(standardize).collect(),
            levels: anchors.levels().clone(),
            num_classes,
            batch_size,
        })
    }

    /// Build from NCHW arrays, the layout most convolution backends emit.
    pub fn from_nchw(
        cls: Vec<Array4<f32>>,
        boxes: Vec<Array4<f32>>,
        anchors: &Anchors,
        num_classes: usize,
    ) -> Result<Self> {
        let to_nhwc = |array: Array4<f32>| array.permuted_axes([0, 2, 3, 1]);
        Self::new(
            cls.into_iter().map(to_nhwc).collect(),
            boxes.into_iter().map(to_nhwc).collect(),
            anchors,
            num_classes,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_anchors(&self) -> usize {
        self.levels.iter().map(|info| info.num_anchors()).sum()
    }

    pub fn cls_outputs(&self) -> &[Array4<f32>] {
        &self.cls
    }

    pub fn box_outputs(&self) -> &[Array4<f32>] {
        &self.boxes
    }

    /// Classification logits of one image in flat `anchor * num_classes + class` order.
    pub fn image_cls_logits(&self, image: usize) -> impl Iterator<Item = f32> + '_ {
        self.cls
            .iter()
            .flat_map(move |level| level.index_axis(Axis(0), image).into_iter().copied())
    }

    /// Box regression outputs of one image, one entry per anchor in flat order.
    pub fn image_box_outputs(&self, image: usize) -> impl Iterator<Item = [f32; 4]> + '_ {
        self.boxes.iter().flat_map(move |level| {
            level
                .index_axis(Axis(0), image)
                .into_iter()
                .copied()
                .tuples()
                .map(|(dy, dx, dh, dw)| [dy, dx, dh, dw])
        })
    }

    /// The box regression output of a single anchor.
    pub fn box_output(&self, image: usize, anchor_index: usize) -> Option<[f32; 4]> {
        if image >= self.batch_size {
            return None;
        }

        let level_index = self
            .levels
            .partition_point(|info| info.offset() + info.num_anchors() <= anchor_index);
        let info = self.levels.get(level_index)?;
        let (row, col, variant) = info.locate(anchor_index - info.offset());
        let level = &self.boxes[level_index];

        let mut code = [0.0; 4];
        for (k, value) in code.iter_mut().enumerate() {
            *value = level[[image, row, col, variant * 4 + k]];
        }
        Some(code)
    }
}
