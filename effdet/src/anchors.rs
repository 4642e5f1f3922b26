//! Multi-level anchor generation.

use crate::common::*;

/// Anchor generator configuration.
#[derive(Debug, Clone)]
pub struct AnchorsInit {
    pub min_level: usize,
    pub max_level: usize,
    pub num_scales: usize,
    /// `(width, height)` multipliers.
    pub aspect_ratios: Vec<(R64, R64)>,
    pub anchor_scale: R64,
    pub image_size: usize,
    pub clip: bool,
}

impl AnchorsInit {
    /// Generate the anchor set.
    ///
    /// Anchors are concatenated level by level. Within a level they run over
    /// grid rows, then columns, then octave scales, then aspect ratios. This is
    /// the order in which an NHWC head output flattens.
    pub fn build(self) -> Result<Anchors> {
        let Self {
            min_level,
            max_level,
            num_scales,
            aspect_ratios,
            anchor_scale,
            image_size,
            clip,
        } = self;

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

        let anchors_per_cell = num_scales * aspect_ratios.len();
        let image_extent = image_size as f64;
        let mut levels = Vec::with_capacity(max_level + 1 - min_level);
        let mut boxes = vec![];

        for level in min_level..=max_level {
            let stride = 1usize << level;
            ensure!(
                image_size % stride == 0,
                Error::Config(format!(
                    "image_size ({}) must be divisible by the stride ({}) of level {}",
                    image_size, stride, level
                ))
            );
            let grid_size = image_size / stride;

            // per-cell half extents in (height, width)
            let half_sizes: Vec<(f64, f64)> = (0..num_scales)
                .flat_map(|octave| {
                    let octave_scale = 2f64.powf(octave as f64 / num_scales as f64);
                    let base_size = anchor_scale.raw() * stride as f64 * octave_scale;
                    aspect_ratios
                        .iter()
                        .map(move |&(ratio_w, ratio_h)| {
                            (base_size * ratio_h.raw() / 2.0, base_size * ratio_w.raw() / 2.0)
                        })
                })
                .collect();

            let offset = boxes.len();
            for row in 0..grid_size {
                let cy = (row as f64 + 0.5) * stride as f64;

                for col in 0..grid_size {
                    let cx = (col as f64 + 0.5) * stride as f64;

                    for &(half_h, half_w) in &half_sizes {
                        let mut tlbr = [cy - half_h, cx - half_w, cy + half_h, cx + half_w];
                        if clip {
                            tlbr.iter_mut()
                                .for_each(|coord| *coord = coord.max(0.0).min(image_extent));
                        }
                        let [t, l, b, r] = tlbr;
                        boxes.push(TLBR::try_from_tlbr([t as f32, l as f32, b as f32, r as f32])?);
                    }
                }
            }

            levels.push(LevelInfo {
                level,
                stride,
                grid_h: grid_size,
                grid_w: grid_size,
                anchors_per_cell,
                offset,
            });
        }

        info!(
            "built {} anchors over levels {}..={} ({})",
            boxes.len(),
            min_level,
            max_level,
            levels
                .iter()
                .map(|info| format!("P{}: {}", info.level, info.num_anchors()))
                .join(", ")
        );

        Ok(Anchors {
            levels,
            boxes,
            image_size,
        })
    }
}

/// The anchor layout of one feature level.
#[derive(Debug, Clone, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct LevelInfo {
    level: usize,
    stride: usize,
    grid_h: usize,
    grid_w: usize,
    anchors_per_cell: usize,
    /// The flat index of the first anchor of this level.
    offset: usize,
}

impl LevelInfo {
    pub fn num_cells(&self) -> usize {
        self.grid_h * self.grid_w
    }

    pub fn num_anchors(&self) -> usize {
        self.num_cells() * self.anchors_per_cell
    }

    /// The flat indices covered by this level.
    pub fn anchor_range(&self) -> std::ops::Range<usize> {
        self.offset..(self.offset + self.num_anchors())
    }

    /// Split a level-local anchor index into `(row, col, variant)`.
    pub fn locate(&self, local_index: usize) -> (usize, usize, usize) {
        let cell = local_index / self.anchors_per_cell;
        let variant = local_index % self.anchors_per_cell;
        (cell / self.grid_w, cell % self.grid_w, variant)
    }
}

/// The immutable anchor set of a configuration.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct Anchors {
    /// Per-level layout in increasing level order.
    #[getset(get = "pub")]
    levels: Vec<LevelInfo>,
    /// All anchors in flat index order.
    #[getset(get = "pub")]
    boxes: Vec<TLBR<f32>>,
    image_size: usize,
}

impl Anchors {
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn num_anchors(&self) -> usize {
        self.boxes.len()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn anchors_per_cell(&self) -> usize {
        self.levels[0].anchors_per_cell
    }

    pub fn get(&self, index: usize) -> Option<&TLBR<f32>> {
        self.boxes.get(index)
    }

    /// The level that owns a flat anchor index.
    pub fn level_of(&self, index: usize) -> Option<&LevelInfo> {
        let pos = self
            .levels
            .partition_point(|info| info.offset + info.num_anchors() <= index);
        self.levels.get(pos)
    }
}
