pub use crate::error::Error;
pub use anyhow::{bail, ensure, Context as _, Result};
pub use bbox::{prelude::*, Transform, HW, TLBR};
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use itertools::{izip, Itertools as _};
pub use label::Label;
pub use log::{debug, info};
pub use ndarray::{Array2, Array4, ArrayView1, ArrayView2, Axis};
pub use noisy_float::prelude::*;
pub use rayon::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    cmp::Ordering,
    collections::BTreeMap,
    iter,
    path::Path,
    sync::Arc,
};
