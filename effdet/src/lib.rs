//! Anchor-based detection post-processing and training targets for EfficientDet-style models.

mod common;
pub mod anchors;
pub mod bench;
pub mod box_coder;
pub mod config;
pub mod detection;
pub mod error;
pub mod labeler;
pub mod loss;
pub mod output;
pub mod topk;

pub use anchors::*;
pub use bench::*;
pub use config::Config;
pub use detection::*;
pub use error::Error;
pub use labeler::*;
pub use loss::*;
pub use output::*;
pub use topk::*;
