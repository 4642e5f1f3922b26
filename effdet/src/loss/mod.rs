//! Training losses.

mod cross_entropy;
mod detection_loss;
mod focal_loss;
mod huber_loss;

pub use cross_entropy::*;
pub use detection_loss::*;
pub use focal_loss::*;
pub use huber_loss::*;
