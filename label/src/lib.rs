//! Class-labeled rectangles.

use bbox::Rect;

/// A rectangle tagged with its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label<R, C>
where
    R: Rect,
{
    pub rect: R,
    pub class: C,
}

impl<R, C> Label<R, C>
where
    R: Rect,
{
    pub fn new(rect: R, class: C) -> Self {
        Self { rect, class }
    }
}
