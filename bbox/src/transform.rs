use super::TLBR;
use crate::common::*;

/// Axis-aligned affine transform `y' = y * sy + ty`, `x' = x * sx + tx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transform<T> {
    pub sy: T,
    pub sx: T,
    pub ty: T,
    pub tx: T,
}

impl<T> Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    /// Uniform scaling about the origin.
    pub fn try_from_scale(scale: T) -> Result<Self> {
        ensure!(scale > T::zero(), "scaling factor must be positive");
        Ok(Self {
            sy: scale,
            sx: scale,
            ty: T::zero(),
            tx: T::zero(),
        })
    }
}

impl<T> Mul<&TLBR<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = TLBR<T>;

    fn mul(self, rhs: &TLBR<T>) -> Self::Output {
        rhs.transform(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Rect, RectNum};

    #[test]
    fn scale_rect() -> Result<()> {
        let rect = TLBR::try_from_tlbr([10.0, 20.0, 30.0, 60.0])?;
        let scaled = &Transform::try_from_scale(0.5)? * &rect;
        assert_eq!(scaled.tlbr(), [5.0, 10.0, 15.0, 30.0]);
        Ok(())
    }

    #[test]
    fn uniform_scale_rejects_non_positive() {
        assert!(Transform::try_from_scale(0.0).is_err());
        assert!(Transform::try_from_scale(-2.0).is_err());
    }
}
