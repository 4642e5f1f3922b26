use super::Rect;
use crate::{common::*, Transform};

/// Bounding box in TLBR format, that is `(y1, x1, y2, x2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> TLBR<T>
where
    T: Copy + Num,
{
    pub fn transform(&self, transform: &Transform<T>) -> Self {
        TLBR {
            t: self.t * transform.sy + transform.ty,
            l: self.l * transform.sx + transform.tx,
            b: self.b * transform.sy + transform.ty,
            r: self.r * transform.sx + transform.tx,
        }
    }
}

impl<T> Rect for TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        self.t
    }

    fn l(&self) -> Self::Type {
        self.l
    }

    fn b(&self) -> Self::Type {
        self.b
    }

    fn r(&self) -> Self::Type {
        self.r
    }

    fn cy(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.t + self.h() / two
    }

    fn cx(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.l + self.w() / two
    }

    fn h(&self) -> Self::Type {
        self.b - self.t
    }

    fn w(&self) -> Self::Type {
        self.r - self.l
    }

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(h >= zero && w >= zero, "h and w must be non-negative");

        let two = T::one() + T::one();
        let t = cy - h / two;
        let b = cy + h / two;
        let l = cx - w / two;
        let r = cx + w / two;

        Ok(Self { t, l, b, r })
    }

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");

        Ok(Self { t, l, b, r })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum;

    #[test]
    fn tlbr_from_cycxhw() -> Result<()> {
        let tlbr = TLBR::try_from_cycxhw([20.0, 40.0, 20.0, 40.0])?;
        assert_eq!(tlbr.tlbr(), [10.0, 20.0, 30.0, 60.0]);
        assert_eq!(tlbr.cycxhw(), [20.0, 40.0, 20.0, 40.0]);
        Ok(())
    }

    #[test]
    fn negative_size_is_rejected() {
        assert!(TLBR::try_from_cycxhw([0.0, 0.0, -1.0, 1.0]).is_err());
        assert!(TLBR::try_from_tlbr([10.0, 0.0, 5.0, 1.0]).is_err());
    }
}
