use super::{HW, TLBR};
use crate::common::*;

/// The generic rectangle.
pub trait Rect {
    type Type;

    fn t(&self) -> Self::Type;
    fn l(&self) -> Self::Type;
    fn b(&self) -> Self::Type;
    fn r(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn h(&self) -> Self::Type;
    fn w(&self) -> Self::Type;

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cycxhw(cycxhw: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn cycxhw(&self) -> [Self::Type; 4] {
        [self.cy(), self.cx(), self.h(), self.w()]
    }

    fn tlbr(&self) -> [Self::Type; 4] {
        [self.t(), self.l(), self.b(), self.r()]
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.h() * self.w()
    }

    /// Returns true if the rectangle covers no area.
    fn is_empty(&self) -> bool {
        let zero = Self::Type::zero();
        !(self.h() > zero && self.w() > zero)
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    /// Compute the intersection in TLBR format, or `None` if the rectangles do not overlap.
    fn intersect_with<R>(&self, other: &R) -> Option<TLBR<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let t = self.t().max(other.t());
        let l = self.l().max(other.l());
        let b = self.b().min(other.b());
        let r = self.r().min(other.r());
        (b > t && r > l).then(|| TLBR { t, l, b, r })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    /// Intersection over union. Two rectangles with an empty union have zero IoU.
    fn iou_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let zero = Self::Type::zero();
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.h() * other.w() - inter_area;

        if union_area > zero {
            inter_area / union_area
        } else {
            zero
        }
    }

    /// Clamp the rectangle into `[0, h] x [0, w]`.
    fn clip_to(&self, bounds: &HW<Self::Type>) -> TLBR<Self::Type> {
        let zero = Self::Type::zero();
        let clamp = |value: Self::Type, upper: Self::Type| value.max(zero).min(upper);

        TLBR {
            t: clamp(self.t(), bounds.h()),
            l: clamp(self.l(), bounds.w()),
            b: clamp(self.b(), bounds.h()),
            r: clamp(self.r(), bounds.w()),
        }
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}
