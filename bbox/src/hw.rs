use crate::common::*;

/// The height and width of an image or a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HW<T> {
    h: T,
    w: T,
}

impl<T> HW<T>
where
    T: Num + PartialOrd + Copy,
{
    pub fn try_from_hw(hw: [T; 2]) -> Result<Self> {
        let [h, w] = hw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "height and width parameters must be non-negative"
        );
        Ok(Self { h, w })
    }

    pub fn area(&self) -> T {
        self.w * self.h
    }

    pub fn h(&self) -> T {
        self.h
    }

    pub fn w(&self) -> T {
        self.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn size_area() -> Result<()> {
        let size = HW::try_from_hw([3.0, 2.0])?;
        let area: f64 = size.area();
        assert_abs_diff_eq!(area, 6.0);
        assert!(HW::try_from_hw([-1.0, 2.0]).is_err());
        Ok(())
    }
}
