//! The `(dy, dx, dh, dw)` box encoding relative to an anchor.

use crate::common::*;

/// Guards the divisions and logarithms of the encoding against empty boxes.
const EPSILON: f32 = 1e-8;

/// Encode `target` as offsets relative to `anchor`.
///
/// Center offsets are normalized by the anchor size and sizes are encoded as
/// log ratios.
pub fn encode(anchor: &TLBR<f32>, target: &TLBR<f32>) -> [f32; 4] {
    let [cya, cxa, ha, wa] = anchor.cycxhw();
    let [cy, cx, h, w] = target.cycxhw();
    let ha = ha + EPSILON;
    let wa = wa + EPSILON;
    let h = h + EPSILON;
    let w = w + EPSILON;

    let dy = (cy - cya) / ha;
    let dx = (cx - cxa) / wa;
    let dh = (h / ha).ln();
    let dw = (w / wa).ln();
    [dy, dx, dh, dw]
}

/// Apply offsets produced by [encode] to `anchor`.
pub fn decode(anchor: &TLBR<f32>, code: [f32; 4]) -> Result<TLBR<f32>> {
    let [cya, cxa, ha, wa] = anchor.cycxhw();
    let [dy, dx, dh, dw] = code;

    let cy = dy * ha + cya;
    let cx = dx * wa + cxa;
    let h = dh.exp() * ha;
    let w = dw.exp() * wa;

    ensure!(
        [cy, cx, h, w].iter().all(|value| !value.is_nan()),
        Error::NumericAnomaly(format!("decoding {:?} produced NaN", code))
    );
    TLBR::try_from_cycxhw([cy, cx, h, w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assert_rect_eq(lhs: &TLBR<f32>, rhs: &TLBR<f32>, epsilon: f32) {
        for (lhs, rhs) in izip!(lhs.tlbr(), rhs.tlbr()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = epsilon);
        }
    }

    #[test]
    fn identical_box_encodes_to_zero() -> Result<()> {
        let anchor = TLBR::try_from_tlbr([-12.0, -12.0, 20.0, 20.0])?;
        let code = encode(&anchor, &anchor);
        for value in code {
            assert_abs_diff_eq!(value, 0.0, epsilon = 1e-6);
        }
        assert_rect_eq(&decode(&anchor, code)?, &anchor, 1e-4);
        Ok(())
    }

    #[test]
    fn round_trip_over_box_sizes() -> Result<()> {
        let anchors = [
            TLBR::try_from_tlbr([-12.0, -12.0, 20.0, 20.0])?,
            TLBR::try_from_tlbr([100.0, 80.0, 164.0, 208.0])?,
            TLBR::try_from_tlbr([-200.0, -200.0, 312.0, 312.0])?,
        ];
        let targets = [
            TLBR::try_from_tlbr([100.0, 100.0, 200.0, 200.0])?,
            TLBR::try_from_tlbr([0.0, 0.0, 512.0, 512.0])?,
            TLBR::try_from_tlbr([250.0, 250.0, 252.0, 253.0])?,
            TLBR::try_from_tlbr([10.0, 300.0, 11.0, 480.0])?,
        ];

        for anchor in &anchors {
            for target in &targets {
                let decoded = decode(anchor, encode(anchor, target))?;
                assert_rect_eq(&decoded, target, 1e-2);
            }
        }
        Ok(())
    }

    #[test]
    fn offsets_are_normalized_by_anchor_size() -> Result<()> {
        let anchor = TLBR::try_from_tlbr([0.0, 0.0, 10.0, 20.0])?;
        let target = TLBR::try_from_tlbr([5.0, 10.0, 25.0, 30.0])?;
        let [dy, dx, dh, dw] = encode(&anchor, &target);
        assert_abs_diff_eq!(dy, 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(dx, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(dh, 2f32.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(dw, 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn nan_offsets_are_reported() -> Result<()> {
        let anchor = TLBR::try_from_tlbr([0.0, 0.0, 10.0, 10.0])?;
        let err = decode(&anchor, [f32::NAN, 0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NumericAnomaly(_))
        ));
        Ok(())
    }
}
