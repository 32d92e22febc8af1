use serde::{Deserialize, Serialize};

/// Inclusive channel range in the device's channel numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub min: usize,
    pub max: usize,
}

impl ChannelRange {
    pub fn new(min: usize, max: usize) -> Result<Self, String> {
        if min > max {
            return Err(format!("{min}..{max}: bad channel range"));
        }
        Ok(Self { min, max })
    }

    pub fn count(&self) -> usize {
        self.max - self.min + 1
    }
}

/// Gain unit: Q15 fixed point, 1.0 == `1 << GAIN_SHIFT`.
pub const GAIN_SHIFT: u32 = 15;
pub const GAIN_UNIT: i32 = 1 << GAIN_SHIFT;

/// Maps a channel subrange of an interleaved native buffer onto a
/// subrange of another. The four ranges given to `new` are intersected
/// once; `copy`/`add` then touch only the intersection and never write
/// outside the declared output subrange. Join and expand are not handled
/// here: the slot composes them from several mappers at increasing
/// offsets.
#[derive(Debug, Clone, Copy)]
pub struct ChannelMapper {
    /// channels per input frame
    inch: usize,
    /// channels per output frame
    onch: usize,
    /// first mapped channel, as offsets inside each frame
    istart: usize,
    ostart: usize,
    /// intersection width; 0 disables the mapper
    nch: usize,
}

impl ChannelMapper {
    pub fn new(
        ibuf: ChannelRange,
        isub: ChannelRange,
        obuf: ChannelRange,
        osub: ChannelRange,
    ) -> Self {
        let cmin = ibuf.min.max(isub.min).max(obuf.min).max(osub.min);
        let cmax = ibuf.max.min(isub.max).min(obuf.max).min(osub.max);
        Self {
            inch: ibuf.count(),
            onch: obuf.count(),
            istart: cmin.saturating_sub(ibuf.min),
            ostart: cmin.saturating_sub(obuf.min),
            nch: if cmax >= cmin { cmax - cmin + 1 } else { 0 },
        }
    }

    /// Direct construction for join/expand passes, where the slot has
    /// already resolved the offsets.
    pub(crate) fn with_offsets(
        inch: usize,
        onch: usize,
        istart: usize,
        ostart: usize,
        nch: usize,
    ) -> Self {
        Self {
            inch,
            onch,
            istart,
            ostart,
            nch,
        }
    }

    pub fn channels(&self) -> usize {
        self.nch
    }

    /// Overwrite the mapped output channels with the scaled input.
    /// Output channels outside the intersection are left untouched.
    pub fn copy(&self, input: &[i32], output: &mut [i32], gain: i32, frames: usize) {
        if self.nch == 0 {
            return;
        }
        for f in 0..frames {
            let i = f * self.inch + self.istart;
            let o = f * self.onch + self.ostart;
            for c in 0..self.nch {
                output[o + c] = ((input[i + c] as i64 * gain as i64) >> GAIN_SHIFT) as i32;
            }
        }
    }

    /// Sum the scaled input into the mapped output channels, saturating
    /// to the native range.
    pub fn add(&self, input: &[i32], output: &mut [i32], gain: i32, frames: usize) {
        if self.nch == 0 {
            return;
        }
        for f in 0..frames {
            let i = f * self.inch + self.istart;
            let o = f * self.onch + self.ostart;
            for c in 0..self.nch {
                let v = output[o + c] as i64
                    + ((input[i + c] as i64 * gain as i64) >> GAIN_SHIFT);
                output[o + c] = v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelMapper, ChannelRange, GAIN_UNIT};

    fn cr(min: usize, max: usize) -> ChannelRange {
        ChannelRange::new(min, max).unwrap()
    }

    #[test]
    fn intersection_never_negative() {
        let m = ChannelMapper::new(cr(0, 1), cr(4, 5), cr(0, 7), cr(0, 7));
        assert_eq!(m.channels(), 0);
        let mut out = [5i32; 8];
        m.copy(&[1, 2], &mut out, GAIN_UNIT, 1);
        assert_eq!(out, [5; 8]);
    }

    #[test]
    fn copy_stays_inside_output_subrange() {
        // stereo stream holding device channels 2..3, 8-channel device,
        // output restricted to 2..2
        let m = ChannelMapper::new(cr(2, 3), cr(2, 3), cr(0, 7), cr(2, 2));
        assert_eq!(m.channels(), 1);
        let input = [111, 222, 333, 444];
        let mut out = [0i32; 16];
        m.copy(&input, &mut out, GAIN_UNIT, 2);
        assert_eq!(out[2], 111);
        assert_eq!(out[10], 333);
        assert!(
            out.iter()
                .enumerate()
                .all(|(i, &s)| s == 0 || i % 8 == 2)
        );
    }

    #[test]
    fn add_saturates() {
        let m = ChannelMapper::new(cr(0, 0), cr(0, 0), cr(0, 0), cr(0, 0));
        let mut out = [i32::MAX - 10];
        m.add(&[100], &mut out, GAIN_UNIT, 1);
        assert_eq!(out[0], i32::MAX);
        let mut out = [i32::MIN + 10];
        m.add(&[-100], &mut out, GAIN_UNIT, 1);
        assert_eq!(out[0], i32::MIN);
    }

    #[test]
    fn gain_scales_by_unit_fraction() {
        let m = ChannelMapper::new(cr(0, 1), cr(0, 1), cr(0, 1), cr(0, 1));
        let mut out = [0i32; 4];
        m.add(&[4096, -4096, 100, -100], &mut out, GAIN_UNIT / 2, 2);
        assert_eq!(out[0], 2048);
        assert_eq!(out[1], -2048);
    }
}
