use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Wire encoding negotiated by a client or required by the hardware.
/// The engine itself always works on full-scale interleaved `i32`
/// samples; everything variable lives here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Encoding {
    pub bits: u32,
    pub bps: u32,
    pub sig: bool,
    pub le: bool,
    pub msb: bool,
}

impl Encoding {
    pub fn new(bits: u32, bps: u32, sig: bool, le: bool, msb: bool) -> Result<Self, String> {
        if bits == 0 || bits > 32 {
            return Err(format!("{bits}: bits per sample out of range"));
        }
        if bps < bits.div_ceil(8) || bps > 4 {
            return Err(format!("{bps}: bytes per sample unusable for {bits} bits"));
        }
        Ok(Self {
            bits,
            bps,
            sig,
            le,
            msb,
        })
    }

    /// Signed native-endian 16-bit, the usual client default.
    pub fn s16_ne() -> Self {
        Self {
            bits: 16,
            bps: 2,
            sig: true,
            le: cfg!(target_endian = "little"),
            msb: false,
        }
    }

    pub fn frame_size(&self, nch: usize) -> usize {
        self.bps as usize * nch
    }
}

impl Default for Encoding {
    fn default() -> Self {
        Self::s16_ne()
    }
}

/// Stateless sample transcoder between one wire encoding and native
/// `i32`. Shift amounts and the unsigned bias are fixed when the slot or
/// device is configured; the per-sample work is shift/bias arithmetic
/// only.
#[derive(Debug, Clone, Copy)]
pub struct SampleCodec {
    bps: usize,
    le: bool,
    /// native <-> wire scale: 32 - bits
    shift: u32,
    /// position of the value inside the wire word (MSB justification)
    jshift: u32,
    /// 2^(bits-1) for unsigned encodings, 0 for signed
    bias: i64,
    mask: u64,
    sign_shift: u32,
    sig: bool,
}

impl SampleCodec {
    pub fn new(enc: &Encoding) -> Self {
        Self {
            bps: enc.bps as usize,
            le: enc.le,
            shift: 32 - enc.bits,
            jshift: if enc.msb { enc.bps * 8 - enc.bits } else { 0 },
            bias: if enc.sig { 0 } else { 1i64 << (enc.bits - 1) },
            mask: u64::MAX >> (64 - enc.bits),
            sign_shift: 64 - enc.bits,
            sig: enc.sig,
        }
    }

    pub fn sample_size(&self) -> usize {
        self.bps
    }

    /// Convert wire samples to native. Returns samples converted, bounded
    /// by both buffers. Allocation-free.
    pub fn decode(&self, src: &[u8], dst: &mut [i32]) -> usize {
        let count = dst.len().min(src.len() / self.bps);
        for (i, out) in dst.iter_mut().enumerate().take(count) {
            let o = i * self.bps;
            let word = if self.le {
                LittleEndian::read_uint(&src[o..o + self.bps], self.bps)
            } else {
                BigEndian::read_uint(&src[o..o + self.bps], self.bps)
            };
            let v = (word >> self.jshift) & self.mask;
            let s = if self.sig {
                ((v << self.sign_shift) as i64) >> self.sign_shift
            } else {
                v as i64 - self.bias
            };
            *out = (s << self.shift) as i32;
        }
        count
    }

    /// Convert native samples to the wire encoding. Quantization drops
    /// the low `32 - bits` bits, rounding toward zero.
    pub fn encode(&self, src: &[i32], dst: &mut [u8]) -> usize {
        let count = src.len().min(dst.len() / self.bps);
        let round = (1i64 << self.shift) - 1;
        for (i, &sample) in src.iter().enumerate().take(count) {
            let mut s = sample as i64;
            if s < 0 {
                s += round;
            }
            let v = ((s >> self.shift) + self.bias) as u64 & self.mask;
            let o = i * self.bps;
            if self.le {
                LittleEndian::write_uint(&mut dst[o..o + self.bps], v << self.jshift, self.bps);
            } else {
                BigEndian::write_uint(&mut dst[o..o + self.bps], v << self.jshift, self.bps);
            }
        }
        count
    }

    /// Write the wire representation of native zero, without needing a
    /// native buffer. For unsigned encodings this is the bias pattern.
    pub fn silence(&self, dst: &mut [u8]) -> usize {
        let count = dst.len() / self.bps;
        let v = (self.bias as u64) << self.jshift;
        for i in 0..count {
            let o = i * self.bps;
            if self.le {
                LittleEndian::write_uint(&mut dst[o..o + self.bps], v, self.bps);
            } else {
                BigEndian::write_uint(&mut dst[o..o + self.bps], v, self.bps);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::{Encoding, SampleCodec};

    fn roundtrip(enc: &Encoding, values: &[i32]) {
        let codec = SampleCodec::new(enc);
        let mut wire = vec![0u8; values.len() * enc.bps as usize];
        let mut back = vec![0i32; values.len()];
        assert_eq!(codec.encode(values, &mut wire), values.len());
        assert_eq!(codec.decode(&wire, &mut back), values.len());
        let shift = 32 - enc.bits;
        for (&x, &y) in values.iter().zip(back.iter()) {
            // quantization is toward zero, dropping the low bits
            let q = if x < 0 && shift > 0 {
                ((x as i64 + ((1i64 << shift) - 1)) >> shift << shift) as i32
            } else {
                x >> shift << shift
            };
            assert_eq!(y, q, "format {enc:?} value {x}");
            assert!(q.unsigned_abs() <= x.unsigned_abs());
        }
    }

    #[test]
    fn rejects_bad_descriptors() {
        assert!(Encoding::new(0, 1, true, true, false).is_err());
        assert!(Encoding::new(33, 4, true, true, false).is_err());
        assert!(Encoding::new(24, 2, true, true, false).is_err());
        assert!(Encoding::new(16, 5, true, true, false).is_err());
        assert!(Encoding::new(24, 3, true, false, true).is_ok());
    }

    #[test]
    fn roundtrip_exact_and_truncated() {
        let values = [
            0,
            1,
            -1,
            0x1234_5678,
            -0x1234_5678,
            i32::MAX,
            i32::MIN,
            0x0001_0000,
            -0x0001_0000,
        ];
        for &(bits, bps) in &[(8u32, 1u32), (16, 2), (24, 3), (24, 4), (32, 4)] {
            for &sig in &[true, false] {
                for &le in &[true, false] {
                    for &msb in &[false, true] {
                        let enc = Encoding::new(bits, bps, sig, le, msb).unwrap();
                        roundtrip(&enc, &values);
                    }
                }
            }
        }
    }

    #[test]
    fn odd_width_roundtrip() {
        // widths that don't fall on byte boundaries still round-trip
        let enc = Encoding::new(20, 3, true, true, true).unwrap();
        roundtrip(&enc, &[0, 4096, -4096, i32::MAX, i32::MIN]);
    }

    #[test]
    fn silence_is_native_zero() {
        for &sig in &[true, false] {
            let enc = Encoding::new(16, 2, sig, true, false).unwrap();
            let codec = SampleCodec::new(&enc);
            let mut wire = vec![0xAAu8; 8];
            assert_eq!(codec.silence(&mut wire), 4);
            let mut native = [1i32; 4];
            codec.decode(&wire, &mut native);
            assert_eq!(native, [0; 4]);
        }
    }
}
