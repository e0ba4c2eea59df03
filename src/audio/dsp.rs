//! Sample format conversion, DC offset removal and gain
//!
//! Everything here works on little-endian PCM and clamps to the signed
//! 16-bit range. Only the DC estimator carries state across frames.

use serde::{Deserialize, Serialize};

/// Smoothing factor of the DC estimator (time constant ≈ 64 ms at 16 kHz)
const DC_ALPHA: f32 = 1.0 / 1024.0;

/// Width of one captured sample as delivered by the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleWidth {
    /// Signed 16-bit little-endian
    #[default]
    S16,
    /// Signed 32-bit little-endian, audio in the upper 16 bits
    S32,
}

impl SampleWidth {
    /// Bytes per sample
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::S16 => 2,
            SampleWidth::S32 => 4,
        }
    }
}

/// Decode s16le bytes into samples. Returns the number of samples written.
pub fn decode_s16le(bytes: &[u8], out: &mut [i16]) -> usize {
    let n = (bytes.len() / 2).min(out.len());
    for (sample, chunk) in out[..n].iter_mut().zip(bytes.chunks_exact(2)) {
        *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
    }
    n
}

/// Encode samples as s16le bytes. Returns the number of bytes written.
pub fn encode_s16le(samples: &[i16], out: &mut [u8]) -> usize {
    let n = samples.len().min(out.len() / 2);
    for (chunk, sample) in out.chunks_exact_mut(2).zip(&samples[..n]) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
    n * 2
}

/// Narrow a 32-bit capture sample to 16-bit precision
#[inline]
pub fn narrow_s32(sample: i32) -> i16 {
    (sample >> 16) as i16
}

/// Decode raw capture bytes of the given width into 16-bit samples
pub fn decode_capture(raw: &[u8], width: SampleWidth, out: &mut [i16]) -> usize {
    match width {
        SampleWidth::S16 => decode_s16le(raw, out),
        SampleWidth::S32 => {
            let n = (raw.len() / 4).min(out.len());
            for (sample, chunk) in out[..n].iter_mut().zip(raw.chunks_exact(4)) {
                *sample = narrow_s32(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            n
        }
    }
}

/// Multiply and clamp to the signed 16-bit range
#[inline]
pub fn apply_gain(sample: i32, gain: f32) -> i16 {
    let scaled = sample as f32 * gain;
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Apply `gain` to every sample in place. A gain of exactly 1.0 is a no-op.
pub fn apply_gain_in_place(samples: &mut [i16], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples {
        *sample = apply_gain(*sample as i32, gain);
    }
}

/// Scale s16le bytes in place (speaker volume)
pub fn scale_s16le_in_place(bytes: &mut [u8], volume: f32) {
    if volume == 1.0 {
        return;
    }
    for chunk in bytes.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        chunk.copy_from_slice(&apply_gain(sample as i32, volume).to_le_bytes());
    }
}

/// Single-pole IIR DC estimator.
///
/// The estimate is seeded with the first sample after a reset so microphones
/// with a large bias do not produce a step on the first frames.
#[derive(Debug, Clone, Default)]
pub struct DcBlocker {
    estimate: f32,
    seeded: bool,
}

impl DcBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the running DC estimate from one sample
    #[inline]
    pub fn process(&mut self, sample: i32) -> i32 {
        let x = sample as f32;
        if self.seeded {
            self.estimate += DC_ALPHA * (x - self.estimate);
        } else {
            self.estimate = x;
            self.seeded = true;
        }
        sample - self.estimate.round() as i32
    }

    pub fn reset(&mut self) {
        self.estimate = 0.0;
        self.seeded = false;
    }
}

/// Turns raw microphone bytes into conditioned s16le frames:
/// narrowing, optional DC removal, then gain with clamping.
#[derive(Debug, Clone)]
pub struct MicConditioner {
    width: SampleWidth,
    dc: DcBlocker,
}

impl MicConditioner {
    pub fn new(width: SampleWidth) -> Self {
        Self {
            width,
            dc: DcBlocker::new(),
        }
    }

    pub fn width(&self) -> SampleWidth {
        self.width
    }

    /// Condition `raw` into `out`. Returns the number of bytes written, which
    /// is limited by whichever of the two runs out first.
    pub fn condition(&mut self, raw: &[u8], gain: f32, remove_dc: bool, out: &mut [u8]) -> usize {
        let step = self.width.bytes();
        let n = (raw.len() / step).min(out.len() / 2);

        for (i, chunk) in raw.chunks_exact(step).take(n).enumerate() {
            let sample = match self.width {
                SampleWidth::S16 => i16::from_le_bytes([chunk[0], chunk[1]]) as i32,
                SampleWidth::S32 => {
                    narrow_s32(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])) as i32
                }
            };
            let sample = if remove_dc { self.dc.process(sample) } else { sample };
            out[i * 2..i * 2 + 2].copy_from_slice(&apply_gain(sample, gain).to_le_bytes());
        }

        n * 2
    }

    /// Forget the DC estimate (stream start)
    pub fn reset(&mut self) {
        self.dc.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_s16le_round_trip() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN, 1234];
        let mut bytes = [0u8; 12];
        assert_eq!(encode_s16le(&samples, &mut bytes), 12);

        let mut decoded = [0i16; 6];
        assert_eq!(decode_s16le(&bytes, &mut decoded), 6);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_narrow_s32_keeps_upper_bits() {
        assert_eq!(narrow_s32(0x7FFF_0000), i16::MAX);
        assert_eq!(narrow_s32(i32::MIN), i16::MIN);
        assert_eq!(narrow_s32(0x0001_FFFF), 1);
        assert_eq!(narrow_s32(-1), -1);
    }

    #[test]
    fn test_gain_clamps_both_directions() {
        assert_eq!(apply_gain(20_000, 4.0), i16::MAX);
        assert_eq!(apply_gain(-20_000, 4.0), i16::MIN);
        assert_eq!(apply_gain(i16::MIN as i32, -1.0), i16::MAX);
        assert_eq!(apply_gain(100, 4.0), 400);
        assert_eq!(apply_gain(100, f32::NAN), 0);
    }

    #[test]
    fn test_dc_blocker_removes_constant_bias() {
        let mut dc = DcBlocker::new();
        for _ in 0..4096 {
            assert_eq!(dc.process(1500), 0);
        }

        // A tone riding on the bias survives
        let mut peak = 0;
        for i in 0..1024 {
            let tone = if i % 16 < 8 { 800 } else { -800 };
            peak = peak.max(dc.process(1500 + tone).abs());
        }
        assert!(peak > 700);
    }

    #[test]
    fn test_conditioner_narrows_32_bit_capture() {
        let mut conditioner = MicConditioner::new(SampleWidth::S32);
        let raw: Vec<u8> = [0x0010_0000i32, -0x0010_0000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();

        let mut out = [0u8; 4];
        assert_eq!(conditioner.condition(&raw, 2.0, false, &mut out), 4);

        let mut samples = [0i16; 2];
        decode_s16le(&out, &mut samples);
        assert_eq!(samples, [32, -32]);
    }

    #[test]
    fn test_conditioner_state_persists_until_reset() {
        let mut conditioner = MicConditioner::new(SampleWidth::S16);
        let raw: Vec<u8> = std::iter::repeat(3000i16.to_le_bytes()).take(4).flatten().collect();
        let mut out = [0u8; 8];

        conditioner.condition(&raw, 1.0, true, &mut out);
        assert_eq!(out, [0u8; 8]);

        conditioner.reset();
        conditioner.condition(&raw, 1.0, false, &mut out);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), 3000);
    }

    #[test]
    fn test_volume_scaling() {
        let mut bytes = [0u8; 4];
        encode_s16le(&[1000, -1000], &mut bytes);
        scale_s16le_in_place(&mut bytes, 0.5);

        let mut samples = [0i16; 2];
        decode_s16le(&bytes, &mut samples);
        assert_eq!(samples, [500, -500]);
    }

    proptest! {
        #[test]
        fn prop_gain_output_is_clamped(sample in any::<i16>(), gain in -1000.0f32..1000.0) {
            let exact = sample as f64 * gain as f64;
            let out = apply_gain(sample as i32, gain) as f64;

            if exact >= i16::MAX as f64 {
                prop_assert_eq!(out, i16::MAX as f64);
            } else if exact <= i16::MIN as f64 {
                prop_assert_eq!(out, i16::MIN as f64);
            } else {
                prop_assert!((out - exact).abs() <= 1.0);
            }
        }
    }
}
