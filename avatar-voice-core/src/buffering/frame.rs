//! Fixed-size capture frame passed from the capture loop to the VAD loop.

/// Capture sample rate (Hz).
pub const SAMPLE_RATE: u32 = 16_000;
/// Samples per frame: 30 ms at 16 kHz.
pub const FRAME_SAMPLES: usize = 480;
/// Frame duration in milliseconds.
pub const FRAME_MS: u32 = 30;
/// Bytes per frame of signed 16-bit mono PCM.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// One block of mono signed 16-bit PCM read from the input device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position of this frame within its capture session.
    pub seq: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(seq: u64, samples: Vec<i16>) -> Self {
        Self { seq, samples }
    }

    /// Whether the frame has the length the classifier expects.
    pub fn is_well_formed(&self) -> bool {
        self.samples.len() == FRAME_SAMPLES
    }

    /// Mean absolute amplitude, in raw sample units (0..=32768).
    pub fn volume(&self) -> f32 {
        mean_abs_amplitude(&self.samples)
    }

    /// Little-endian byte view of the samples.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn duration_ms(&self) -> u32 {
        (self.samples.len() as u64 * 1000 / SAMPLE_RATE as u64) as u32
    }
}

pub fn mean_abs_amplitude(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: u64 = samples.iter().map(|s| s.unsigned_abs() as u64).sum();
    sum as f32 / samples.len() as f32
}

/// Convert a float sample in [-1.0, 1.0] to i16 with clipping.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}
