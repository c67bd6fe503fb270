//! Fixed-ratio sample-rate conversion between device rates and engine rates.
//!
//! Capture runs at whatever the microphone offers (commonly 44.1 or 48 kHz)
//! and is converted down to the 16 kHz the classifier expects; synthesized
//! speech arrives at 32 kHz and is converted up or down to the output device
//! rate. Both directions share [`RateConverter`].
//!
//! Equal rates skip rubato entirely and copy input straight through.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, VoiceError};

/// Mono f32 converter that accepts arbitrarily sized input blocks.
pub struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    /// Input samples waiting for a full rubato block.
    pending: Vec<f32>,
    block: usize,
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `block` is the number of input samples handed to rubato per call.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        let block = block.max(1);
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block,
                scratch: Vec::new(),
            });
        }
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::AudioDevice(format!(
                "cannot resample {from_rate} Hz -> {to_rate} Hz"
            )));
        }

        let resampler = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| VoiceError::AudioDevice(format!("resampler init: {e}")))?;
        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(from_rate, to_rate, block, "rate converter ready");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(block * 2),
            block,
            scratch,
        })
    }

    /// Block size for roughly 10 ms of audio at `rate`.
    pub fn block_for(rate: u32) -> usize {
        (rate as usize / 100).max(1)
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Convert `input`, appending every completed output sample to `out`.
    ///
    /// A trailing partial block is held back until the next call or
    /// [`flush`](Self::flush).
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return;
        };

        self.pending.extend_from_slice(input);
        let mut offset = 0;
        while self.pending.len() - offset >= self.block {
            let block = &self.pending[offset..offset + self.block];
            match resampler.process_into_buffer(&[block], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += self.block;
        }
        self.pending.drain(..offset);
    }

    /// Zero-pad and convert any held-back partial block.
    pub fn flush(&mut self, out: &mut Vec<f32>) {
        if self.resampler.is_none() || self.pending.is_empty() {
            return;
        }
        let missing = self.block - self.pending.len();
        let padding = vec![0f32; missing];
        self.process_into(&padding, out);
    }
}
