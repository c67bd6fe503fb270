//! Audio device seams and their cpal implementations.
//!
//! The engines only see [`InputDevice`] / [`OutputDevice`]. A device is a
//! cheap, shareable description; `open` produces the live stream, which is
//! owned by exactly one loop thread.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Streams returned by `open` are therefore not required to be `Send`
//! and must be opened, used and dropped on the same thread.

pub mod device;
pub mod input;
pub mod output;
pub mod resample;
pub mod wav;

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffering::frame::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{Result, VoiceError};

pub use input::CpalInputDevice;
pub use output::CpalOutputDevice;

/// Shape of the frames an input stream must deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub frame_samples: usize,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

/// A microphone (or anything that can act like one).
pub trait InputDevice: Send + Sync + 'static {
    /// Stable identifier used for exclusive claims.
    fn id(&self) -> String;

    fn open(&self, format: &CaptureFormat) -> Result<Box<dyn InputStream>>;
}

/// An open capture stream delivering mono signed 16-bit frames.
pub trait InputStream {
    /// Fill `frame` completely or fail.
    ///
    /// # Errors
    /// `DeviceTimeout` if no full frame arrived within `timeout`; stream
    /// errors for anything the device reports.
    fn read_frame(&mut self, frame: &mut [i16], timeout: Duration) -> Result<()>;
}

/// A speaker (or anything that can act like one).
pub trait OutputDevice: Send + Sync + 'static {
    fn id(&self) -> String;

    /// Open a sink accepting mono s16le PCM at `sample_rate`.
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>>;
}

/// An open playback stream.
pub trait OutputSink {
    /// Write little-endian 16-bit PCM. Blocks while the device buffer is full.
    ///
    /// An odd trailing byte is carried over to the next call.
    fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Block until queued audio has been played or `timeout` elapses.
    fn drain(&mut self, timeout: Duration);
}

fn claims() -> &'static Mutex<HashSet<String>> {
    static CLAIMS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CLAIMS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive hold on a device id for the lifetime of a session.
///
/// Released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    id: String,
}

impl DeviceClaim {
    /// Claim `id`, failing with `DeviceBusy` if another session holds it.
    pub fn acquire(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if !claims().lock().insert(id.clone()) {
            return Err(VoiceError::DeviceBusy(id));
        }
        debug!(device = %id, "device claimed");
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        claims().lock().remove(&self.id);
        debug!(device = %self.id, "device released");
    }
}

/// Average interleaved channels down to mono, converting each sample with `to_f32`.
pub(crate) fn downmix_into<T: Copy>(
    data: &[T],
    channels: usize,
    out: &mut Vec<f32>,
    to_f32: impl Fn(T) -> f32,
) {
    out.clear();
    let channels = channels.max(1);
    if channels == 1 {
        out.extend(data.iter().map(|&s| to_f32(s)));
        return;
    }
    out.extend(data.chunks_exact(channels).map(|frame| {
        frame.iter().map(|&s| to_f32(s)).sum::<f32>() / channels as f32
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn second_claim_on_same_device_is_busy() {
        let first = DeviceClaim::acquire("test-claim-device").unwrap();
        assert!(matches!(
            DeviceClaim::acquire("test-claim-device"),
            Err(VoiceError::DeviceBusy(_))
        ));
        drop(first);
        assert!(DeviceClaim::acquire("test-claim-device").is_ok());
    }

    #[test]
    fn downmix_averages_channels() {
        let mut out = Vec::new();
        downmix_into(&[0.5f32, -0.5, 1.0, 0.0], 2, &mut out, |s| s);
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[1], 0.5);
    }

    #[test]
    fn default_capture_format_is_thirty_ms_at_16k() {
        let format = CaptureFormat::default();
        assert_eq!(format.sample_rate, 16_000);
        assert_eq!(format.frame_samples, 480);
    }
}
