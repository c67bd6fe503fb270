//! Speaker playback via cpal.
//!
//! The playback loop writes 16-bit PCM at the synthesis rate; the sink
//! converts it to f32 at the device rate and feeds a small ring that the
//! output callback drains. A full ring blocks `write`, which paces the
//! playback loop at real time.

use super::{OutputDevice, OutputSink};
use crate::error::Result;

/// Output device selected by name, falling back to the system default.
#[derive(Debug, Clone, Default)]
pub struct CpalOutputDevice {
    preferred_name: Option<String>,
}

impl CpalOutputDevice {
    pub fn new(preferred_name: Option<String>) -> Self {
        Self {
            preferred_name: preferred_name.filter(|n| !n.trim().is_empty()),
        }
    }
}

impl OutputDevice for CpalOutputDevice {
    fn id(&self) -> String {
        match &self.preferred_name {
            Some(name) => format!("output:{name}"),
            None => "output:default".to_string(),
        }
    }

    #[cfg(feature = "audio-cpal")]
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(cpal_impl::CpalOutputSink::open(
            self.preferred_name.as_deref(),
            sample_rate,
        )?))
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn open(&self, _sample_rate: u32) -> Result<Box<dyn OutputSink>> {
        Err(crate::error::VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Decode s16le bytes to f32, keeping an odd trailing byte in `carry`.
#[cfg(any(feature = "audio-cpal", test))]
pub(crate) fn decode_s16le(carry: &mut Option<u8>, pcm: &[u8], out: &mut Vec<f32>) {
    out.clear();
    let mut bytes = pcm;
    if let Some(lo) = carry.take() {
        match bytes.split_first() {
            Some((&hi, rest)) => {
                out.push(i16::from_le_bytes([lo, hi]) as f32 / 32768.0);
                bytes = rest;
            }
            None => {
                *carry = Some(lo);
                return;
            }
        }
    }
    let mut pairs = bytes.chunks_exact(2);
    out.extend(
        pairs
            .by_ref()
            .map(|p| i16::from_le_bytes([p[0], p[1]]) as f32 / 32768.0),
    );
    if let [odd] = pairs.remainder() {
        *carry = Some(*odd);
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_impl {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::time::{Duration, Instant};

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        SampleFormat, Stream, StreamConfig,
    };
    use tracing::{error, info};

    use super::super::{device, resample::RateConverter, OutputSink};
    use super::decode_s16le;
    use crate::buffering::{
        create_sample_ring, frame::f32_to_i16, Consumer, Observer, Producer, SampleConsumer,
        SampleProducer, PLAYBACK_RING_CAPACITY,
    };
    use crate::error::{Result, VoiceError};

    const POLL: Duration = Duration::from_millis(2);
    /// A write that cannot make progress for this long is treated as a dead device.
    const STALL_TIMEOUT: Duration = Duration::from_secs(2);

    pub(super) struct CpalOutputSink {
        _stream: Stream,
        producer: SampleProducer,
        converter: RateConverter,
        failed: Arc<AtomicBool>,
        carry: Option<u8>,
        decoded: Vec<f32>,
        converted: Vec<f32>,
    }

    impl CpalOutputSink {
        pub(super) fn open(preferred: Option<&str>, sample_rate: u32) -> Result<Self> {
            let device = device::resolve_output_device(preferred)?;
            let supported = device
                .default_output_config()
                .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;

            let device_rate = supported.sample_rate().0;
            let channels = supported.channels();
            info!(
                device = device.name().unwrap_or_default().as_str(),
                device_rate,
                channels,
                source_rate = sample_rate,
                "opening output device"
            );

            let config = StreamConfig {
                channels,
                sample_rate: supported.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let (producer, consumer) = create_sample_ring(PLAYBACK_RING_CAPACITY);
            let failed = Arc::new(AtomicBool::new(false));
            let stream = build_stream(
                &device,
                &config,
                supported.sample_format(),
                consumer,
                Arc::clone(&failed),
            )?;
            stream
                .play()
                .map_err(|e| VoiceError::AudioStream(e.to_string()))?;

            Ok(Self {
                _stream: stream,
                producer,
                converter: RateConverter::new(
                    sample_rate,
                    device_rate,
                    RateConverter::block_for(sample_rate),
                )?,
                failed,
                carry: None,
                decoded: Vec::new(),
                converted: Vec::new(),
            })
        }

        fn push_converted(&mut self) -> Result<()> {
            let mut offset = 0;
            let mut last_progress = Instant::now();
            while offset < self.converted.len() {
                if self.failed.load(Ordering::Acquire) {
                    return Err(VoiceError::AudioStream("output stream reported an error".into()));
                }
                let written = self.producer.push_slice(&self.converted[offset..]);
                if written > 0 {
                    offset += written;
                    last_progress = Instant::now();
                    continue;
                }
                if last_progress.elapsed() >= STALL_TIMEOUT {
                    return Err(VoiceError::DeviceTimeout(STALL_TIMEOUT));
                }
                std::thread::sleep(POLL);
            }
            self.converted.clear();
            Ok(())
        }
    }

    impl OutputSink for CpalOutputSink {
        fn write(&mut self, pcm: &[u8]) -> Result<()> {
            decode_s16le(&mut self.carry, pcm, &mut self.decoded);
            self.converter.process_into(&self.decoded, &mut self.converted);
            self.push_converted()
        }

        fn drain(&mut self, timeout: Duration) {
            self.converter.flush(&mut self.converted);
            if self.push_converted().is_err() {
                return;
            }
            let deadline = Instant::now() + timeout;
            while !self.producer.is_empty() && Instant::now() < deadline {
                if self.failed.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(POLL);
            }
        }
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        sample_format: SampleFormat,
        mut consumer: SampleConsumer,
        failed: Arc<AtomicBool>,
    ) -> Result<Stream> {
        let channels = (config.channels as usize).max(1);
        let on_error = move |err: cpal::StreamError| {
            error!("audio output stream error: {err}");
            failed.store(true, Ordering::Release);
        };

        // One mono sample per interleaved frame, silence on underrun.
        let mut next = move || consumer.try_pop().unwrap_or(0.0);

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                config,
                move |data: &mut [f32], _| {
                    for frame in data.chunks_mut(channels) {
                        frame.fill(next());
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                config,
                move |data: &mut [i16], _| {
                    for frame in data.chunks_mut(channels) {
                        frame.fill(f32_to_i16(next()));
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::U16 => device.build_output_stream(
                config,
                move |data: &mut [u16], _| {
                    for frame in data.chunks_mut(channels) {
                        let s = f32_to_i16(next()) as i32 + 32768;
                        frame.fill(s as u16);
                    }
                },
                on_error,
                None,
            ),
            fmt => {
                return Err(VoiceError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        };
        stream.map_err(|e| VoiceError::AudioStream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn odd_byte_is_carried_to_next_write() {
        let mut carry = None;
        let mut out = Vec::new();
        let sample = 16_384i16.to_le_bytes();

        decode_s16le(&mut carry, &[0, 0, sample[0]], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(carry, Some(sample[0]));

        decode_s16le(&mut carry, &[sample[1]], &mut out);
        assert_eq!(out.len(), 1);
        assert_relative_eq!(out[0], 0.5);
        assert_eq!(carry, None);
    }

    #[test]
    fn empty_write_keeps_carry() {
        let mut carry = Some(7);
        let mut out = Vec::new();
        decode_s16le(&mut carry, &[], &mut out);
        assert!(out.is_empty());
        assert_eq!(carry, Some(7));
    }
}
