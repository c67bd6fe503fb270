//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It only down-mixes into a reused buffer and pushes into an SPSC ring
//! producer (`push_slice` is lock-free). Rate conversion to 16 kHz and i16
//! quantisation happen in [`InputStream::read_frame`] on the capture loop
//! thread.

use super::{CaptureFormat, InputDevice, InputStream};
use crate::error::Result;

/// Input device selected by name, falling back to the system default.
#[derive(Debug, Clone, Default)]
pub struct CpalInputDevice {
    preferred_name: Option<String>,
}

impl CpalInputDevice {
    pub fn new(preferred_name: Option<String>) -> Self {
        Self {
            preferred_name: preferred_name.filter(|n| !n.trim().is_empty()),
        }
    }

    pub fn default_device() -> Self {
        Self::default()
    }
}

impl InputDevice for CpalInputDevice {
    fn id(&self) -> String {
        match &self.preferred_name {
            Some(name) => format!("input:{name}"),
            None => "input:default".to_string(),
        }
    }

    #[cfg(feature = "audio-cpal")]
    fn open(&self, format: &CaptureFormat) -> Result<Box<dyn InputStream>> {
        Ok(Box::new(cpal_impl::CpalInputStream::open(
            self.preferred_name.as_deref(),
            format,
        )?))
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn open(&self, _format: &CaptureFormat) -> Result<Box<dyn InputStream>> {
        Err(crate::error::VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_impl {
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    };
    use std::time::{Duration, Instant};

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        SampleFormat, Stream, StreamConfig,
    };
    use tracing::{error, info, warn};

    use super::super::{device, downmix_into, resample::RateConverter, CaptureFormat, InputStream};
    use crate::buffering::{
        create_sample_ring, frame::f32_to_i16, Consumer, Producer, SampleConsumer, SampleProducer,
        CAPTURE_RING_CAPACITY,
    };
    use crate::error::{Result, VoiceError};

    const POLL: Duration = Duration::from_millis(2);

    pub(super) struct CpalInputStream {
        _stream: Stream,
        consumer: SampleConsumer,
        converter: RateConverter,
        failed: Arc<AtomicBool>,
        dropped: Arc<AtomicU64>,
        raw: Vec<f32>,
        converted: Vec<f32>,
        /// Read cursor into `converted`.
        cursor: usize,
    }

    impl CpalInputStream {
        pub(super) fn open(preferred: Option<&str>, format: &CaptureFormat) -> Result<Self> {
            let device = device::resolve_input_device(preferred)?;
            let supported = device
                .default_input_config()
                .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;

            let device_rate = supported.sample_rate().0;
            let channels = supported.channels();
            info!(
                device = device.name().unwrap_or_default().as_str(),
                device_rate,
                channels,
                "opening input device"
            );

            let config = StreamConfig {
                channels,
                sample_rate: supported.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let (producer, consumer) = create_sample_ring(CAPTURE_RING_CAPACITY);
            let failed = Arc::new(AtomicBool::new(false));
            let dropped = Arc::new(AtomicU64::new(0));

            let stream = build_stream(
                &device,
                &config,
                supported.sample_format(),
                producer,
                Arc::clone(&failed),
                Arc::clone(&dropped),
            )?;
            stream
                .play()
                .map_err(|e| VoiceError::AudioStream(e.to_string()))?;

            let converter = RateConverter::new(
                device_rate,
                format.sample_rate,
                RateConverter::block_for(device_rate),
            )?;

            Ok(Self {
                _stream: stream,
                consumer,
                converter,
                failed,
                dropped,
                raw: vec![0f32; 4096],
                converted: Vec::with_capacity(format.frame_samples * 4),
                cursor: 0,
            })
        }

        fn available(&self) -> usize {
            self.converted.len() - self.cursor
        }
    }

    impl InputStream for CpalInputStream {
        fn read_frame(&mut self, frame: &mut [i16], timeout: Duration) -> Result<()> {
            let deadline = Instant::now() + timeout;
            while self.available() < frame.len() {
                if self.failed.load(Ordering::Acquire) {
                    return Err(VoiceError::AudioStream("input stream reported an error".into()));
                }
                let n = self.consumer.pop_slice(&mut self.raw);
                if n > 0 {
                    if self.cursor > 0 {
                        self.converted.drain(..self.cursor);
                        self.cursor = 0;
                    }
                    self.converter.process_into(&self.raw[..n], &mut self.converted);
                    continue;
                }
                if Instant::now() >= deadline {
                    return Err(VoiceError::DeviceTimeout(timeout));
                }
                std::thread::sleep(POLL);
            }

            let end = self.cursor + frame.len();
            for (dst, &src) in frame.iter_mut().zip(&self.converted[self.cursor..end]) {
                *dst = f32_to_i16(src);
            }
            self.cursor = end;
            Ok(())
        }
    }

    impl Drop for CpalInputStream {
        fn drop(&mut self) {
            let dropped = self.dropped.load(Ordering::Relaxed);
            if dropped > 0 {
                warn!(dropped, "capture ring overflowed during session");
            }
        }
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        sample_format: SampleFormat,
        mut producer: SampleProducer,
        failed: Arc<AtomicBool>,
        dropped: Arc<AtomicU64>,
    ) -> Result<Stream> {
        let channels = config.channels as usize;
        let mut mono: Vec<f32> = Vec::with_capacity(4096);
        let on_error = move |err: cpal::StreamError| {
            error!("audio input stream error: {err}");
            failed.store(true, Ordering::Release);
        };

        let mut push = move |mono: &[f32]| {
            let written = producer.push_slice(mono);
            if written < mono.len() {
                dropped.fetch_add((mono.len() - written) as u64, Ordering::Relaxed);
            }
        };

        let stream = match sample_format {
            SampleFormat::F32 => device.build_input_stream(
                config,
                move |data: &[f32], _| {
                    downmix_into(data, channels, &mut mono, |s| s);
                    push(&mono);
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                config,
                move |data: &[i16], _| {
                    downmix_into(data, channels, &mut mono, |s| s as f32 / 32768.0);
                    push(&mono);
                },
                on_error,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                config,
                move |data: &[u16], _| {
                    downmix_into(data, channels, &mut mono, |s| (s as f32 - 32768.0) / 32768.0);
                    push(&mono);
                },
                on_error,
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                config,
                move |data: &[u8], _| {
                    downmix_into(data, channels, &mut mono, |s| (s as f32 - 128.0) / 128.0);
                    push(&mono);
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
