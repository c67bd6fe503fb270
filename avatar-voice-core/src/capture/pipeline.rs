//! Loop bodies of a capture session.
//!
//! ## Data flow
//!
//! ```text
//! InputStream ─► [capture] ─frames─► [vad] ─segments─► [recognition] ─► Mailbox
//!                    │                  │                    │
//!                 volume          speech_active        RecognitionEvent
//! ```
//!
//! Each loop runs on its own named thread, owns nothing the others touch
//! except the queues between them, and exits within one `queue_timeout`
//! of its stop signal.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::time::Duration;

use chrono::{Local, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use super::segmenter::{Segmenter, Transition};
use super::{CaptureDiagnostics, StatusCell};
use crate::audio::{wav, CaptureFormat, InputDevice, InputStream};
use crate::buffering::frame::{AudioFrame, SAMPLE_RATE};
use crate::error::Result;
use crate::ipc::events::{EngineStatus, RecognitionEvent};
use crate::lifecycle::{ManagedQueue, StopSignal};
use crate::mailbox::Mailbox;
use crate::recognition::RecognitionBackend;
use crate::vad::VadFactory;

/// What the VAD loop tells the recognition loop.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    Open { index: u64 },
    Frame(AudioFrame),
    Close { index: u64, speech_ms: u64 },
    Discard { index: u64 },
}

/// Add one to a diagnostics counter.
fn bump(counter: &std::sync::atomic::AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ── capture ─────────────────────────────────────────────────────────────────

pub(crate) struct CaptureLoop {
    pub device: Arc<dyn InputDevice>,
    pub format: CaptureFormat,
    pub read_timeout: Duration,
    pub max_read_retries: u32,
    pub retry_backoff: Duration,
    pub queue_timeout: Duration,
    pub frames: Arc<ManagedQueue<AudioFrame>>,
    pub volume: Arc<ManagedQueue<f32>>,
    pub recording: Arc<Mutex<Vec<i16>>>,
    pub diagnostics: Arc<CaptureDiagnostics>,
    pub status: Arc<StatusCell>,
}

impl CaptureLoop {
    /// Opens the device on this thread, reports the outcome on `opened`, then
    /// reads frames until stopped or the retry budget is spent.
    pub(crate) fn run(self, opened: mpsc::Sender<Result<()>>, stop: StopSignal) {
        bump(&self.diagnostics.device_opens);
        let mut stream: Option<Box<dyn InputStream>> = match self.device.open(&self.format) {
            Ok(stream) => {
                let _ = opened.send(Ok(()));
                Some(stream)
            }
            Err(e) => {
                error!(device = %self.device.id(), "failed to open input device: {e}");
                let _ = opened.send(Err(e));
                return;
            }
        };
        drop(opened);

        let mut seq = 0u64;
        let mut failures = 0u32;
        let mut buf = vec![0i16; self.format.frame_samples];

        while !stop.is_set() {
            if stream.is_none() {
                bump(&self.diagnostics.device_opens);
                match self.device.open(&self.format) {
                    Ok(reopened) => {
                        info!(device = %self.device.id(), "input device reopened");
                        stream = Some(reopened);
                    }
                    Err(e) => {
                        warn!(attempt = failures + 1, "reopening input device failed: {e}");
                        if self.register_failure(&mut failures, &e.to_string(), &stop) {
                            break;
                        }
                    }
                }
                continue;
            }
            let Some(active) = stream.as_mut() else {
                continue;
            };

            bump(&self.diagnostics.read_attempts);
            match active.read_frame(&mut buf, self.read_timeout) {
                Ok(()) => {
                    failures = 0;
                    bump(&self.diagnostics.frames_read);
                    self.recording.lock().extend_from_slice(&buf);

                    let frame = AudioFrame::new(seq, buf.clone());
                    seq += 1;
                    self.volume.offer(frame.volume());
                    if !self.frames.put(frame, true, Some(self.queue_timeout)) {
                        bump(&self.diagnostics.frames_dropped);
                    }
                }
                Err(e) => {
                    if stop.is_set() {
                        break;
                    }
                    stream = None;
                    bump(&self.diagnostics.read_failures);
                    warn!(attempt = failures + 1, "input read failed: {e}");
                    if self.register_failure(&mut failures, &e.to_string(), &stop) {
                        break;
                    }
                }
            }
        }

        drop(stream);
        debug!(frames = seq, "capture loop exited");
    }

    /// Count one consecutive failure. Returns `true` when the loop must end.
    fn register_failure(&self, failures: &mut u32, detail: &str, stop: &StopSignal) -> bool {
        *failures += 1;
        if *failures >= self.max_read_retries {
            error!(
                failures = *failures,
                "input device failed {} times in a row, capture aborted", *failures
            );
            self.status.set(EngineStatus::Error, Some(detail.to_string()));
            return true;
        }
        stop.sleep(self.retry_backoff)
    }
}

// ── vad ─────────────────────────────────────────────────────────────────────

pub(crate) struct VadLoop {
    pub factory: VadFactory,
    pub segmenter: Segmenter,
    pub queue_timeout: Duration,
    pub frames: Arc<ManagedQueue<AudioFrame>>,
    pub segments: Arc<ManagedQueue<SegmentEvent>>,
    pub speech_active: Arc<AtomicBool>,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

impl VadLoop {
    /// Builds the classifier on this thread and reports the outcome on `ready`.
    pub(crate) fn run(mut self, ready: mpsc::Sender<Result<()>>, stop: StopSignal) {
        let mut detector = match (self.factory)() {
            Ok(detector) => {
                let _ = ready.send(Ok(()));
                detector
            }
            Err(e) => {
                error!("failed to build voice activity classifier: {e}");
                let _ = ready.send(Err(e));
                return;
            }
        };
        drop(ready);

        let mut index = 0u64;
        while !stop.is_set() {
            let Some(frame) = self.frames.get(self.queue_timeout) else {
                continue;
            };

            if !frame.is_well_formed() {
                bump(&self.diagnostics.malformed_frames);
                warn!(seq = frame.seq, samples = frame.samples.len(), "dropping malformed frame");
                continue;
            }

            let decision = match detector.classify(&frame) {
                Ok(decision) => decision,
                Err(e) => {
                    bump(&self.diagnostics.classifier_errors);
                    warn!(seq = frame.seq, "classifier failed, dropping frame: {e}");
                    continue;
                }
            };
            if decision.is_speech() {
                bump(&self.diagnostics.speech_frames);
            }

            let transition = self.segmenter.push(decision);
            self.speech_active
                .store(self.segmenter.in_speech(), Ordering::Release);

            let delivered = match transition {
                Transition::Idle => true,
                Transition::Opened => {
                    index += 1;
                    bump(&self.diagnostics.segments_opened);
                    debug!(segment = index, seq = frame.seq, "speech started");
                    self.send(SegmentEvent::Open { index }, &stop)
                        && self.send(SegmentEvent::Frame(frame), &stop)
                }
                Transition::Continued => self.send(SegmentEvent::Frame(frame), &stop),
                Transition::Closed { speech_ms } => {
                    bump(&self.diagnostics.segments_closed);
                    info!(segment = index, speech_ms, "speech segment closed");
                    self.send(SegmentEvent::Frame(frame), &stop)
                        && self.send(SegmentEvent::Close { index, speech_ms }, &stop)
                }
                Transition::Dropped { speech_ms } => {
                    bump(&self.diagnostics.segments_dropped);
                    debug!(segment = index, speech_ms, "speech too short, segment dropped");
                    self.send(SegmentEvent::Discard { index }, &stop)
                }
            };
            if !delivered {
                break;
            }
        }

        detector.reset();
        self.speech_active.store(false, Ordering::Release);
        debug!(segments = index, "vad loop exited");
    }

    fn send(&self, event: SegmentEvent, stop: &StopSignal) -> bool {
        self.segments
            .put_until_stopped(event, stop, self.queue_timeout)
    }
}

// ── recognition ─────────────────────────────────────────────────────────────

pub(crate) struct RecognitionLoop {
    pub recognizer: Arc<dyn RecognitionBackend>,
    pub recordings_dir: PathBuf,
    pub keep_segment_files: bool,
    pub queue_timeout: Duration,
    pub segments: Arc<ManagedQueue<SegmentEvent>>,
    pub result: Arc<Mailbox<String>>,
    /// Session this loop belongs to, compared against `current_generation`.
    pub generation: u64,
    pub current_generation: Arc<AtomicU64>,
    pub events: broadcast::Sender<RecognitionEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

impl RecognitionLoop {
    pub(crate) fn run(self, stop: StopSignal) {
        let mut open: Option<(u64, Vec<i16>)> = None;

        while !stop.is_set() {
            let Some(event) = self.segments.get(self.queue_timeout) else {
                continue;
            };
            match event {
                SegmentEvent::Open { index } => {
                    if let Some((stale, _)) = open.take() {
                        warn!(segment = stale, "segment never closed, discarding it");
                    }
                    open = Some((index, Vec::new()));
                }
                SegmentEvent::Frame(frame) => {
                    if let Some((_, samples)) = open.as_mut() {
                        samples.extend_from_slice(&frame.samples);
                    }
                }
                SegmentEvent::Discard { index } => {
                    if open.as_ref().is_some_and(|(i, _)| *i == index) {
                        open = None;
                    }
                }
                SegmentEvent::Close { index, speech_ms } => match open.take() {
                    Some((i, samples)) if i == index => {
                        self.recognize_segment(index, speech_ms, &samples);
                    }
                    _ => warn!(segment = index, "close for a segment that is not open"),
                },
            }
        }
        debug!("recognition loop exited");
    }

    fn is_current(&self) -> bool {
        self.current_generation.load(Ordering::Acquire) == self.generation
    }

    fn recognize_segment(&self, index: u64, speech_ms: u64, samples: &[i16]) {
        let span = info_span!("segment", segment = index, speech_ms);
        let _enter = span.enter();

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .recordings_dir
            .join(format!("segment_{stamp}_{index}.wav"));
        if let Err(e) = wav::write_pcm16_wav(&path, samples, SAMPLE_RATE) {
            bump(&self.diagnostics.recognition_errors);
            warn!(path = %path.display(), "failed to write segment file: {e}");
            return;
        }

        bump(&self.diagnostics.recognition_calls);
        match self.recognizer.recognize(&path) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    debug!("recognizer returned no text");
                } else if !self.result.put_if(text.to_string(), || self.is_current()) {
                    warn!(generation = self.generation, "result of a finished session discarded");
                } else {
                    info!(chars = text.chars().count(), "segment recognized");
                    bump(&self.diagnostics.results_stored);
                    let _ = self.events.send(RecognitionEvent {
                        seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
                        segment: index,
                        text: text.to_string(),
                        speech_ms,
                        recognized_at: Utc::now(),
                    });
                }
            }
            Err(e) => {
                bump(&self.diagnostics.recognition_errors);
                warn!("recognition failed, segment skipped: {e}");
            }
        }

        if !self.keep_segment_files {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "failed to remove segment file: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::FRAME_SAMPLES;
    use crate::error::VoiceError;
    use crate::vad::{VadDecision, VoiceActivityDetector};
    use std::time::Instant;

    /// Non-zero frames are speech; frames of all ones make it fail.
    struct MarkerVad;

    impl VoiceActivityDetector for MarkerVad {
        fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
            if frame.samples.iter().all(|s| *s == 1) {
                return Err(VoiceError::Vad("glitch".into()));
            }
            Ok(frame.samples.iter().any(|s| *s != 0).into())
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn vad_loop_skips_malformed_and_unclassifiable_frames() {
        let frames = Arc::new(ManagedQueue::new("frames", 256));
        let segments = Arc::new(ManagedQueue::new("segments", 256));
        let diagnostics = Arc::new(CaptureDiagnostics::default());

        let mut seq = 0;
        let mut push = |samples: Vec<i16>| {
            assert!(frames.put(AudioFrame::new(seq, samples), false, None));
            seq += 1;
        };
        push(vec![8_000; 100]);
        for _ in 0..20 {
            push(vec![8_000; FRAME_SAMPLES]);
        }
        push(vec![1; FRAME_SAMPLES]);
        for _ in 0..60 {
            push(vec![0; FRAME_SAMPLES]);
        }

        let vad = VadLoop {
            factory: Arc::new(|| Ok(Box::new(MarkerVad) as Box<dyn VoiceActivityDetector>)),
            segmenter: Segmenter::new(60, 500),
            queue_timeout: Duration::from_millis(10),
            frames: Arc::clone(&frames),
            segments: Arc::clone(&segments),
            speech_active: Arc::new(AtomicBool::new(false)),
            diagnostics: Arc::clone(&diagnostics),
        };
        let stop = StopSignal::new();
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = {
            let stop = stop.clone();
            std::thread::spawn(move || vad.run(ready_tx, stop))
        };
        assert!(ready_rx.recv().expect("ready").is_ok());

        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(event) = segments.get(Duration::from_millis(10)) {
                let closed = matches!(event, SegmentEvent::Close { .. });
                events.push(event);
                if closed {
                    break;
                }
            }
        }
        stop.set();
        handle.join().expect("vad thread");

        assert!(matches!(events.first(), Some(SegmentEvent::Open { index: 1 })));
        assert!(matches!(
            events.last(),
            Some(SegmentEvent::Close { index: 1, speech_ms: 600 })
        ));
        assert!(events.iter().all(|e| match e {
            SegmentEvent::Frame(frame) => frame.is_well_formed(),
            _ => true,
        }));
        assert_eq!(diagnostics.malformed_frames.load(Ordering::Relaxed), 1);
        assert_eq!(diagnostics.classifier_errors.load(Ordering::Relaxed), 1);
    }
}
