//! `CaptureEngine`: microphone → speech segments → recognized text.
//!
//! ## Lifecycle
//!
//! ```text
//! CaptureEngine::new()                         status = Idle
//!     └─► start()   device claimed + opened,   status = Recording
//!         └─► stop()    loops joined, session recording saved,
//!                       status = Stopped
//! ```
//!
//! A session is three named loops (`capture`, `vad`, `recognition`) held by
//! one [`LifecycleManager`]. `start()`/`stop()` in the wrong state return an
//! error rather than panicking.
//!
//! ## Threading
//!
//! Input streams and classifiers may be `!Send`, so both are created on the
//! loop thread that uses them. A sync channel per loop reports the outcome
//! back to `start()`, which waits for it with a bounded timeout.

pub mod pipeline;
pub mod segmenter;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    mpsc, Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::audio::{wav, CaptureFormat, DeviceClaim, InputDevice};
use crate::buffering::frame::{AudioFrame, SAMPLE_RATE};
use crate::error::{Result, VoiceError};
use crate::ipc::events::{EngineStatus, EngineStatusEvent, RecognitionEvent};
use crate::lifecycle::{LifecycleManager, ManagedQueue, DEFAULT_JOIN_TIMEOUT};
use crate::mailbox::Mailbox;
use crate::recognition::RecognitionBackend;
use crate::vad::VadFactory;

use pipeline::{CaptureLoop, RecognitionLoop, SegmentEvent, VadLoop};
use segmenter::Segmenter;

/// Broadcast channel capacity for status and recognition events.
const BROADCAST_CAP: usize = 256;

/// Configuration for `CaptureEngine`.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Where session recordings and temporary segment files are written.
    pub recordings_dir: PathBuf,
    pub format: CaptureFormat,
    /// Longest wait for one frame before the read counts as failed. Default: 1 s.
    pub read_timeout: Duration,
    /// Consecutive failed reads (or reopens) that end the session. Default: 3.
    pub max_read_retries: u32,
    /// Pause before reopening the device after a failure. Default: 100 ms.
    pub retry_backoff: Duration,
    /// Silent frames that close a segment. Default: 60 (1.8 s).
    pub trailing_silence_frames: u32,
    /// Segments with less speech than this are dropped. Default: 500 ms.
    pub min_speech_ms: u64,
    /// Bounded wait on every queue operation. Default: 100 ms.
    pub queue_timeout: Duration,
    /// How long `start()` waits for the device to open. Default: 5 s.
    pub open_timeout: Duration,
    /// Bounded join per loop in `stop()`. Default: 1 s.
    pub join_timeout: Duration,
    pub frames_capacity: usize,
    pub volume_capacity: usize,
    pub segments_capacity: usize,
    /// Keep `segment_*.wav` files after recognition instead of deleting them.
    pub keep_segment_files: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recordings"),
            format: CaptureFormat::default(),
            read_timeout: Duration::from_secs(1),
            max_read_retries: 3,
            retry_backoff: Duration::from_millis(100),
            trailing_silence_frames: 60,
            min_speech_ms: 500,
            queue_timeout: Duration::from_millis(100),
            open_timeout: Duration::from_secs(5),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            frames_capacity: 512,
            volume_capacity: 256,
            segments_capacity: 1024,
            keep_segment_files: false,
        }
    }
}

/// Session counters, reset on every `start()`.
#[derive(Debug, Default)]
pub struct CaptureDiagnostics {
    pub device_opens: AtomicUsize,
    pub read_attempts: AtomicUsize,
    pub frames_read: AtomicUsize,
    pub read_failures: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub malformed_frames: AtomicUsize,
    pub classifier_errors: AtomicUsize,
    pub speech_frames: AtomicUsize,
    pub segments_opened: AtomicUsize,
    pub segments_closed: AtomicUsize,
    pub segments_dropped: AtomicUsize,
    pub recognition_calls: AtomicUsize,
    pub recognition_errors: AtomicUsize,
    pub results_stored: AtomicUsize,
}

impl CaptureDiagnostics {
    fn counters(&self) -> [&AtomicUsize; 14] {
        [
            &self.device_opens,
            &self.read_attempts,
            &self.frames_read,
            &self.read_failures,
            &self.frames_dropped,
            &self.malformed_frames,
            &self.classifier_errors,
            &self.speech_frames,
            &self.segments_opened,
            &self.segments_closed,
            &self.segments_dropped,
            &self.recognition_calls,
            &self.recognition_errors,
            &self.results_stored,
        ]
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            device_opens: load(&self.device_opens),
            read_attempts: load(&self.read_attempts),
            frames_read: load(&self.frames_read),
            read_failures: load(&self.read_failures),
            frames_dropped: load(&self.frames_dropped),
            malformed_frames: load(&self.malformed_frames),
            classifier_errors: load(&self.classifier_errors),
            speech_frames: load(&self.speech_frames),
            segments_opened: load(&self.segments_opened),
            segments_closed: load(&self.segments_closed),
            segments_dropped: load(&self.segments_dropped),
            recognition_calls: load(&self.recognition_calls),
            recognition_errors: load(&self.recognition_errors),
            results_stored: load(&self.results_stored),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub device_opens: usize,
    pub read_attempts: usize,
    pub frames_read: usize,
    pub read_failures: usize,
    pub frames_dropped: usize,
    pub malformed_frames: usize,
    pub classifier_errors: usize,
    pub speech_frames: usize,
    pub segments_opened: usize,
    pub segments_closed: usize,
    pub segments_dropped: usize,
    pub recognition_calls: usize,
    pub recognition_errors: usize,
    pub results_stored: usize,
}

/// Engine status plus its broadcast channel, shared with the loops.
pub(crate) struct StatusCell {
    status: Mutex<EngineStatus>,
    tx: broadcast::Sender<EngineStatusEvent>,
}

impl StatusCell {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            status: Mutex::new(EngineStatus::Idle),
            tx,
        }
    }

    pub(crate) fn set(&self, status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.tx.send(EngineStatusEvent { status, detail });
    }

    fn get(&self) -> EngineStatus {
        *self.status.lock()
    }
}

/// Everything that exists only while a session runs.
struct Session {
    manager: LifecycleManager,
    volume: Arc<ManagedQueue<f32>>,
    recording: Arc<Mutex<Vec<i16>>>,
    _claim: DeviceClaim,
}

/// Marks a `start()` in progress; cleared on every exit path.
struct StartingGuard<'a>(&'a AtomicBool);

impl<'a> StartingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| VoiceError::AlreadyRunning)
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The capture half of the voice engine.
///
/// `CaptureEngine` is `Send + Sync`; wrap it in an `Arc` to share it between
/// a host's command handlers and event forwarders.
pub struct CaptureEngine {
    config: CaptureConfig,
    device: Arc<dyn InputDevice>,
    vad_factory: VadFactory,
    recognizer: Arc<dyn RecognitionBackend>,
    session: Mutex<Option<Session>>,
    /// Set while `start()` opens the device, outside the session lock.
    starting: AtomicBool,
    /// Bumped by every `start()`; results from older sessions are discarded.
    generation: Arc<AtomicU64>,
    status: Arc<StatusCell>,
    recognition_tx: broadcast::Sender<RecognitionEvent>,
    result: Arc<Mailbox<String>>,
    speech_active: Arc<AtomicBool>,
    /// Last volume sample, stored as `f32` bits.
    last_volume: AtomicU32,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl CaptureEngine {
    pub fn new(
        config: CaptureConfig,
        device: Arc<dyn InputDevice>,
        vad_factory: VadFactory,
        recognizer: Arc<dyn RecognitionBackend>,
    ) -> Self {
        let (recognition_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            device,
            vad_factory,
            recognizer,
            session: Mutex::new(None),
            starting: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
            status: Arc::new(StatusCell::new()),
            recognition_tx,
            result: Arc::new(Mailbox::new()),
            speech_active: Arc::new(AtomicBool::new(false)),
            last_volume: AtomicU32::new(0f32.to_bits()),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Claim and open the input device, then run the session loops.
    ///
    /// Blocks until the device is confirmed open (or fails). Other accessors
    /// stay responsive meanwhile; a concurrent `start()` gets `AlreadyRunning`.
    ///
    /// # Errors
    /// - `VoiceError::AlreadyRunning` if a session is active.
    /// - `VoiceError::DeviceBusy` if another session holds the device.
    /// - The device-open or classifier-construction error otherwise.
    pub fn start(&self) -> Result<()> {
        let _starting = StartingGuard::enter(&self.starting)?;
        if self.session.lock().is_some() {
            return Err(VoiceError::AlreadyRunning);
        }
        let claim = DeviceClaim::acquire(self.device.id())?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.diagnostics.reset();
        self.result.clear();
        self.speech_active.store(false, Ordering::Release);
        self.last_volume.store(0f32.to_bits(), Ordering::Relaxed);

        let cfg = &self.config;
        let manager = LifecycleManager::with_join_timeout(cfg.join_timeout);
        let frames = manager.create_queue::<AudioFrame>("frames", cfg.frames_capacity);
        let volume = manager.create_queue::<f32>("volume", cfg.volume_capacity);
        let segments = manager.create_queue::<SegmentEvent>("segments", cfg.segments_capacity);
        let recording = Arc::new(Mutex::new(Vec::new()));

        let capture = CaptureLoop {
            device: Arc::clone(&self.device),
            format: cfg.format,
            read_timeout: cfg.read_timeout,
            max_read_retries: cfg.max_read_retries.max(1),
            retry_backoff: cfg.retry_backoff,
            queue_timeout: cfg.queue_timeout,
            frames: Arc::clone(&frames),
            volume: Arc::clone(&volume),
            recording: Arc::clone(&recording),
            diagnostics: Arc::clone(&self.diagnostics),
            status: Arc::clone(&self.status),
        };
        let (opened_tx, opened_rx) = mpsc::channel();
        manager.create_thread("capture", move |stop| capture.run(opened_tx, stop));
        if let Err(e) = self.launch(&manager, "capture", &opened_rx) {
            return Err(self.abort_start(&manager, e));
        }

        let vad = VadLoop {
            factory: Arc::clone(&self.vad_factory),
            segmenter: Segmenter::new(cfg.trailing_silence_frames, cfg.min_speech_ms),
            queue_timeout: cfg.queue_timeout,
            frames,
            segments: Arc::clone(&segments),
            speech_active: Arc::clone(&self.speech_active),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let (ready_tx, ready_rx) = mpsc::channel();
        manager.create_thread("vad", move |stop| vad.run(ready_tx, stop));
        if let Err(e) = self.launch(&manager, "vad", &ready_rx) {
            return Err(self.abort_start(&manager, e));
        }

        let recognition = RecognitionLoop {
            recognizer: Arc::clone(&self.recognizer),
            recordings_dir: cfg.recordings_dir.clone(),
            keep_segment_files: cfg.keep_segment_files,
            queue_timeout: cfg.queue_timeout,
            segments,
            result: Arc::clone(&self.result),
            generation,
            current_generation: Arc::clone(&self.generation),
            events: self.recognition_tx.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        manager.create_thread("recognition", move |stop| recognition.run(stop));
        if !manager.start("recognition") {
            let e = VoiceError::Other(anyhow::anyhow!("recognition loop failed to start"));
            return Err(self.abort_start(&manager, e));
        }

        *self.session.lock() = Some(Session {
            manager,
            volume,
            recording,
            _claim: claim,
        });
        self.status.set(EngineStatus::Recording, None);
        info!(device = %self.device.id(), "capture started");
        Ok(())
    }

    /// Start the named loop and wait (bounded) for its readiness report.
    fn launch(
        &self,
        manager: &LifecycleManager,
        name: &str,
        ready: &mpsc::Receiver<Result<()>>,
    ) -> Result<()> {
        if !manager.start(name) {
            return Err(VoiceError::Other(anyhow::anyhow!("{name} loop failed to start")));
        }
        match ready.recv_timeout(self.config.open_timeout) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(VoiceError::DeviceTimeout(self.config.open_timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(VoiceError::Other(anyhow::anyhow!(
                "{name} loop died before reporting readiness"
            ))),
        }
    }

    fn abort_start(&self, manager: &LifecycleManager, e: VoiceError) -> VoiceError {
        manager.stop_all(true);
        self.status.set(EngineStatus::Error, Some(e.to_string()));
        error!("capture start failed: {e}");
        e
    }

    /// Stop the session and save the full recording.
    ///
    /// Returns the path of `recording_<YYYYmmdd_HHMMSS>.wav`.
    ///
    /// # Errors
    /// - `VoiceError::NotRunning` if no session is active (nothing is touched).
    /// - Storage errors if the recording cannot be written; the session is
    ///   stopped regardless.
    pub fn stop(&self) -> Result<PathBuf> {
        let Some(session) = self.session.lock().take() else {
            return Err(VoiceError::NotRunning);
        };

        info!("capture stop requested");
        session.manager.stop_all(true);
        self.speech_active.store(false, Ordering::Release);
        if let Some(latest) = session.volume.drain().last() {
            self.last_volume.store(latest.to_bits(), Ordering::Relaxed);
        }

        let path = wav::timestamped_path(&self.config.recordings_dir, "recording", "%Y%m%d_%H%M%S", "");
        let samples = std::mem::take(&mut *session.recording.lock());
        let saved = wav::write_pcm16_wav(&path, &samples, SAMPLE_RATE);
        drop(session);

        self.status.set(EngineStatus::Stopped, None);
        match saved {
            Ok(()) => {
                info!(path = %path.display(), samples = samples.len(), "session recording saved");
                Ok(path)
            }
            Err(e) => {
                warn!(path = %path.display(), "failed to save session recording: {e}");
                Err(e)
            }
        }
    }

    /// `true` once `start()` has succeeded and until `stop()`.
    pub fn is_recording(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Most recent volume sample (mean absolute amplitude). Never blocks.
    pub fn current_volume(&self) -> f32 {
        if let Some(session) = self.session.lock().as_ref() {
            if let Some(latest) = session.volume.drain().last() {
                self.last_volume.store(latest.to_bits(), Ordering::Relaxed);
            }
        }
        f32::from_bits(self.last_volume.load(Ordering::Relaxed))
    }

    /// Whether a speech segment is currently open.
    pub fn is_speech_active(&self) -> bool {
        self.speech_active.load(Ordering::Acquire)
    }

    /// Read and clear the last recognized text.
    pub fn take_recognition_result(&self) -> Option<String> {
        self.result.try_take()
    }

    pub fn peek_recognition_result(&self) -> Option<String> {
        self.result.peek()
    }

    pub fn clear_recognition_result(&self) {
        self.result.clear();
    }

    pub fn status(&self) -> EngineStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status.tx.subscribe()
    }

    pub fn subscribe_recognitions(&self) -> broadcast::Receiver<RecognitionEvent> {
        self.recognition_tx.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.manager.stop_all(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_reset_zeroes_every_counter() {
        let diag = CaptureDiagnostics::default();
        for counter in diag.counters() {
            counter.fetch_add(3, Ordering::Relaxed);
        }
        assert_eq!(diag.snapshot().results_stored, 3);
        diag.reset();
        let snap = diag.snapshot();
        assert_eq!(snap.frames_read, 0);
        assert_eq!(snap.segments_closed, 0);
        assert_eq!(snap.recognition_calls, 0);
    }

    #[test]
    fn default_config_matches_frame_timing() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.trailing_silence_frames, 60);
        assert_eq!(cfg.min_speech_ms, 500);
        assert_eq!(cfg.max_read_retries, 3);
        assert_eq!(cfg.format.frame_samples, 480);
    }
}
