use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use avatar_voice_core::audio::{CaptureFormat, InputDevice, InputStream};
use avatar_voice_core::buffering::frame::AudioFrame;
use avatar_voice_core::vad::VadFactory;
use avatar_voice_core::{
    CaptureConfig, CaptureEngine, EngineStatus, RecognitionBackend, Result, VadDecision,
    VoiceActivityDetector, VoiceError,
};

const SPEECH: i16 = 8_000;

fn temp_dir(tag: &str) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "avatar-voice-{tag}-{}-{millis}",
        std::process::id()
    ))
}

/// Plays back a fixed speech/silence script, then silence forever.
struct ScriptedInput {
    id: String,
    script: Vec<bool>,
    opens: Arc<AtomicUsize>,
    open_delay: Duration,
}

impl ScriptedInput {
    fn new(id: &str, speech_frames: usize, silence_frames: usize) -> Self {
        Self::utterances(id, &[(speech_frames, silence_frames)])
    }

    /// One `(speech, silence)` frame run per utterance.
    fn utterances(id: &str, runs: &[(usize, usize)]) -> Self {
        let script = runs
            .iter()
            .flat_map(|&(speech, silence)| {
                std::iter::repeat(true)
                    .take(speech)
                    .chain(std::iter::repeat(false).take(silence))
            })
            .collect();
        Self {
            id: id.to_string(),
            script,
            opens: Arc::new(AtomicUsize::new(0)),
            open_delay: Duration::ZERO,
        }
    }
}

struct ScriptedStream {
    script: Vec<bool>,
    pos: usize,
}

impl InputDevice for ScriptedInput {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn open(&self, _format: &CaptureFormat) -> Result<Box<dyn InputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.open_delay);
        Ok(Box::new(ScriptedStream {
            script: self.script.clone(),
            pos: 0,
        }))
    }
}

impl InputStream for ScriptedStream {
    fn read_frame(&mut self, frame: &mut [i16], _timeout: Duration) -> Result<()> {
        let speech = self.script.get(self.pos).copied().unwrap_or(false);
        if self.pos >= self.script.len() {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.pos += 1;
        frame.fill(if speech { SPEECH } else { 0 });
        Ok(())
    }
}

/// Opens fine, then never delivers a frame.
struct DeadInput {
    id: String,
    opens: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

struct DeadStream {
    reads: Arc<AtomicUsize>,
}

impl InputDevice for DeadInput {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn open(&self, _format: &CaptureFormat) -> Result<Box<dyn InputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DeadStream {
            reads: Arc::clone(&self.reads),
        }))
    }
}

impl InputStream for DeadStream {
    fn read_frame(&mut self, _frame: &mut [i16], timeout: Duration) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(VoiceError::DeviceTimeout(timeout))
    }
}

/// Any non-zero sample is speech.
struct NonZeroVad;

impl VoiceActivityDetector for NonZeroVad {
    fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        Ok(frame.samples.iter().any(|s| *s != 0).into())
    }

    fn reset(&mut self) {}
}

fn non_zero_vad() -> VadFactory {
    Arc::new(|| Ok(Box::new(NonZeroVad) as Box<dyn VoiceActivityDetector>))
}

/// `NonZeroVad` that fails on every `every`-th frame.
struct FlakyVad {
    calls: usize,
    every: usize,
}

impl VoiceActivityDetector for FlakyVad {
    fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        self.calls += 1;
        if self.calls % self.every == 0 {
            return Err(VoiceError::Vad("classifier glitch".into()));
        }
        NonZeroVad.classify(frame)
    }

    fn reset(&mut self) {}
}

/// Numbers its replies; the first call can be made slow.
#[derive(Default)]
struct SequenceRecognizer {
    calls: AtomicUsize,
    first_delay: Duration,
}

impl RecognitionBackend for SequenceRecognizer {
    fn recognize(&self, _wav_path: &Path) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            std::thread::sleep(self.first_delay);
        }
        Ok(format!("第{n}段"))
    }
}

#[derive(Default)]
struct CountingRecognizer {
    calls: AtomicUsize,
}

impl RecognitionBackend for CountingRecognizer {
    fn recognize(&self, wav_path: &Path) -> Result<String> {
        assert!(wav_path.exists(), "segment file must exist during recognition");
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("  你好  ".to_string())
    }
}

fn config(dir: PathBuf) -> CaptureConfig {
    CaptureConfig {
        recordings_dir: dir,
        queue_timeout: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(5),
        read_timeout: Duration::from_millis(50),
        ..CaptureConfig::default()
    }
}

fn wait_for(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn short_utterance_never_reaches_recognizer() {
    let dir = temp_dir("short");
    let recognizer = Arc::new(CountingRecognizer::default());
    let engine = CaptureEngine::new(
        config(dir.clone()),
        Arc::new(ScriptedInput::new("test:short", 10, 80)),
        non_zero_vad(),
        recognizer.clone(),
    );

    engine.start().expect("start");
    assert!(wait_for(
        || engine.diagnostics().segments_dropped == 1,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.take_recognition_result(), None);

    let recording = engine.stop().expect("stop");
    assert!(recording.exists());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn long_utterance_is_recognized_exactly_once() {
    let dir = temp_dir("long");
    let recognizer = Arc::new(CountingRecognizer::default());
    let engine = CaptureEngine::new(
        config(dir.clone()),
        Arc::new(ScriptedInput::new("test:long", 20, 80)),
        non_zero_vad(),
        recognizer.clone(),
    );
    let mut events = engine.subscribe_recognitions();

    engine.start().expect("start");
    assert!(engine.is_recording());
    assert!(wait_for(
        || engine.peek_recognition_result().is_some(),
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);

    let event = events.try_recv().expect("recognition event");
    assert_eq!(event.text, "你好");
    assert_eq!(event.speech_ms, 600);

    assert_eq!(engine.take_recognition_result().as_deref(), Some("你好"));
    assert_eq!(engine.take_recognition_result(), None);

    engine.stop().expect("stop");
    assert_eq!(engine.status(), EngineStatus::Stopped);
    let leftovers = std::fs::read_dir(&dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("segment_"))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "segment files are removed after recognition");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn read_failures_stop_after_retry_budget() {
    let dir = temp_dir("dead");
    let opens = Arc::new(AtomicUsize::new(0));
    let reads = Arc::new(AtomicUsize::new(0));
    let engine = CaptureEngine::new(
        config(dir.clone()),
        Arc::new(DeadInput {
            id: "test:dead".into(),
            opens: Arc::clone(&opens),
            reads: Arc::clone(&reads),
        }),
        non_zero_vad(),
        Arc::new(CountingRecognizer::default()),
    );

    engine.start().expect("start");
    assert!(wait_for(
        || engine.status() == EngineStatus::Error,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(reads.load(Ordering::SeqCst), 3);
    assert_eq!(engine.diagnostics().read_failures, 3);

    let _ = engine.stop();
    assert_eq!(opens.load(Ordering::SeqCst), 3);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn stop_without_session_touches_nothing() {
    let input = ScriptedInput::new("test:idle", 0, 0);
    let opens = Arc::clone(&input.opens);
    let engine = CaptureEngine::new(
        config(temp_dir("idle")),
        Arc::new(input),
        non_zero_vad(),
        Arc::new(CountingRecognizer::default()),
    );

    assert!(matches!(engine.stop(), Err(VoiceError::NotRunning)));
    assert_eq!(opens.load(Ordering::SeqCst), 0);
    assert_eq!(engine.status(), EngineStatus::Idle);
}

#[test]
fn device_is_exclusive_across_engines() {
    let dir = temp_dir("claim");
    let first = CaptureEngine::new(
        config(dir.clone()),
        Arc::new(ScriptedInput::new("test:shared", 0, 0)),
        non_zero_vad(),
        Arc::new(CountingRecognizer::default()),
    );
    let second = CaptureEngine::new(
        config(dir.clone()),
        Arc::new(ScriptedInput::new("test:shared", 0, 0)),
        non_zero_vad(),
        Arc::new(CountingRecognizer::default()),
    );

    first.start().expect("first start");
    assert!(matches!(first.start(), Err(VoiceError::AlreadyRunning)));
    assert!(matches!(second.start(), Err(VoiceError::DeviceBusy(_))));

    first.stop().expect("first stop");
    second.start().expect("device released after stop");
    second.stop().expect("second stop");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn classifier_errors_skip_frames_without_losing_the_segment() {
    let dir = temp_dir("flaky-vad");
    let recognizer = Arc::new(CountingRecognizer::default());
    let engine = CaptureEngine::new(
        config(dir.clone()),
        Arc::new(ScriptedInput::new("test:flaky-vad", 30, 80)),
        Arc::new(|| Ok(Box::new(FlakyVad { calls: 0, every: 10 }) as Box<dyn VoiceActivityDetector>)),
        recognizer.clone(),
    );

    engine.start().expect("start");
    assert!(wait_for(
        || engine.peek_recognition_result().is_some(),
        Duration::from_secs(5)
    ));
    let diag = engine.diagnostics();
    assert!(diag.classifier_errors >= 3);
    assert_eq!(diag.segments_closed, 1);
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.take_recognition_result().as_deref(), Some("你好"));

    engine.stop().expect("stop");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn only_latest_recognition_is_kept_until_taken() {
    let dir = temp_dir("two-segments");
    let recognizer = Arc::new(SequenceRecognizer::default());
    let engine = CaptureEngine::new(
        config(dir.clone()),
        Arc::new(ScriptedInput::utterances("test:two-segments", &[(20, 80), (20, 80)])),
        non_zero_vad(),
        recognizer.clone(),
    );
    let mut events = engine.subscribe_recognitions();

    engine.start().expect("start");
    assert!(wait_for(
        || engine.diagnostics().results_stored == 2,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(events.try_recv().expect("first event").text, "第1段");
    assert_eq!(events.try_recv().expect("second event").text, "第2段");

    assert_eq!(engine.take_recognition_result().as_deref(), Some("第2段"));
    assert_eq!(engine.take_recognition_result(), None);

    engine.stop().expect("stop");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn accessors_stay_responsive_while_device_opens() {
    let dir = temp_dir("slow-open");
    let mut input = ScriptedInput::new("test:slow-open", 0, 0);
    input.open_delay = Duration::from_millis(800);
    let engine = Arc::new(CaptureEngine::new(
        config(dir.clone()),
        Arc::new(input),
        non_zero_vad(),
        Arc::new(CountingRecognizer::default()),
    ));

    let starter = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.start())
    };
    std::thread::sleep(Duration::from_millis(100));

    let asked = Instant::now();
    assert_eq!(engine.current_volume(), 0.0);
    assert!(!engine.is_recording());
    assert!(matches!(engine.start(), Err(VoiceError::AlreadyRunning)));
    assert!(asked.elapsed() < Duration::from_millis(200));

    starter.join().expect("starter thread").expect("start");
    assert!(engine.is_recording());
    engine.stop().expect("stop");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn late_result_from_previous_session_is_discarded() {
    let dir = temp_dir("restart");
    let recognizer = Arc::new(SequenceRecognizer {
        first_delay: Duration::from_millis(600),
        ..SequenceRecognizer::default()
    });
    let engine = CaptureEngine::new(
        CaptureConfig {
            join_timeout: Duration::from_millis(50),
            keep_segment_files: true,
            ..config(dir.clone())
        },
        Arc::new(ScriptedInput::new("test:restart", 20, 80)),
        non_zero_vad(),
        recognizer.clone(),
    );

    engine.start().expect("first start");
    assert!(wait_for(
        || recognizer.calls.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    // The first reply is still pending when the session ends.
    engine.stop().expect("first stop");
    engine.start().expect("second start");

    assert!(wait_for(
        || recognizer.calls.load(Ordering::SeqCst) == 2,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(900));
    assert_eq!(engine.take_recognition_result().as_deref(), Some("第2段"));
    assert_eq!(engine.diagnostics().results_stored, 1);

    engine.stop().expect("second stop");
    let _ = std::fs::remove_dir_all(dir);
}
