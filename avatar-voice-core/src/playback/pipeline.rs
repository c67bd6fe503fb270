//! Loop bodies of one `speak` call.
//!
//! ```text
//! sentences ─► [synthesis] ─text──► [display] ─► on_chunk
//!                   │  ◄──── ack ──────┘
//!                   └──────audio──► [playback] ─► OutputSink
//!                                        │
//!                                   done (idle timeout)
//! ```

use std::io::{ErrorKind, Read};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{ChunkCallback, PcmChunk, SentenceChunk};
use crate::audio::{wav::PcmStream, OutputDevice, OutputSink};
use crate::lifecycle::{ManagedQueue, StopSignal};
use crate::synthesis::{speed_for_sentence, SynthesisBackend, VoiceProfile};

/// Progress shared by the loops of one `speak` call.
#[derive(Debug)]
pub(crate) struct SpeakState {
    pub all_sent: AtomicBool,
    pub last_enqueue: Mutex<Instant>,
    pub sentences_failed: AtomicUsize,
    pub bytes_enqueued: AtomicU64,
    pub bytes_played: AtomicU64,
}

impl SpeakState {
    pub(crate) fn new() -> Self {
        Self {
            all_sent: AtomicBool::new(false),
            last_enqueue: Mutex::new(Instant::now()),
            sentences_failed: AtomicUsize::new(0),
            bytes_enqueued: AtomicU64::new(0),
            bytes_played: AtomicU64::new(0),
        }
    }
}

/// A sentence to show, plus the channel that releases its audio.
pub(crate) struct DisplayRequest {
    pub chunk: SentenceChunk,
    pub ack: Sender<()>,
}

// ── synthesis ───────────────────────────────────────────────────────────────

pub(crate) struct SynthesisLoop {
    pub sentences: Vec<String>,
    pub voice: VoiceProfile,
    pub backend: Arc<dyn SynthesisBackend>,
    pub read_chunk_bytes: usize,
    pub queue_timeout: Duration,
    pub slow_display_warning: Duration,
    pub text: Arc<ManagedQueue<DisplayRequest>>,
    pub audio: Arc<ManagedQueue<PcmChunk>>,
    pub state: Arc<SpeakState>,
}

impl SynthesisLoop {
    pub(crate) fn run(self, stop: StopSignal) {
        let mut buf = vec![0u8; self.read_chunk_bytes.max(2)];

        for (index, sentence) in self.sentences.iter().enumerate() {
            if stop.is_set() {
                break;
            }
            let speed = speed_for_sentence(sentence, self.voice.base_speed);
            let request = self.voice.request(sentence, speed, true);
            let mut reader = match self.backend.stream(&request) {
                Ok(reader) => reader,
                Err(e) => {
                    self.state.sentences_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(sentence = index, "synthesis request failed, sentence skipped: {e}");
                    continue;
                }
            };
            debug!(sentence = index, speed, "synthesis stream open");

            if !self.display(index, sentence, &stop) {
                return;
            }

            let mut normalizer = PcmStream::new();
            let mut broken = false;
            loop {
                if stop.is_set() {
                    return;
                }
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let pcm = normalizer.push(&buf[..n]);
                        if !self.enqueue(index, pcm, &stop) {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.state.sentences_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(sentence = index, "synthesis stream broke, rest of sentence skipped: {e}");
                        broken = true;
                        break;
                    }
                }
            }
            if !broken && !self.enqueue(index, normalizer.finish(), &stop) {
                return;
            }
        }

        self.state.all_sent.store(true, Ordering::Release);
        debug!(sentences = self.sentences.len(), "all sentences sent");
    }

    /// Hand the sentence to the display loop and wait until it was shown.
    ///
    /// Returns `false` if stopped first; the sentence's audio must not follow.
    fn display(&self, index: usize, sentence: &str, stop: &StopSignal) -> bool {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        let request = DisplayRequest {
            chunk: SentenceChunk {
                index,
                text: sentence.to_string(),
            },
            ack: ack_tx,
        };
        if !self.text.put_until_stopped(request, stop, self.queue_timeout) {
            return false;
        }
        let started = Instant::now();
        let mut warned = false;
        loop {
            match ack_rx.recv_timeout(self.queue_timeout) {
                Ok(()) => return true,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(sentence = index, "display loop dropped the sentence");
                    return false;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if stop.is_set() {
                        return false;
                    }
                    if !warned && started.elapsed() >= self.slow_display_warning {
                        warned = true;
                        warn!(
                            sentence = index,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "display callback is slow, audio held back"
                        );
                    }
                }
            }
        }
    }

    fn enqueue(&self, sentence: usize, bytes: Vec<u8>, stop: &StopSignal) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let len = bytes.len() as u64;
        if !self
            .audio
            .put_until_stopped(PcmChunk { sentence, bytes }, stop, self.queue_timeout)
        {
            return false;
        }
        *self.state.last_enqueue.lock() = Instant::now();
        self.state.bytes_enqueued.fetch_add(len, Ordering::Relaxed);
        true
    }
}

// ── display ─────────────────────────────────────────────────────────────────

pub(crate) struct DisplayLoop {
    pub on_chunk: Option<ChunkCallback>,
    pub queue_timeout: Duration,
    pub text: Arc<ManagedQueue<DisplayRequest>>,
}

impl DisplayLoop {
    pub(crate) fn run(self, stop: StopSignal) {
        while !stop.is_set() {
            let Some(request) = self.text.get(self.queue_timeout) else {
                continue;
            };
            if let Some(callback) = &self.on_chunk {
                callback(&request.chunk);
            }
            let _ = request.ack.send(());
        }
    }
}

// ── playback ────────────────────────────────────────────────────────────────

pub(crate) struct PlaybackLoop {
    pub device: Arc<dyn OutputDevice>,
    pub sample_rate: u32,
    pub queue_timeout: Duration,
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub max_reopen_attempts: u32,
    pub reopen_backoff: Duration,
    pub audio: Arc<ManagedQueue<PcmChunk>>,
    pub state: Arc<SpeakState>,
    pub done: Sender<()>,
}

impl PlaybackLoop {
    pub(crate) fn run(self, stop: StopSignal) {
        let mut reopen_budget = self.max_reopen_attempts;
        let mut sink = match self.device.open(self.sample_rate) {
            Ok(sink) => Some(sink),
            Err(e) => {
                error!(device = %self.device.id(), "failed to open output device: {e}");
                self.reopen(&mut reopen_budget, &stop)
            }
        };

        while !stop.is_set() {
            match self.audio.get(self.queue_timeout) {
                Some(chunk) => {
                    if self.write(&mut sink, &chunk, &mut reopen_budget, &stop) {
                        self.state
                            .bytes_played
                            .fetch_add(chunk.bytes.len() as u64, Ordering::Relaxed);
                    }
                }
                None => {
                    if self.finished() {
                        match sink.as_mut() {
                            Some(active) => active.drain(self.grace_period),
                            None => {
                                stop.sleep(self.grace_period);
                            }
                        }
                        info!("playback idle, speaking finished");
                        let _ = self.done.try_send(());
                        break;
                    }
                }
            }
        }
    }

    /// Write one chunk, reopening the device once on failure. Returns whether
    /// the chunk reached a sink; without one it is discarded.
    fn write(
        &self,
        sink: &mut Option<Box<dyn OutputSink>>,
        chunk: &PcmChunk,
        budget: &mut u32,
        stop: &StopSignal,
    ) -> bool {
        let Some(active) = sink.as_mut() else {
            return false;
        };
        let Err(e) = active.write(&chunk.bytes) else {
            return true;
        };
        warn!(sentence = chunk.sentence, "output write failed: {e}");
        *sink = None;
        *sink = self.reopen(budget, stop);
        match sink.as_mut().map(|active| active.write(&chunk.bytes)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(sentence = chunk.sentence, "write after reopen failed, chunk lost: {e}");
                false
            }
            None => false,
        }
    }

    /// All sentences were sent, nothing is queued, and nothing arrived for `idle_timeout`.
    fn finished(&self) -> bool {
        self.state.all_sent.load(Ordering::Acquire)
            && self.audio.is_empty()
            && self.state.last_enqueue.lock().elapsed() >= self.idle_timeout
    }

    fn reopen(&self, budget: &mut u32, stop: &StopSignal) -> Option<Box<dyn OutputSink>> {
        while *budget > 0 {
            *budget -= 1;
            if stop.sleep(self.reopen_backoff) {
                return None;
            }
            match self.device.open(self.sample_rate) {
                Ok(sink) => {
                    info!(device = %self.device.id(), "output device reopened");
                    return Some(sink);
                }
                Err(e) => warn!(remaining = *budget, "reopening output device failed: {e}"),
            }
        }
        error!("output device unavailable, remaining audio is discarded");
        None
    }
}
