//! Frame-counted speech segmentation.
//!
//! ```text
//!            speech                    silence × N (N < trailing)
//!  Silence ──────────► Speech ◄─────────────────────────────┐
//!     ▲                  │ silence × trailing               │
//!     │                  ▼                                  │
//!     └──── Closed (speech ≥ min) / Dropped (speech < min) ─┘
//! ```
//!
//! Durations are counted in frames rather than wall-clock time, so the same
//! input always segments the same way.

use crate::buffering::frame::FRAME_MS;
use crate::vad::VadDecision;

/// Outcome of feeding one classified frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Silence outside a segment.
    Idle,
    /// This frame started a segment.
    Opened,
    /// This frame belongs to the open segment.
    Continued,
    /// This frame completed the trailing silence; the segment is long enough.
    Closed { speech_ms: u64 },
    /// This frame completed the trailing silence; the segment is too short.
    Dropped { speech_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct Segmenter {
    trailing_silence_frames: u32,
    min_speech_ms: u64,
    in_speech: bool,
    frames_in_segment: u32,
    trailing_silence: u32,
}

impl Segmenter {
    pub fn new(trailing_silence_frames: u32, min_speech_ms: u64) -> Self {
        Self {
            trailing_silence_frames: trailing_silence_frames.max(1),
            min_speech_ms,
            in_speech: false,
            frames_in_segment: 0,
            trailing_silence: 0,
        }
    }

    /// `true` from the frame that opened a segment until it closes or drops.
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn push(&mut self, decision: VadDecision) -> Transition {
        if !self.in_speech {
            if !decision.is_speech() {
                return Transition::Idle;
            }
            self.in_speech = true;
            self.frames_in_segment = 1;
            self.trailing_silence = 0;
            return Transition::Opened;
        }

        self.frames_in_segment += 1;
        if decision.is_speech() {
            self.trailing_silence = 0;
            return Transition::Continued;
        }

        self.trailing_silence += 1;
        if self.trailing_silence < self.trailing_silence_frames {
            return Transition::Continued;
        }

        let speech_frames = self.frames_in_segment - self.trailing_silence;
        let speech_ms = speech_frames as u64 * FRAME_MS as u64;
        self.reset();
        if speech_ms >= self.min_speech_ms {
            Transition::Closed { speech_ms }
        } else {
            Transition::Dropped { speech_ms }
        }
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
        self.frames_in_segment = 0;
        self.trailing_silence = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VadDecision::{Silence, Speech};

    fn feed(seg: &mut Segmenter, decision: VadDecision, n: usize) -> Vec<Transition> {
        (0..n).map(|_| seg.push(decision)).collect()
    }

    #[test]
    fn short_utterance_is_dropped() {
        let mut seg = Segmenter::new(60, 500);
        let mut out = feed(&mut seg, Speech, 10);
        out.extend(feed(&mut seg, Silence, 67));
        assert_eq!(out[0], Transition::Opened);
        assert!(out.contains(&Transition::Dropped { speech_ms: 300 }));
        assert!(!out.iter().any(|t| matches!(t, Transition::Closed { .. })));
    }

    #[test]
    fn long_utterance_closes_once() {
        let mut seg = Segmenter::new(60, 500);
        let mut out = feed(&mut seg, Speech, 20);
        out.extend(feed(&mut seg, Silence, 67));
        let closes: Vec<_> = out
            .iter()
            .filter(|t| matches!(t, Transition::Closed { .. }))
            .collect();
        assert_eq!(closes, vec![&Transition::Closed { speech_ms: 600 }]);
        assert_eq!(out[20 + 59], Transition::Closed { speech_ms: 600 });
        assert!(!seg.in_speech());
    }

    #[test]
    fn pauses_shorter_than_trailing_keep_segment_open() {
        let mut seg = Segmenter::new(60, 500);
        feed(&mut seg, Speech, 10);
        feed(&mut seg, Silence, 30);
        assert!(seg.in_speech());
        feed(&mut seg, Speech, 10);
        let out = feed(&mut seg, Silence, 60);
        assert_eq!(out.last(), Some(&Transition::Closed { speech_ms: 1_500 }));
    }

    #[test]
    fn silence_outside_segment_is_idle() {
        let mut seg = Segmenter::new(3, 90);
        assert_eq!(seg.push(Silence), Transition::Idle);
        assert!(!seg.in_speech());
    }
}
