//! Buffers between real-time device callbacks and the loop threads.
//!
//! Uses `ringbuf::HeapRb<f32>`: `push_slice` / `pop_slice` are wait-free and
//! allocation-free, so they are safe inside cpal callbacks.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half — held by whichever side writes samples.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by whichever side reads samples.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Capture ring: 2^18 samples ≈ 5.4 s at 48 kHz, far more than one read
/// timeout worth of audio.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 18;

/// Playback ring, in device-rate mono samples. Kept small (≈ 0.7 s at 48 kHz)
/// so that sink writes block and pace the playback loop in real time.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 15;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}
