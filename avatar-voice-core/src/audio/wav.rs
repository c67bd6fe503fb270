//! WAV persistence and PCM stream normalisation.
//!
//! All artifacts are mono 16-bit PCM written with hound. Streamed synthesis
//! payloads may start with a RIFF header (sometimes split across network
//! reads); [`PcmStream`] strips it and keeps every emitted block sample
//! aligned.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, warn};

use crate::error::Result;

/// Headers larger than this are assumed not to be headers at all.
const MAX_HEADER_BYTES: usize = 64 * 1024;

fn spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Write mono 16-bit samples to `path`, creating parent directories.
pub fn write_pcm16_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = hound::WavWriter::create(path, spec(sample_rate))?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    debug!(path = %path.display(), samples = samples.len(), "wav written");
    Ok(())
}

/// Wrap raw s16le bytes in a WAV container held in memory.
pub fn wav_bytes_from_pcm(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec(sample_rate))?;
        for pair in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

pub fn is_riff(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// `<dir>/<prefix>_<local time formatted with fmt><suffix>.wav`
pub fn timestamped_path(dir: &Path, prefix: &str, fmt: &str, suffix: &str) -> PathBuf {
    let stamp = Local::now().format(fmt);
    dir.join(format!("{prefix}_{stamp}{suffix}.wav"))
}

/// Offset of the first PCM byte after a RIFF/WAVE header, if the `data`
/// chunk header is already in `bytes`.
fn data_offset(bytes: &[u8]) -> Option<usize> {
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]]);
        if id == b"data" {
            return Some(pos + 8);
        }
        let padded = size as usize + (size as usize & 1);
        pos = pos.checked_add(8 + padded)?;
    }
    None
}

#[derive(Debug)]
enum HeaderState {
    /// Not enough bytes yet to tell whether a header is present.
    Sniffing,
    /// RIFF seen, waiting for the `data` chunk.
    InHeader,
    Pcm,
}

/// Incremental normaliser for one streamed synthesis response.
#[derive(Debug)]
pub struct PcmStream {
    state: HeaderState,
    pending: Vec<u8>,
}

impl Default for PcmStream {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmStream {
    pub fn new() -> Self {
        Self {
            state: HeaderState::Sniffing,
            pending: Vec::new(),
        }
    }

    /// Feed one network read; returns an even-length block of PCM (possibly empty).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(bytes);

        if matches!(self.state, HeaderState::Sniffing) {
            if self.pending.len() < 4 {
                return Vec::new();
            }
            self.state = if &self.pending[..4] == b"RIFF" {
                HeaderState::InHeader
            } else {
                HeaderState::Pcm
            };
        }

        if matches!(self.state, HeaderState::InHeader) {
            match data_offset(&self.pending) {
                Some(offset) if offset <= self.pending.len() => {
                    self.pending.drain(..offset);
                    self.state = HeaderState::Pcm;
                }
                _ if self.pending.len() > MAX_HEADER_BYTES => {
                    warn!(bytes = self.pending.len(), "no data chunk found, passing stream through");
                    self.state = HeaderState::Pcm;
                }
                _ => return Vec::new(),
            }
        }

        let aligned = self.pending.len() & !1;
        let rest = self.pending.split_off(aligned);
        std::mem::replace(&mut self.pending, rest)
    }

    /// End of stream. Returns whatever aligned PCM is left; an odd final byte is dropped.
    pub fn finish(mut self) -> Vec<u8> {
        if matches!(self.state, HeaderState::InHeader) {
            return Vec::new();
        }
        let aligned = self.pending.len() & !1;
        self.pending.truncate(aligned);
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_then(pcm: &[u8]) -> Vec<u8> {
        let mut bytes = wav_bytes_from_pcm(&[], 32_000).unwrap();
        bytes.extend_from_slice(pcm);
        bytes
    }

    #[test]
    fn raw_pcm_passes_through_aligned() {
        let mut stream = PcmStream::new();
        assert_eq!(stream.push(&[1, 2, 3, 4, 5]), vec![1, 2, 3, 4]);
        assert_eq!(stream.push(&[6]), vec![5, 6]);
        assert!(stream.finish().is_empty());
    }

    #[test]
    fn header_split_across_reads_is_stripped() {
        let bytes = header_then(&[10, 11, 12, 13]);
        let mut stream = PcmStream::new();
        let mut out = Vec::new();
        for piece in bytes.chunks(3) {
            out.extend(stream.push(piece));
        }
        out.extend(stream.finish());
        assert_eq!(out, vec![10, 11, 12, 13]);
    }

    #[test]
    fn short_payload_is_flushed_on_finish() {
        let mut stream = PcmStream::new();
        assert!(stream.push(&[7, 8]).is_empty());
        assert_eq!(stream.finish(), vec![7, 8]);
    }

    #[test]
    fn wrapped_pcm_is_riff() {
        let wav = wav_bytes_from_pcm(&[0, 0, 1, 0], 32_000).unwrap();
        assert!(is_riff(&wav));
        assert_eq!(data_offset(&wav), Some(44));
        assert_eq!(wav.len(), 48);
    }

    #[test]
    fn writes_readable_wav_file() {
        let path = std::env::temp_dir().join(format!("avatar-voice-wav-{}.wav", std::process::id()));
        write_pcm16_wav(&path, &[1, -1, 300], 16_000).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 3);
        let _ = std::fs::remove_file(path);
    }
}
