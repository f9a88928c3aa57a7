//! PCM16 audio frames.
//!
//! All audio in a session is 16-bit signed little-endian, mono, at 24kHz. Capture
//! and playback both work in fixed 20ms frames so that rendered-sample counts
//! advance in predictable steps.

use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;
use thiserror::Error;

/// Sample rate used for capture and playback.
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per frame (20ms at 24kHz).
pub const FRAME_SAMPLES: usize = 480;

/// Errors produced when decoding audio payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioFormatError {
    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),
    #[error("invalid base64 audio: {0}")]
    InvalidBase64(String),
}

/// A block of PCM16 mono samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// A frame of `len` zero samples.
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![0; len],
        }
    }

    /// Decode little-endian PCM16 bytes.
    pub fn from_pcm16_le(data: &[u8]) -> Result<Self, AudioFormatError> {
        if data.len() % 2 != 0 {
            return Err(AudioFormatError::OddLength(data.len()));
        }
        let samples = data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { samples })
    }

    /// Decode a base64 PCM16 payload as carried by `response.audio.delta`.
    pub fn from_base64(encoded: &str) -> Result<Self, AudioFormatError> {
        let data = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| AudioFormatError::InvalidBase64(e.to_string()))?;
        Self::from_pcm16_le(&data)
    }

    pub fn to_pcm16_le(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Bytes::from(out)
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.to_pcm16_le())
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wall-clock time needed to play this frame.
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.sample_count())
    }

    /// Split into consecutive frames of at most `max_samples` samples.
    pub fn chunks(&self, max_samples: usize) -> impl Iterator<Item = AudioFrame> + '_ {
        self.samples
            .chunks(max_samples.max(1))
            .map(|chunk| AudioFrame::new(chunk.to_vec()))
    }
}

/// Convert a sample count to whole milliseconds, rounding down.
pub fn samples_to_ms(samples: u64) -> u64 {
    samples * 1000 / SAMPLE_RATE as u64
}

pub fn samples_to_duration(samples: u64) -> Duration {
    Duration::from_micros(samples * 1_000_000 / SAMPLE_RATE as u64)
}

/// Re-frames arbitrary sample blocks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Buffer `samples` and return every complete frame now available.
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_samples;
        if complete == 0 {
            return Vec::new();
        }
        let rest = self.pending.split_off(complete * self.frame_samples);
        let full = std::mem::replace(&mut self.pending, rest);
        full.chunks_exact(self.frame_samples)
            .map(|chunk| AudioFrame::new(chunk.to_vec()))
            .collect()
    }

    /// Emit the buffered remainder, zero-padded to a full frame.
    pub fn finish(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut last = std::mem::take(&mut self.pending);
        last.resize(self.frame_samples, 0);
        Some(AudioFrame::new(last))
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
