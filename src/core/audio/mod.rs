//! Local audio for the caller endpoint.
//!
//! - `frame`: PCM16 mono frames at 24kHz and the sample arithmetic used for
//!   interruption offsets
//! - `playback`: renders assistant tracks and counts what was actually played
//! - `capture`: reads local input and re-frames it for the upstream

pub mod capture;
pub mod frame;
pub mod playback;

use thiserror::Error;

pub use capture::{AudioInput, CaptureEvent, CapturePipeline, SilenceInput, WavFileInput};
pub use frame::{
    AudioFormatError, AudioFrame, FRAME_SAMPLES, FrameAssembler, SAMPLE_RATE, samples_to_duration,
    samples_to_ms,
};
pub use playback::{AudioOutput, PacedOutput, PlaybackTracker};

/// Failure of a local capture or playback device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioDeviceError {
    #[error("audio input failed: {0}")]
    Input(String),
    #[error("audio output failed: {0}")]
    Output(String),
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("WAV I/O error: {0}")]
    Wav(String),
}

impl From<hound::Error> for AudioDeviceError {
    fn from(err: hound::Error) -> Self {
        AudioDeviceError::Wav(err.to_string())
    }
}
