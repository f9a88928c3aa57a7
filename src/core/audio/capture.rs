//! Local audio capture.
//!
//! An `AudioInput` yields blocks of samples at real time. The pipeline
//! re-frames them into fixed `FRAME_SAMPLES` frames and hands them to the
//! session, which forwards them with `append_input_audio`. Muting pauses
//! reading; the input is not consumed while paused.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::AudioDeviceError;
use super::frame::{AudioFrame, FRAME_SAMPLES, FrameAssembler, SAMPLE_RATE, samples_to_duration};

/// A real-time source of caller audio.
#[async_trait]
pub trait AudioInput: Send + 'static {
    /// The next block of samples, or `None` once the input is exhausted.
    ///
    /// Must be cancel safe: dropping the future may not lose samples.
    async fn read(&mut self) -> Result<Option<AudioFrame>, AudioDeviceError>;
}

/// Plays a mono 16-bit 24kHz WAV file as if it were a microphone.
pub struct WavFileInput {
    samples: Vec<i16>,
    position: usize,
    block: usize,
}

impl WavFileInput {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioDeviceError> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
            || spec.sample_rate != SAMPLE_RATE
        {
            return Err(AudioDeviceError::UnsupportedFormat(format!(
                "expected mono 16-bit PCM at {SAMPLE_RATE}Hz, got {} channel(s), {}-bit, {}Hz",
                spec.channels, spec.bits_per_sample, spec.sample_rate
            )));
        }
        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_samples(samples))
    }

    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self {
            samples,
            position: 0,
            block: FRAME_SAMPLES,
        }
    }
}

#[async_trait]
impl AudioInput for WavFileInput {
    async fn read(&mut self) -> Result<Option<AudioFrame>, AudioDeviceError> {
        let end = (self.position + self.block).min(self.samples.len());
        if end == self.position {
            return Ok(None);
        }
        tokio::time::sleep(samples_to_duration((end - self.position) as u64)).await;
        let block = AudioFrame::new(self.samples[self.position..end].to_vec());
        self.position = end;
        Ok(Some(block))
    }
}

/// An open microphone in a silent room.
pub struct SilenceInput;

#[async_trait]
impl AudioInput for SilenceInput {
    async fn read(&mut self) -> Result<Option<AudioFrame>, AudioDeviceError> {
        tokio::time::sleep(samples_to_duration(FRAME_SAMPLES as u64)).await;
        Ok(Some(AudioFrame::silence(FRAME_SAMPLES)))
    }
}

/// Output of the capture task.
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(AudioFrame),
    /// Input exhausted; any partial frame was flushed before this
    Ended,
    Failed(AudioDeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureControl {
    Running,
    Paused,
    Stopped,
}

/// Background capture task with pause/resume control.
pub struct CapturePipeline {
    control: watch::Sender<CaptureControl>,
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn spawn(
        input: Box<dyn AudioInput>,
        events: mpsc::Sender<CaptureEvent>,
        paused: bool,
    ) -> Self {
        let initial = if paused {
            CaptureControl::Paused
        } else {
            CaptureControl::Running
        };
        let (control, control_rx) = watch::channel(initial);
        let task = tokio::spawn(capture_loop(input, events, control_rx));
        Self {
            control,
            task: Some(task),
        }
    }

    pub fn pause(&self) {
        self.set(CaptureControl::Paused);
    }

    pub fn resume(&self) {
        self.set(CaptureControl::Running);
    }

    pub fn is_paused(&self) -> bool {
        *self.control.borrow() == CaptureControl::Paused
    }

    /// Stop capturing and wait for the task to finish. No frame is emitted
    /// after this returns.
    pub async fn stop(&mut self) {
        self.set(CaptureControl::Stopped);
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
        {
            tracing::warn!("Capture task did not stop in time, aborting");
            task.abort();
        }
    }

    fn set(&self, next: CaptureControl) {
        self.control.send_if_modified(|current| {
            if *current == CaptureControl::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn capture_loop(
    mut input: Box<dyn AudioInput>,
    events: mpsc::Sender<CaptureEvent>,
    mut control: watch::Receiver<CaptureControl>,
) {
    let mut assembler = FrameAssembler::new(FRAME_SAMPLES);

    loop {
        let state = *control.borrow_and_update();
        match state {
            CaptureControl::Stopped => break,
            CaptureControl::Paused => {
                if control.changed().await.is_err() {
                    break;
                }
                continue;
            }
            CaptureControl::Running => {}
        }

        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            block = input.read() => match block {
                Ok(Some(block)) => {
                    for frame in assembler.push(block.samples()) {
                        if *control.borrow() == CaptureControl::Stopped {
                            return;
                        }
                        if events.send(CaptureEvent::Frame(frame)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => {
                    if let Some(last) = assembler.finish() {
                        let _ = events.send(CaptureEvent::Frame(last)).await;
                    }
                    tracing::debug!("Audio input ended");
                    let _ = events.send(CaptureEvent::Ended).await;
                    break;
                }
                Err(e) => {
                    tracing::error!("Audio capture failed: {}", e);
                    let _ = events.send(CaptureEvent::Failed(e)).await;
                    break;
                }
            },
        }
    }
}
