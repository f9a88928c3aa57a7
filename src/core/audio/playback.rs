//! Assistant audio playback with per-track render accounting.
//!
//! Deltas arrive faster than real time. Each track therefore keeps two
//! counters: samples received from the upstream and samples the output has
//! finished rendering. Only the rendered counter is used as an interruption
//! offset, because it is what the caller has actually heard.
//!
//! Rendering runs on its own task and plays chunks of at most `FRAME_SAMPLES`
//! samples in arrival order. A chunk is counted only after `AudioOutput::render`
//! returns; a chunk aborted by `stop` is not counted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::AudioDeviceError;
use super::frame::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};

// =============================================================================
// Output devices
// =============================================================================

/// A sink that plays audio at real time.
///
/// `render` resolves once the frame has been played. Dropping the future
/// aborts the frame.
#[async_trait]
pub trait AudioOutput: Send + 'static {
    async fn render(&mut self, frame: &AudioFrame) -> Result<(), AudioDeviceError>;

    async fn close(&mut self) -> Result<(), AudioDeviceError> {
        Ok(())
    }
}

/// Real-time paced output that discards audio or records it to a WAV file.
pub struct PacedOutput {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl PacedOutput {
    pub fn discard() -> Self {
        Self { writer: None }
    }

    /// Record rendered audio to `path` as 16-bit mono at 24kHz.
    pub fn wav(path: impl AsRef<Path>) -> Result<Self, AudioDeviceError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)?;
        Ok(Self {
            writer: Some(writer),
        })
    }
}

#[async_trait]
impl AudioOutput for PacedOutput {
    async fn render(&mut self, frame: &AudioFrame) -> Result<(), AudioDeviceError> {
        tokio::time::sleep(frame.duration()).await;
        if let Some(writer) = self.writer.as_mut() {
            for sample in frame.samples() {
                writer.write_sample(*sample)?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AudioDeviceError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

// =============================================================================
// Track bookkeeping
// =============================================================================

#[derive(Debug)]
struct TrackState {
    received: u64,
    rendered: u64,
    queue: VecDeque<AudioFrame>,
    stopped: bool,
    finished: bool,
    cancel: CancellationToken,
}

impl TrackState {
    fn new() -> Self {
        Self {
            received: 0,
            rendered: 0,
            queue: VecDeque::new(),
            stopped: false,
            finished: false,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default)]
struct TrackTable {
    tracks: HashMap<String, TrackState>,
    /// Track ids in order of first delta
    order: VecDeque<String>,
    /// Track whose chunk is in flight
    rendering: Option<String>,
    /// Ids retired after an interruption; late deltas for them are ignored
    interrupted: HashSet<String>,
}

impl TrackTable {
    fn next_chunk(&mut self) -> Option<(String, AudioFrame, CancellationToken)> {
        let id = self
            .order
            .iter()
            .find(|id| {
                self.tracks
                    .get(*id)
                    .is_some_and(|track| !track.stopped && !track.queue.is_empty())
            })?
            .clone();
        let track = self.tracks.get_mut(&id)?;
        let chunk = track.queue.pop_front()?;
        let cancel = track.cancel.clone();
        self.rendering = Some(id.clone());
        Some((id, chunk, cancel))
    }

    fn remove(&mut self, track_id: &str) -> Option<TrackState> {
        self.order.retain(|id| id != track_id);
        if self.rendering.as_deref() == Some(track_id) {
            self.rendering = None;
        }
        self.tracks.remove(track_id)
    }

    /// Clear the in-flight marker and retire a completed track once drained.
    fn settle(&mut self, track_id: &str) {
        if self.rendering.as_deref() == Some(track_id) {
            self.rendering = None;
        }
        let drained = self
            .tracks
            .get(track_id)
            .is_some_and(|track| track.finished && track.queue.is_empty());
        if drained {
            tracing::debug!(track_id, "Track finished playing");
            self.remove(track_id);
        }
    }
}

struct Shared {
    table: Mutex<TrackTable>,
    wake: Notify,
    shutdown: CancellationToken,
    /// Held by the render task while a chunk is in flight
    render_gate: tokio::sync::Mutex<()>,
}

// =============================================================================
// Playback tracker
// =============================================================================

/// Per-track playback state plus the task that renders it.
pub struct PlaybackTracker {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl PlaybackTracker {
    /// Start rendering to `output`. A render failure is sent once on `faults`
    /// and ends rendering.
    pub fn spawn(output: Box<dyn AudioOutput>, faults: mpsc::Sender<AudioDeviceError>) -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(TrackTable::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            render_gate: tokio::sync::Mutex::new(()),
        });
        let task = tokio::spawn(render_loop(shared.clone(), output, faults));
        Self {
            shared,
            task: Some(task),
        }
    }

    /// Queue a decoded delta for `track_id`. Returns false when the delta is
    /// ignored because the track was interrupted.
    pub fn on_audio_delta(&self, track_id: &str, frame: AudioFrame) -> bool {
        {
            let mut table = self.shared.table.lock();
            if table.interrupted.contains(track_id) {
                tracing::debug!(track_id, "Ignoring audio for interrupted track");
                return false;
            }
            if !table.tracks.contains_key(track_id) {
                tracing::debug!(track_id, "New playback track");
                table.order.push_back(track_id.to_string());
            }
            let track = table
                .tracks
                .entry(track_id.to_string())
                .or_insert_with(TrackState::new);
            if track.stopped {
                return false;
            }
            track.received += frame.sample_count();
            track.queue.extend(frame.chunks(FRAME_SAMPLES));
        }
        self.shared.wake.notify_one();
        true
    }

    /// Samples of `track_id` the output has finished rendering.
    pub fn current_offset(&self, track_id: &str) -> u64 {
        self.shared
            .table
            .lock()
            .tracks
            .get(track_id)
            .map_or(0, |track| track.rendered)
    }

    pub fn samples_received(&self, track_id: &str) -> u64 {
        self.shared
            .table
            .lock()
            .tracks
            .get(track_id)
            .map_or(0, |track| track.received)
    }

    /// The track currently being played, or the oldest one with audio still
    /// buffered. A track that has rendered everything it received is not
    /// active, even before its item completes.
    pub fn active_track(&self) -> Option<String> {
        let table = self.shared.table.lock();
        if let Some(id) = &table.rendering {
            return Some(id.clone());
        }
        table
            .order
            .iter()
            .find(|id| {
                table
                    .tracks
                    .get(*id)
                    .is_some_and(|track| !track.stopped && !track.queue.is_empty())
            })
            .cloned()
    }

    /// Stop rendering `track_id` now. Once this returns the track's rendered
    /// count no longer changes.
    pub async fn stop(&self, track_id: &str) {
        {
            let mut table = self.shared.table.lock();
            if let Some(track) = table.tracks.get_mut(track_id) {
                track.stopped = true;
                track.cancel.cancel();
                track.queue.clear();
            }
        }
        let _settled = self.shared.render_gate.lock().await;
    }

    /// Drop state for `track_id`. Stopped tracks are remembered as interrupted.
    pub fn retire(&self, track_id: &str) {
        let mut table = self.shared.table.lock();
        if let Some(track) = table.remove(track_id)
            && track.stopped
        {
            table.interrupted.insert(track_id.to_string());
        }
    }

    /// No more audio will arrive for `track_id`; retire it once it drains.
    pub fn mark_complete(&self, track_id: &str) {
        let mut table = self.shared.table.lock();
        if let Some(track) = table.tracks.get_mut(track_id) {
            track.finished = true;
        }
        if table.rendering.as_deref() != Some(track_id) {
            table.settle(track_id);
        }
    }

    /// Stop all rendering, close the output and end the render task.
    pub async fn shutdown(&mut self) {
        self.shared.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!("Playback task ended abnormally: {}", e);
        }
        let mut table = self.shared.table.lock();
        table.tracks.clear();
        table.order.clear();
        table.rendering = None;
    }
}

impl Drop for PlaybackTracker {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn render_loop(
    shared: Arc<Shared>,
    mut output: Box<dyn AudioOutput>,
    faults: mpsc::Sender<AudioDeviceError>,
) {
    loop {
        let next = shared.table.lock().next_chunk();
        let Some((track_id, chunk, cancel)) = next else {
            tokio::select! {
                _ = shared.wake.notified() => continue,
                _ = shared.shutdown.cancelled() => break,
            }
        };

        let _gate = shared.render_gate.lock().await;
        let rendered = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = cancel.cancelled() => None,
            result = output.render(&chunk) => Some(result),
        };

        let fault = {
            let mut table = shared.table.lock();
            match rendered {
                Some(Ok(())) => {
                    if let Some(track) = table.tracks.get_mut(&track_id) {
                        track.rendered += chunk.sample_count();
                    }
                    table.settle(&track_id);
                    None
                }
                Some(Err(e)) => {
                    table.rendering = None;
                    Some(e)
                }
                None => {
                    tracing::debug!(track_id = %track_id, "Chunk aborted");
                    table.settle(&track_id);
                    None
                }
            }
        };

        if let Some(e) = fault {
            tracing::error!(track_id = %track_id, "Audio output failed: {}", e);
            let _ = faults.send(e).await;
            break;
        }
    }

    if let Err(e) = output.close().await {
        tracing::warn!("Failed to close audio output: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Output that fails on the n-th render.
    struct FailingOutput {
        remaining: usize,
    }

    #[async_trait]
    impl AudioOutput for FailingOutput {
        async fn render(&mut self, frame: &AudioFrame) -> Result<(), AudioDeviceError> {
            if self.remaining == 0 {
                return Err(AudioDeviceError::Output("device unplugged".to_string()));
            }
            self.remaining -= 1;
            tokio::time::sleep(frame.duration()).await;
            Ok(())
        }
    }

    fn tracker() -> (PlaybackTracker, mpsc::Receiver<AudioDeviceError>) {
        let (faults_tx, faults_rx) = mpsc::channel(4);
        (
            PlaybackTracker::spawn(Box::new(PacedOutput::discard()), faults_tx),
            faults_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_rendered_lags_received() {
        let (tracker, _faults) = tracker();
        assert!(tracker.on_audio_delta("t1", AudioFrame::silence(4800)));
        assert_eq!(tracker.samples_received("t1"), 4800);
        assert_eq!(tracker.current_offset("t1"), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let rendered = tracker.current_offset("t1");
        assert_eq!(rendered, 960);
        assert!(rendered <= tracker.samples_received("t1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.current_offset("t1"), 4800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_offset() {
        let (tracker, _faults) = tracker();
        tracker.on_audio_delta("t1", AudioFrame::silence(9600));

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(tracker.active_track().as_deref(), Some("t1"));

        tracker.stop("t1").await;
        let offset = tracker.current_offset("t1");
        assert_eq!(offset, 4800);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.current_offset("t1"), offset);
        assert!(tracker.active_track().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_interrupted_track_ignores_deltas() {
        let (tracker, _faults) = tracker();
        tracker.on_audio_delta("t1", AudioFrame::silence(960));
        tracker.stop("t1").await;
        tracker.retire("t1");

        assert!(!tracker.on_audio_delta("t1", AudioFrame::silence(480)));
        assert_eq!(tracker.samples_received("t1"), 0);
        assert!(tracker.on_audio_delta("t2", AudioFrame::silence(480)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_track_retires_after_drain() {
        let (tracker, _faults) = tracker();
        tracker.on_audio_delta("t1", AudioFrame::silence(960));
        tracker.mark_complete("t1");
        assert_eq!(tracker.active_track().as_deref(), Some("t1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(tracker.active_track().is_none());
        // Completed tracks are not treated as interrupted
        assert!(tracker.on_audio_delta("t1", AudioFrame::silence(480)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_track_is_not_active() {
        let (tracker, _faults) = tracker();
        tracker.on_audio_delta("t1", AudioFrame::silence(960));

        // Fully rendered, item not yet reported done
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.current_offset("t1"), 960);
        assert_eq!(tracker.samples_received("t1"), 960);
        assert!(tracker.active_track().is_none());

        // More audio for the same item makes it active again
        assert!(tracker.on_audio_delta("t1", AudioFrame::silence(960)));
        assert_eq!(tracker.active_track().as_deref(), Some("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_play_in_arrival_order() {
        let (tracker, _faults) = tracker();
        tracker.on_audio_delta("a", AudioFrame::silence(960));
        tracker.on_audio_delta("b", AudioFrame::silence(960));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tracker.active_track().as_deref(), Some("a"));
        assert_eq!(tracker.current_offset("b"), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tracker.current_offset("a"), 960);
        assert_eq!(tracker.current_offset("b"), 960);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failure_reported_once() {
        let (faults_tx, mut faults_rx) = mpsc::channel(4);
        let tracker = PlaybackTracker::spawn(Box::new(FailingOutput { remaining: 1 }), faults_tx);
        tracker.on_audio_delta("t1", AudioFrame::silence(2400));

        let fault = faults_rx.recv().await.unwrap();
        assert_eq!(fault, AudioDeviceError::Output("device unplugged".to_string()));
        assert_eq!(tracker.current_offset("t1"), 480);

        // Render task has ended and dropped its sender
        assert!(faults_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wav_output_records_rendered_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let (faults_tx, _faults_rx) = mpsc::channel(1);
        let mut tracker =
            PlaybackTracker::spawn(Box::new(PacedOutput::wav(&path).unwrap()), faults_tx);

        tracker.on_audio_delta("t1", AudioFrame::new(vec![7; 960]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.shutdown().await;

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.len(), 960);
    }
}
