use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::AudioOutput;
use super::queue::AudioQueue;
use super::segment::AudioSegment;
use crate::config::AudioConfig;
use crate::core::events::EventBus;
use crate::core::state::PlaybackState;

struct Player {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    queue: AudioQueue,
    output: Arc<dyn AudioOutput>,
    config: Arc<AudioConfig>,
    events: EventBus,
    state: RwLock<PlaybackState>,
    player: Mutex<Option<Player>>,
    next_player: AtomicU64,
}

/// Playback pipeline over the shared [`AudioQueue`].
///
/// Segments are consumed exactly once, either by the automatic player
/// (`play_audio`) or by a caller-supplied processor
/// (`process_audio_queue`), always in arrival order.
#[derive(Clone)]
pub struct AudioPlayback {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AudioPlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlayback")
            .field("state", &self.state())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl AudioPlayback {
    pub fn new(
        queue: AudioQueue,
        output: Box<dyn AudioOutput>,
        config: Arc<AudioConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                output: Arc::from(output),
                config,
                events,
                state: RwLock::new(PlaybackState::Idle),
                player: Mutex::new(None),
                next_player: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.inner.state.read()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn queue(&self) -> &AudioQueue {
        &self.inner.queue
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    fn set_state(&self, new: PlaybackState) {
        let mut state = self.inner.state.write();
        if *state != new {
            debug!(from = %*state, to = %new, "Playback state transition");
            *state = new;
        }
    }

    /// Queue a segment received from the service, starting playback when
    /// `auto_playback` is on.
    pub(crate) fn enqueue_inbound(&self, segment: AudioSegment) {
        self.inner.queue.push(segment);
        if self.inner.config.auto_playback && self.state() != PlaybackState::Paused {
            self.play_audio();
        }
    }

    pub fn add_to_queue(&self, segment: AudioSegment) {
        self.inner.queue.push(segment);
    }

    /// Hand queued segments to `processor` in arrival order.
    ///
    /// With `consume_all` the queue is drained, otherwise at most one
    /// segment is processed. Returns the number processed.
    pub fn process_audio_queue<F>(&self, mut processor: F, consume_all: bool) -> usize
    where
        F: FnMut(AudioSegment),
    {
        if !consume_all {
            return match self.inner.queue.pop() {
                Some(segment) => {
                    processor(segment);
                    1
                }
                None => 0,
            };
        }

        let segments = self.inner.queue.drain();
        let processed = segments.len();
        segments.into_iter().for_each(processor);
        processed
    }

    /// Discard every pending segment. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let dropped = self.inner.queue.clear();
        if dropped > 0 {
            debug!(dropped, "Cleared audio queue");
        }
        dropped
    }

    /// Start draining the queue to the output device.
    ///
    /// Resumes after `pause_audio()`. A no-op while already playing; with an
    /// empty queue the pipeline simply stays idle.
    pub fn play_audio(&self) {
        let mut player = self.inner.player.lock();
        if player.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return;
        }
        if self.inner.queue.is_empty() {
            *player = None;
            self.set_state(PlaybackState::Idle);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("play_audio() called outside a Tokio runtime, ignoring");
            return;
        };

        let id = self.inner.next_player.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.set_state(PlaybackState::Playing);

        let playback = self.clone();
        let player_cancel = cancel.clone();
        let handle = runtime.spawn(async move {
            playback.run_player(id, player_cancel).await;
        });
        *player = Some(Player { id, cancel, handle });
        info!(queued = self.inner.queue.len(), "Playback started");
    }

    async fn run_player(self, id: u64, cancel: CancellationToken) {
        loop {
            let Some(segment) = self.inner.queue.pop() else {
                let mut player = self.inner.player.lock();
                // A segment may have landed between the pop and the lock.
                if !self.inner.queue.is_empty() {
                    continue;
                }
                if player.as_ref().is_some_and(|p| p.id == id) {
                    *player = None;
                    self.set_state(PlaybackState::Idle);
                    debug!("Audio queue drained");
                }
                return;
            };

            let audio = match segment.decode() {
                Ok(audio) => audio,
                Err(e) => {
                    warn!(segment_id = %segment.segment_id, error = %e, "Skipping undecodable segment");
                    self.inner.events.emit_error(&e);
                    continue;
                }
            };

            debug!(
                segment_id = %segment.segment_id,
                sentence_number = segment.sentence_number,
                duration_ms = audio.duration().as_millis() as u64,
                "Playing segment"
            );

            let result = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.inner.queue.push_front(segment);
                    return;
                }
                result = self.inner.output.play(&audio) => result,
            };

            if let Err(e) = result {
                error!(
                    device = %self.inner.output.name(),
                    error = %e,
                    "Audio output failed, playback aborted"
                );
                self.inner.queue.push_front(segment);
                self.inner.events.emit_error(&e);

                let mut player = self.inner.player.lock();
                if player.as_ref().is_some_and(|p| p.id == id) {
                    *player = None;
                }
                self.set_state(PlaybackState::Idle);
                return;
            }
        }
    }

    async fn halt_player(&self) -> bool {
        let player = self.inner.player.lock().take();
        match player {
            Some(player) => {
                player.cancel.cancel();
                let _ = player.handle.await;
                true
            }
            None => false,
        }
    }

    /// Interrupt the current segment and keep it, and everything after it,
    /// queued. A no-op unless playing.
    pub async fn pause_audio(&self) {
        if self.halt_player().await {
            self.set_state(PlaybackState::Paused);
            info!(queued = self.queue_len(), "Playback paused");
        }
    }

    /// Interrupt the current segment and discard the whole queue.
    pub async fn stop_audio(&self) {
        self.halt_player().await;
        let dropped = self.inner.queue.clear();
        self.set_state(PlaybackState::Idle);
        info!(dropped, "Playback stopped");
    }

    /// Synchronous teardown for drop paths.
    pub fn shutdown(&self) {
        if let Some(player) = self.inner.player.lock().take() {
            player.cancel.cancel();
            player.handle.abort();
        }
        self.inner.queue.clear();
        self.set_state(PlaybackState::Idle);
    }
}
