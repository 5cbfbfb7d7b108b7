//! Client facade composing transport, capture, playback and events.
//!
//! # Example
//! ```rust,no_run
//! use vocals::{AudioConfig, Settings, VocalsClient};
//!
//! # async fn run() -> Result<(), vocals::VocalsError> {
//! let client = VocalsClient::new(Settings::from_env()?, AudioConfig::default())?;
//! client.on_message(|msg| println!("{}", msg.message_type));
//!
//! let client = client.enter().await?;
//! client.start_recording().await?;
//! // ...
//! client.exit().await;
//! # Ok(())
//! # }
//! ```

use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{AudioConfig, Settings};
use crate::core::audio::{
    self, AudioCapture, AudioInput, AudioOutput, AudioPlayback, AudioQueue, AudioSegment,
};
use crate::core::connection::{ConnectionManager, ServerMessage};
use crate::core::events::{EventBus, Subscription};
use crate::core::state::{ConnectionState, PlaybackState, RecordingState};
use crate::errors::{VocalsError, VocalsResult};
use crate::tls;

/// Entry point of the SDK.
///
/// Owns one connection, one capture pipeline and one playback pipeline.
/// Every derived property reads the owning component's state; nothing is
/// duplicated here. Dropping the client tears everything down.
pub struct VocalsClient {
    settings: Arc<Settings>,
    audio: Arc<AudioConfig>,
    events: EventBus,
    connection: ConnectionManager,
    capture: AudioCapture,
    playback: AudioPlayback,
}

impl std::fmt::Debug for VocalsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VocalsClient")
            .field("connection", &self.connection_state())
            .field("recording", &self.recording_state())
            .field("playback", &self.playback_state())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl VocalsClient {
    /// Build a client using the audio devices compiled into this build.
    pub fn new(settings: Settings, audio: AudioConfig) -> VocalsResult<Self> {
        let input = audio::default_input(&audio);
        let output = audio::default_output(&audio);
        Self::with_devices(settings, audio, input, output)
    }

    /// Build a client around caller-supplied audio devices.
    pub fn with_devices(
        settings: Settings,
        audio: AudioConfig,
        input: Box<dyn AudioInput>,
        output: Box<dyn AudioOutput>,
    ) -> VocalsResult<Self> {
        settings.validate()?;
        audio.validate()?;
        tls::ensure_crypto_provider();

        let settings = Arc::new(settings);
        let audio = Arc::new(audio);
        let events = EventBus::new();

        let playback = AudioPlayback::new(AudioQueue::new(), output, audio.clone(), events.clone());
        let connection = ConnectionManager::new(
            settings.clone(),
            audio.clone(),
            events.clone(),
            playback.clone(),
        )?;
        let capture = AudioCapture::new(input, audio.clone(), events.clone());

        debug!(endpoint = %settings.ws_endpoint, "Client created");
        Ok(Self {
            settings,
            audio,
            events,
            connection,
            capture,
            playback,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn connect(&self) -> VocalsResult<()> {
        self.connection.connect().await
    }

    /// Stop recording, then close the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.capture.stop_recording().await;
        self.connection.disconnect().await;
    }

    pub async fn start_recording(&self) -> VocalsResult<()> {
        self.capture.start_recording(&self.connection).await
    }

    pub async fn stop_recording(&self) {
        self.capture.stop_recording().await;
    }

    /// Release devices, drop queued audio and close the transport.
    ///
    /// Safe to call any number of times, including on a client that never
    /// connected.
    pub fn cleanup(&self) {
        self.capture.shutdown();
        self.playback.shutdown();
        self.connection.close();
        debug!("Client cleaned up");
    }

    /// Enter a scope: connects when `auto_connect` is set. The returned
    /// guard cleans up when dropped, whichever way the scope is left.
    pub async fn enter(self) -> VocalsResult<ClientGuard> {
        if self.settings.auto_connect {
            self.connect().await?;
        }
        Ok(ClientGuard { client: self })
    }

    // =========================================================================
    // Playback and queue
    // =========================================================================

    pub fn play_audio(&self) {
        self.playback.play_audio();
    }

    pub async fn pause_audio(&self) {
        self.playback.pause_audio().await;
    }

    pub async fn stop_audio(&self) {
        self.playback.stop_audio().await;
    }

    pub fn add_to_queue(&self, segment: AudioSegment) {
        self.playback.add_to_queue(segment);
    }

    /// See [`AudioPlayback::process_audio_queue`].
    pub fn process_audio_queue<F>(&self, processor: F, consume_all: bool) -> usize
    where
        F: FnMut(AudioSegment),
    {
        self.playback.process_audio_queue(processor, consume_all)
    }

    pub fn clear_queue(&self) -> usize {
        self.playback.clear_queue()
    }

    /// Send caller-supplied JSON to the service.
    pub fn send_message(&self, message: Value) -> VocalsResult<()> {
        self.connection.send_message(message)
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.events.on_message(handler)
    }

    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.events.on_connection_change(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&VocalsError) + Send + Sync + 'static,
    {
        self.events.on_error(handler)
    }

    pub fn on_audio_data<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[f32]) + Send + Sync + 'static,
    {
        self.events.on_audio_data(handler)
    }

    // =========================================================================
    // Read-only state
    // =========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.capture.state()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.connection.is_connecting()
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }

    pub fn queue_len(&self) -> usize {
        self.playback.queue_len()
    }

    /// Copy of the queued segments. Does not consume them.
    pub fn audio_queue(&self) -> Vec<AudioSegment> {
        self.playback.queue().snapshot()
    }

    pub fn current_amplitude(&self) -> f32 {
        self.capture.amplitude()
    }

    pub fn amplitude_watch(&self) -> watch::Receiver<f32> {
        self.capture.amplitude_watch()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.connection.reconnect_attempts()
    }

    pub fn session_id(&self) -> Option<String> {
        self.connection.session_id()
    }

    /// Service modes requested when the stream is opened.
    pub fn modes(&self) -> &[String] {
        &self.settings.modes
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn audio_config(&self) -> &AudioConfig {
        &self.audio
    }
}

impl Drop for VocalsClient {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Scoped client returned by [`VocalsClient::enter`].
///
/// Dereferences to the client. Cleanup runs on drop, including during a
/// panic unwind; [`ClientGuard::exit`] does the same gracefully.
#[derive(Debug)]
pub struct ClientGuard {
    client: VocalsClient,
}

impl ClientGuard {
    /// Leave the scope: stop recording and playback, then close the
    /// transport with a proper close frame.
    pub async fn exit(self) {
        self.client.stop_audio().await;
        self.client.disconnect().await;
        info!("Client scope exited");
    }
}

impl Deref for ClientGuard {
    type Target = VocalsClient;

    fn deref(&self) -> &VocalsClient {
        &self.client
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.client.cleanup();
    }
}
