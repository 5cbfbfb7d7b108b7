use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::messages::{ClientMessage, MediaFrame, ServerMessage};
use super::reconnect::ReconnectPolicy;
use crate::config::{AudioConfig, Settings};
use crate::core::audio::AudioPlayback;
use crate::core::events::EventBus;
use crate::core::state::ConnectionState;
use crate::core::token::{TokenProvider, authorize_url};
use crate::errors::{VocalsError, VocalsResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long a graceful close may take before the transport is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `disconnect()` waits for the IO task before aborting it.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the pump loop returned.
enum PumpEnd {
    Cancelled,
    Lost(String),
}

struct Inner {
    settings: Arc<Settings>,
    audio: Arc<AudioConfig>,
    transport_url: Url,
    tokens: Option<TokenProvider>,
    policy: ReconnectPolicy,
    events: EventBus,
    playback: AudioPlayback,
    state: RwLock<ConnectionState>,
    /// Serializes state transitions so events go out in transition order.
    transition: ReentrantMutex<()>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
    reconnect_attempts: AtomicU32,
    session_id: RwLock<Option<String>>,
}

/// Owns the streaming transport and the connection state machine.
///
/// ```text
/// Disconnected/Error --connect()--> Connecting --open ok--> Connected
///                                        |                      |
///                                   open failed            transport lost
///                                        v                      v
///                                      Error <--exhausted-- Reconnecting
/// any state --disconnect()--> Disconnected
/// ```
///
/// The transport is driven by one IO task per connection. Outbound frames
/// reach it through an unbounded channel so producers never wait on the
/// socket.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.transport_url.as_str())
            .field("state", &self.state())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        settings: Arc<Settings>,
        audio: Arc<AudioConfig>,
        events: EventBus,
        playback: AudioPlayback,
    ) -> VocalsResult<Self> {
        let transport_url = settings.stream_url()?;
        let tokens = if settings.use_token_auth {
            Some(TokenProvider::new(&settings)?)
        } else {
            None
        };
        let policy = ReconnectPolicy::from_settings(&settings);

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                audio,
                transport_url,
                tokens,
                policy,
                events,
                playback,
                state: RwLock::new(ConnectionState::Disconnected),
                transition: ReentrantMutex::new(()),
                outbound: Mutex::new(None),
                cancel: Mutex::new(None),
                task: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                session_id: RwLock::new(None),
            }),
        })
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Attempts made in the current reconnection episode.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Session id minted for the currently open transport.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    pub fn token_provider(&self) -> Option<&TokenProvider> {
        self.inner.tokens.as_ref()
    }

    /// Move to `new` and notify handlers. No event when the state is unchanged.
    fn set_state(&self, new: ConnectionState) -> bool {
        let _guard = self.inner.transition.lock();
        {
            let mut state = self.inner.state.write();
            if *state == new {
                return false;
            }
            debug!(from = %*state, to = %new, "Connection state transition");
            *state = new;
        }
        self.inner.events.emit_connection_state(new);
        true
    }

    /// Transition only if `cancel` has not fired, so a racing `disconnect()`
    /// always has the last word.
    fn set_state_unless_cancelled(&self, cancel: &CancellationToken, new: ConnectionState) -> bool {
        let _guard = self.inner.transition.lock();
        if cancel.is_cancelled() {
            return false;
        }
        self.set_state(new);
        true
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the transport.
    ///
    /// A no-op when already connected. Fails with `State` while a connection
    /// attempt or reconnection is in progress. Open failures are dispatched
    /// to the error handlers, move the state to `Error` and are returned.
    ///
    /// Automatic retries, bounded by `max_reconnect_attempts`, only apply to
    /// a transport lost after `Connected`. A failed initial open is left to
    /// the caller, who sees the error directly and decides whether to call
    /// `connect()` again.
    pub async fn connect(&self) -> VocalsResult<()> {
        let cancel = {
            let _guard = self.inner.transition.lock();
            let current = self.state();
            if current == ConnectionState::Connected {
                return Ok(());
            }
            if !current.can_connect() {
                return Err(VocalsError::State(format!(
                    "connect() called while {current}"
                )));
            }

            let cancel = CancellationToken::new();
            *self.inner.cancel.lock() = Some(cancel.clone());
            // A task left over from an exhausted reconnection has already ended.
            if let Some(stale) = self.inner.task.lock().take() {
                stale.abort();
            }
            self.set_state(ConnectionState::Connecting);
            cancel
        };

        info!(endpoint = %self.inner.transport_url, "Connecting");

        let opened = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.open_transport() => Some(result),
        };

        let ws = match opened {
            None => {
                debug!("Connection attempt cancelled");
                return Err(VocalsError::Connection(
                    "Connection attempt cancelled".to_string(),
                ));
            }
            Some(Err(e)) => {
                error!(error = %e, "Failed to connect");
                if self.set_state_unless_cancelled(&cancel, ConnectionState::Error) {
                    self.inner.events.emit_error(&e);
                }
                return Err(e);
            }
            Some(Ok(ws)) => ws,
        };

        let _guard = self.inner.transition.lock();
        if cancel.is_cancelled() {
            debug!("Disconnect raced the transport open, dropping it");
            return Err(VocalsError::Connection(
                "Connection attempt cancelled".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);
        self.start_session();

        let (sink, source) = ws.split();
        let manager = self.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            manager.run_transport(sink, source, rx, task_cancel).await;
        });
        *self.inner.task.lock() = Some(handle);

        self.set_state(ConnectionState::Connected);
        info!(
            session_id = self.session_id().as_deref().unwrap_or_default(),
            "Connected"
        );
        Ok(())
    }

    /// Close the transport and move to `Disconnected`.
    ///
    /// Interrupts a pending connect or reconnection attempt. Idempotent: a
    /// second call emits no event.
    pub async fn disconnect(&self) {
        let task = {
            let _guard = self.inner.transition.lock();
            self.stop_io()
        };

        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(DISCONNECT_TIMEOUT, task).await.is_err() {
                warn!("Transport task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.finish_disconnect();
    }

    /// Synchronous teardown for drop paths: the IO task is aborted instead
    /// of being allowed to send a close frame.
    pub fn close(&self) {
        let task = {
            let _guard = self.inner.transition.lock();
            self.stop_io()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.finish_disconnect();
    }

    fn stop_io(&self) -> Option<JoinHandle<()>> {
        if let Some(cancel) = self.inner.cancel.lock().take() {
            cancel.cancel();
        }
        *self.inner.outbound.lock() = None;
        self.inner.task.lock().take()
    }

    fn finish_disconnect(&self) {
        *self.inner.session_id.write() = None;
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        if self.set_state(ConnectionState::Disconnected) {
            info!("Disconnected");
        }
    }

    fn start_session(&self) {
        let session_id = Uuid::new_v4().to_string();
        *self.inner.session_id.write() = Some(session_id);
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send one captured frame as a media message.
    ///
    /// Fails with `NotConnected` unless the state is `Connected`.
    pub fn send_audio(&self, samples: &[f32]) -> VocalsResult<()> {
        if !self.is_connected() {
            return Err(VocalsError::NotConnected);
        }
        let session_id = self.session_id().unwrap_or_default();
        let frame = MediaFrame::new(
            samples.to_vec(),
            &self.inner.audio.format,
            self.inner.audio.sample_rate,
            &session_id,
        );
        self.send(ClientMessage::Media(frame))
    }

    /// Send caller-supplied JSON as a text frame.
    pub fn send_message(&self, message: Value) -> VocalsResult<()> {
        if !self.is_connected() {
            return Err(VocalsError::NotConnected);
        }
        self.send(ClientMessage::Raw(message))
    }

    fn send(&self, message: ClientMessage) -> VocalsResult<()> {
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| VocalsError::NotConnected),
            None => Err(VocalsError::NotConnected),
        }
    }

    // =========================================================================
    // Transport IO
    // =========================================================================

    async fn open_transport(&self) -> VocalsResult<WsStream> {
        let url = match &self.inner.tokens {
            Some(tokens) => {
                let token = tokens.token().await?;
                authorize_url(&self.inner.transport_url, &token)
            }
            None => self.inner.transport_url.clone(),
        };

        let (ws, _response) = connect_async(url.as_str()).await.map_err(|e| {
            VocalsError::Connection(format!(
                "Failed to open transport to {}: {e}",
                self.inner.transport_url
            ))
        })?;
        Ok(ws)
    }

    async fn run_transport(
        self,
        mut sink: WsSink,
        mut source: WsSource,
        mut rx: mpsc::UnboundedReceiver<ClientMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            match self.pump(&mut sink, &mut source, &mut rx, &cancel).await {
                PumpEnd::Cancelled => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
                    debug!("Transport closed");
                    break;
                }
                PumpEnd::Lost(reason) => {
                    warn!(reason = %reason, "Transport lost");

                    // Frames queued for the dead transport belong to the old session.
                    while rx.try_recv().is_ok() {}

                    match self.reconnect(&cancel).await {
                        Some(ws) => {
                            let (new_sink, new_source) = ws.split();
                            sink = new_sink;
                            source = new_source;
                        }
                        None => break,
                    }
                }
            }
        }
        trace!("Transport task ended");
    }

    async fn pump(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
        cancel: &CancellationToken,
    ) -> PumpEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return PumpEnd::Cancelled,

                outgoing = rx.recv() => {
                    let Some(message) = outgoing else {
                        return PumpEnd::Cancelled;
                    };
                    let text = match message.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Dropping unencodable outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return PumpEnd::Lost(format!("write failed: {e}"));
                    }
                }

                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.route_inbound(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        trace!(len = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return PumpEnd::Lost(format!("pong failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by service ({}): {}", f.code, f.reason.as_str()))
                            .unwrap_or_else(|| "closed by service".to_string());
                        return PumpEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
                    None => return PumpEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }

    /// Retry the transport with a fixed delay until it opens or the attempt
    /// budget runs out. Returns `None` when cancelled or exhausted.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<WsStream> {
        let policy = self.inner.policy;
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        if !self.set_state_unless_cancelled(cancel, ConnectionState::Reconnecting) {
            return None;
        }

        let mut attempts = 0;
        while policy.should_retry(attempts) {
            attempts += 1;
            self.inner.reconnect_attempts.store(attempts, Ordering::SeqCst);
            info!(
                attempt = attempts,
                max_attempts = policy.max_attempts,
                delay_ms = policy.delay.as_millis() as u64,
                "Attempting reconnection"
            );

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(policy.delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.open_transport() => result,
            };

            match result {
                Ok(ws) => {
                    let _guard = self.inner.transition.lock();
                    if cancel.is_cancelled() {
                        return None;
                    }
                    self.start_session();
                    self.set_state(ConnectionState::Connected);
                    info!(attempt = attempts, "Reconnected");
                    return Some(ws);
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Reconnection attempt failed");
                    if let (VocalsError::Connection(_), Some(tokens)) = (&e, &self.inner.tokens) {
                        // The service may have rejected the token itself.
                        tokens.invalidate().await;
                    }
                    if !cancel.is_cancelled() {
                        self.inner.events.emit_error(&e);
                    }
                }
            }
        }

        let _guard = self.inner.transition.lock();
        if cancel.is_cancelled() {
            return None;
        }
        error!(attempts, "Reconnection attempts exhausted");
        *self.inner.outbound.lock() = None;
        self.inner
            .events
            .emit_error(&VocalsError::ReconnectExhausted { attempts });
        self.set_state(ConnectionState::Error);
        None
    }

    /// Decode one inbound text frame and route it.
    ///
    /// Segments go to the playback queue before the message is dispatched,
    /// so a message handler can already see the segment queued.
    fn route_inbound(&self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                self.inner.events.emit_error(&e);
                return;
            }
        };

        match message.audio_segment() {
            Some(Ok(segment)) => {
                debug!(
                    segment_id = %segment.segment_id,
                    sentence_number = segment.sentence_number,
                    "Received audio segment"
                );
                self.inner.playback.enqueue_inbound(segment);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Dropping malformed audio segment");
                self.inner.events.emit_error(&e);
            }
            None => {}
        }

        if let Some(service_error) = message.service_error() {
            warn!(error = %service_error, "Service reported an error");
            self.inner.events.emit_error(&service_error);
        }

        trace!(message_type = %message.message_type, "Dispatching message");
        self.inner.events.emit_message(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::{AudioQueue, UnavailableOutput};

    fn manager_with(settings: Settings) -> ConnectionManager {
        let events = EventBus::new();
        let audio = Arc::new(AudioConfig {
            auto_playback: false,
            ..Default::default()
        });
        let playback = AudioPlayback::new(
            AudioQueue::new(),
            Box::new(UnavailableOutput),
            audio.clone(),
            events.clone(),
        );
        ConnectionManager::new(Arc::new(settings), audio, events, playback).unwrap()
    }

    fn offline_settings() -> Settings {
        Settings {
            use_token_auth: false,
            ws_endpoint: "ws://127.0.0.1:1/stream".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_state() {
        let manager = manager_with(offline_settings());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert!(!manager.is_connecting());
        assert_eq!(manager.reconnect_attempts(), 0);
        assert!(manager.session_id().is_none());
        assert!(manager.token_provider().is_none());
    }

    #[test]
    fn test_token_provider_built_when_enabled() {
        let manager = manager_with(Settings::default());
        let provider = manager.token_provider().unwrap();
        assert_eq!(provider.url().as_str(), "http://localhost:8000/api/wstoken");
    }

    #[test]
    fn test_send_requires_connection() {
        let manager = manager_with(offline_settings());
        assert_eq!(
            manager.send_audio(&[0.0; 4]),
            Err(VocalsError::NotConnected)
        );
        assert_eq!(
            manager.send_message(serde_json::json!({"event": "ping"})),
            Err(VocalsError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_error_and_dispatches() {
        let manager = manager_with(offline_settings());
        let states = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let s = states.clone();
        manager
            .inner
            .events
            .on_connection_change(move |state| s.lock().push(*state));
        let e = errors.clone();
        manager.inner.events.on_error(move |err| e.lock().push(err.clone()));

        let result = manager.connect().await;
        assert!(matches!(result, Err(VocalsError::Connection(_))));
        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(
            *states.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Error]
        );
        assert_eq!(errors.lock().len(), 1);

        // Error is not terminal
        assert!(manager.state().can_connect());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager_with(offline_settings());
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        manager
            .inner
            .events
            .on_connection_change(move |state| e.lock().push(*state));

        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(events.lock().is_empty());

        let _ = manager.connect().await;
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(
            *events.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Error,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn test_close_on_fresh_manager() {
        let manager = manager_with(offline_settings());
        manager.close();
        manager.close();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_route_inbound_queues_segment_and_dispatches() {
        let manager = manager_with(offline_settings());
        let types = Arc::new(Mutex::new(Vec::new()));
        let t = types.clone();
        manager
            .inner
            .events
            .on_message(move |msg| t.lock().push(msg.message_type.clone()));

        let frame = serde_json::json!({
            "type": "tts_audio",
            "data": {
                "text": "Hi.",
                "audio_data": "",
                "sample_rate": 24000,
                "segment_id": "s1",
                "sentence_number": 1,
                "generation_time_ms": 10.0,
                "format": "pcm_f32le",
                "duration_seconds": 0.0
            }
        });
        manager.route_inbound(&frame.to_string());
        manager.route_inbound(r#"{"type":"transcription","data":{"text":"hello"}}"#);

        assert_eq!(manager.inner.playback.queue_len(), 1);
        assert_eq!(*types.lock(), vec!["tts_audio", "transcription"]);
    }

    #[test]
    fn test_route_inbound_error_frames() {
        let manager = manager_with(offline_settings());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let messages = Arc::new(AtomicU32::new(0));

        let e = errors.clone();
        manager.inner.events.on_error(move |err| e.lock().push(err.clone()));
        let m = messages.clone();
        manager.inner.events.on_message(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
        });

        manager.route_inbound(r#"{"type":"error","data":{"message":"overloaded"}}"#);
        manager.route_inbound("{garbage");

        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], VocalsError::Service { message, .. } if message == "overloaded"));
        assert!(matches!(&errors[1], VocalsError::Protocol(_)));
        // Only the parsed frame reaches message handlers
        assert_eq!(messages.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
