use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::device::{AudioInput, rms};
use crate::config::AudioConfig;
use crate::core::connection::ConnectionManager;
use crate::core::events::EventBus;
use crate::core::state::RecordingState;
use crate::errors::{VocalsError, VocalsResult};

/// How long a synchronous shutdown waits for the device to be free.
const SHUTDOWN_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Progress of the input device open for one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenPhase {
    Opening,
    Open,
    /// Stopped while opening; the open task releases the device itself.
    Abandoned,
}

struct CaptureSession {
    cancel: CancellationToken,
    phase: Arc<Mutex<OpenPhase>>,
    forward: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Cancel the session. Returns whether the caller must release the
    /// device, which is only the case once the open has completed.
    fn abandon(&self) -> bool {
        self.cancel.cancel();
        let mut phase = self.phase.lock();
        match *phase {
            OpenPhase::Opening => {
                *phase = OpenPhase::Abandoned;
                false
            }
            OpenPhase::Open => true,
            OpenPhase::Abandoned => false,
        }
    }
}

struct Inner {
    config: Arc<AudioConfig>,
    events: EventBus,
    input: Arc<Mutex<Box<dyn AudioInput>>>,
    state: RwLock<RecordingState>,
    amplitude: watch::Sender<f32>,
    session: Mutex<Option<CaptureSession>>,
}

/// Microphone capture pipeline.
///
/// Frames from the input device are measured (RMS, published as the current
/// amplitude), dispatched to audio-data handlers and then sent over the
/// connection. Frames captured while the connection is down are dropped.
#[derive(Clone)]
pub struct AudioCapture {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapture")
            .field("state", &self.state())
            .field("amplitude", &self.amplitude())
            .finish()
    }
}

impl AudioCapture {
    pub fn new(input: Box<dyn AudioInput>, config: Arc<AudioConfig>, events: EventBus) -> Self {
        let (amplitude, _) = watch::channel(0.0);
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                input: Arc::new(Mutex::new(input)),
                state: RwLock::new(RecordingState::Idle),
                amplitude,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        *self.inner.state.read()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecordingState::Recording
    }

    /// RMS of the most recent frame, 0.0 when not recording.
    pub fn amplitude(&self) -> f32 {
        *self.inner.amplitude.borrow()
    }

    /// Receiver that always holds the latest amplitude. Intermediate values
    /// are overwritten, never queued.
    pub fn amplitude_watch(&self) -> watch::Receiver<f32> {
        self.inner.amplitude.subscribe()
    }

    /// Open the input device and start streaming frames over `connection`.
    ///
    /// Fails with `State` when the connection is not open, leaving the
    /// recording state untouched. A device failure is dispatched to the
    /// error handlers, returns the pipeline to `Idle` and is returned.
    /// Calling it while already recording is a no-op.
    pub async fn start_recording(&self, connection: &ConnectionManager) -> VocalsResult<()> {
        if !connection.is_connected() {
            return Err(VocalsError::State(format!(
                "start_recording() requires an active connection (connection is {})",
                connection.state()
            )));
        }

        {
            let mut state = self.inner.state.write();
            match *state {
                RecordingState::Idle => *state = RecordingState::Recording,
                RecordingState::Recording => {
                    debug!("Already recording");
                    return Ok(());
                }
                RecordingState::Stopping => {
                    return Err(VocalsError::State(
                        "start_recording() called while recording is stopping".to_string(),
                    ));
                }
            }
        }

        let cancel = CancellationToken::new();
        let phase = Arc::new(Mutex::new(OpenPhase::Opening));
        *self.inner.session.lock() = Some(CaptureSession {
            cancel: cancel.clone(),
            phase: phase.clone(),
            forward: None,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let input = self.inner.input.clone();
        let config = (*self.inner.config).clone();
        let open = tokio::task::spawn_blocking(move || {
            let mut input = input.lock();
            debug!(device = %input.name(), "Opening input device");
            let result = input.start(&config, tx);

            let mut open_phase = phase.lock();
            if *open_phase == OpenPhase::Abandoned {
                if result.is_ok() {
                    debug!("Recording stopped during device open, releasing input");
                    input.stop();
                }
            } else if result.is_ok() {
                *open_phase = OpenPhase::Open;
            }
            result
        });

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Recording stopped while the input device was opening");
                return Ok(());
            }
            result = open => result,
        };

        let opened = opened
            .map_err(|e| VocalsError::Device(format!("Input device task failed: {e}")))
            .and_then(|result| result);

        if let Err(e) = opened {
            if !cancel.is_cancelled() {
                error!(error = %e, "Failed to open input device");
                self.inner.session.lock().take();
                *self.inner.state.write() = RecordingState::Idle;
                self.inner.events.emit_error(&e);
            }
            return Err(e);
        }

        let capture = self.clone();
        let connection = connection.clone();
        let forward_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            capture.forward_frames(rx, connection, forward_cancel).await;
        });

        let mut session = self.inner.session.lock();
        match session.as_mut() {
            Some(session) if !cancel.is_cancelled() => session.forward = Some(handle),
            // stop_recording() won the race; the forward task sees the
            // cancellation and exits on its own.
            _ => return Ok(()),
        }

        info!(
            sample_rate = self.inner.config.sample_rate,
            channels = self.inner.config.channels,
            buffer_size = self.inner.config.buffer_size,
            "Recording started"
        );
        Ok(())
    }

    async fn forward_frames(
        self,
        mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
        connection: ConnectionManager,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame, &connection),
                    None => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.device_lost(&cancel).await;
                        break;
                    }
                },
            }
        }
        trace!("Frame forwarding ended");
    }

    fn handle_frame(&self, frame: &[f32], connection: &ConnectionManager) {
        self.inner.amplitude.send_replace(rms(frame));
        self.inner.events.emit_audio_data(frame);

        match connection.send_audio(frame) {
            Ok(()) => {}
            Err(VocalsError::NotConnected) => {
                trace!(samples = frame.len(), "Dropping frame while not connected");
            }
            Err(e) => warn!(error = %e, "Failed to send audio frame"),
        }
    }

    /// The device hung up without being asked to: abort this pipeline only.
    async fn device_lost(&self, cancel: &CancellationToken) {
        {
            let mut state = self.inner.state.write();
            if *state != RecordingState::Recording || cancel.is_cancelled() {
                return;
            }
            *state = RecordingState::Stopping;
        }

        let err = VocalsError::Device("Input device stopped delivering audio".to_string());
        error!(error = %err, "Recording aborted");

        self.inner.session.lock().take();
        self.release_device().await;
        self.inner.amplitude.send_replace(0.0);
        *self.inner.state.write() = RecordingState::Idle;
        self.inner.events.emit_error(&err);
    }

    async fn release_device(&self) {
        let input = self.inner.input.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || input.lock().stop()).await {
            warn!(error = %e, "Input device stop task failed");
        }
    }

    /// Stop capturing and release the device.
    ///
    /// Interrupts a device open still in flight. A no-op when not recording.
    pub async fn stop_recording(&self) {
        {
            let mut state = self.inner.state.write();
            if *state != RecordingState::Recording {
                debug!(state = %*state, "stop_recording() with nothing to stop");
                return;
            }
            *state = RecordingState::Stopping;
        }

        let session = self.inner.session.lock().take();
        let opened = match session {
            Some(session) => {
                let opened = session.abandon();
                if let Some(forward) = session.forward {
                    let _ = forward.await;
                }
                opened
            }
            None => false,
        };

        if opened {
            self.release_device().await;
        }
        self.inner.amplitude.send_replace(0.0);
        *self.inner.state.write() = RecordingState::Idle;
        info!("Recording stopped");
    }

    /// Synchronous teardown for drop paths.
    pub fn shutdown(&self) {
        if self.state() == RecordingState::Idle {
            return;
        }

        let opened = match self.inner.session.lock().take() {
            Some(session) => {
                let opened = session.abandon();
                if let Some(forward) = session.forward {
                    forward.abort();
                }
                opened
            }
            None => false,
        };

        if opened {
            match self.inner.input.try_lock_for(SHUTDOWN_LOCK_TIMEOUT) {
                Some(mut input) => input.stop(),
                None => warn!("Input device busy during shutdown, leaving it to close on its own"),
            }
        }

        self.inner.amplitude.send_replace(0.0);
        *self.inner.state.write() = RecordingState::Idle;
        debug!("Capture shut down");
    }
}
