//! In-process mock of the voice streaming service
//!
//! Accepts WebSocket connections on an ephemeral port, sends a scripted set
//! of frames to every client and records everything the client sends.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use vocals::{AudioConfig, AudioInput, AudioOutput, DecodedAudio, FrameSender, VocalsResult};

/// How the mock treats connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Serve every connection normally
    Serve,
    /// Close the first connection after the script, fail every later handshake
    CloseThenRefuse,
    /// Close the first connection after the script, serve later ones normally
    CloseOnceThenServe,
}

#[derive(Default)]
pub struct MockState {
    pub accepts: AtomicU64,
    pub received: Mutex<Vec<Value>>,
    pub last_query: Mutex<Option<String>>,
}

pub struct MockService {
    pub addr: std::net::SocketAddr,
    pub state: Arc<MockState>,
}

impl MockService {
    pub async fn start(behavior: Behavior, script: Vec<Value>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let script = Arc::new(script);

        let server_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = server_state.accepts.fetch_add(1, Ordering::SeqCst) + 1;

                if behavior == Behavior::CloseThenRefuse && n > 1 {
                    drop(stream);
                    continue;
                }

                let close_after_script = match behavior {
                    Behavior::Serve => false,
                    Behavior::CloseThenRefuse | Behavior::CloseOnceThenServe => n == 1,
                };

                let state = server_state.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state, script, close_after_script).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/stream/conversation", self.addr)
    }

    pub fn accepts(&self) -> u64 {
        self.state.accepts.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn media_frames(&self) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|v| v["event"] == "media")
            .collect()
    }

    pub fn last_query(&self) -> Option<String> {
        self.state.last_query.lock().clone()
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockState>,
    script: Arc<Vec<Value>>,
    close_after_script: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let query_state = state.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *query_state.last_query.lock() = req.uri().query().map(String::from);
        Ok(resp)
    };
    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws_stream.split();

    for frame in script.iter() {
        write.send(Message::Text(frame.to_string().into())).await?;
    }

    if close_after_script {
        write.send(Message::Close(None)).await?;
        return Ok(());
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                    state.received.lock().push(value);
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// `tts_audio` frame whose pcm_f32le payload holds `samples` samples.
pub fn segment_frame(sentence_number: u32, samples: usize) -> Value {
    let payload: Vec<u8> = std::iter::repeat_n(0.25f32, samples)
        .flat_map(|s| s.to_le_bytes())
        .collect();
    json!({
        "type": "tts_audio",
        "data": {
            "text": format!("Sentence {sentence_number}."),
            "audio_data": BASE64.encode(payload),
            "sample_rate": 24000,
            "segment_id": format!("seg-{sentence_number}"),
            "sentence_number": sentence_number,
            "generation_time_ms": 12.5,
            "format": "pcm_f32le",
            "duration_seconds": samples as f64 / 24000.0
        }
    })
}

/// Input that produces constant-valued frames every few milliseconds
pub struct ScriptedInput {
    pub level: f32,
    pub stops: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ScriptedInput {
    pub fn new(level: f32) -> Self {
        Self {
            level,
            stops: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl AudioInput for ScriptedInput {
    fn start(&mut self, config: &AudioConfig, frames: FrameSender) -> VocalsResult<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let frame = vec![self.level; config.buffer_size];
        self.worker = Some(std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                if frames.send(frame.clone()).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Input whose device takes `open_delay` to open and never produces frames
pub struct SlowInput {
    pub open_delay: Duration,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    frames: Option<FrameSender>,
}

impl SlowInput {
    pub fn new(open_delay: Duration) -> Self {
        Self {
            open_delay,
            starts: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
            frames: None,
        }
    }
}

impl AudioInput for SlowInput {
    fn start(&mut self, _config: &AudioConfig, frames: FrameSender) -> VocalsResult<()> {
        std::thread::sleep(self.open_delay);
        self.frames = Some(frames);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.frames = None;
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Input that delivers `frames` frames and then hangs up
pub struct FailingInput {
    pub frames: usize,
}

impl AudioInput for FailingInput {
    fn start(&mut self, config: &AudioConfig, frames: FrameSender) -> VocalsResult<()> {
        let count = self.frames;
        let frame = vec![0.2; config.buffer_size];
        std::thread::spawn(move || {
            for _ in 0..count {
                if frames.send(frame.clone()).is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Output that records the sample count of everything it plays
#[derive(Clone, Default)]
pub struct RecordingOutput {
    pub played: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, audio: &DecodedAudio) -> VocalsResult<()> {
        self.played.lock().push(audio.samples.len());
        Ok(())
    }
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Timed out waiting for {what}");
}
