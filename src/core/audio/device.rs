//! Audio device abstractions.
//!
//! The pipelines talk to hardware only through these traits, so tests and
//! headless hosts can plug in their own sources and sinks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::segment::DecodedAudio;
use crate::config::AudioConfig;
use crate::errors::{VocalsError, VocalsResult};

/// Channel captured frames are pushed into. Each frame holds
/// `AudioConfig::buffer_size` interleaved samples (the last may be shorter).
pub type FrameSender = mpsc::UnboundedSender<Vec<f32>>;

/// Microphone-like source of f32 frames.
///
/// `start` may block while the device opens; the capture pipeline runs it
/// on a blocking thread. Frames are pushed from whatever thread the device
/// delivers them on. Dropping the sender signals the device failed.
pub trait AudioInput: Send {
    fn start(&mut self, config: &AudioConfig, frames: FrameSender) -> VocalsResult<()>;

    /// Stop delivering frames and release the device. Must be safe to call
    /// when not started.
    fn stop(&mut self);

    fn name(&self) -> String {
        "input".to_string()
    }
}

/// Speaker-like sink for decoded audio.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `audio` to completion.
    ///
    /// Dropping the returned future must silence the output promptly; the
    /// playback pipeline relies on that for pause and stop.
    async fn play(&self, audio: &DecodedAudio) -> VocalsResult<()>;

    fn name(&self) -> String {
        "output".to_string()
    }
}

/// Input used when no audio backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableInput;

impl AudioInput for UnavailableInput {
    fn start(&mut self, _config: &AudioConfig, _frames: FrameSender) -> VocalsResult<()> {
        Err(VocalsError::Device(
            "No audio input backend available (build with the `cpal-audio` feature)".to_string(),
        ))
    }

    fn stop(&mut self) {}

    fn name(&self) -> String {
        "unavailable".to_string()
    }
}

/// Output used when no audio backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableOutput;

#[async_trait]
impl AudioOutput for UnavailableOutput {
    async fn play(&self, _audio: &DecodedAudio) -> VocalsResult<()> {
        Err(VocalsError::Device(
            "No audio output backend available (build with the `cpal-audio` feature)".to_string(),
        ))
    }

    fn name(&self) -> String {
        "unavailable".to_string()
    }
}

/// Root-mean-square level of a frame, 0.0 for an empty frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
