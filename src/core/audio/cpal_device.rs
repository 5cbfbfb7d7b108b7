//! Hardware audio through CPAL (Cross-Platform Audio Library).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::device::{AudioInput, AudioOutput, FrameSender};
use super::segment::DecodedAudio;
use crate::config::AudioConfig;
use crate::errors::{VocalsError, VocalsResult};

/// Poll interval while waiting for an output stream to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Extra time for the device buffer to play out after the last sample.
const DRAIN_TAIL: Duration = Duration::from_millis(50);

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched by its owning device object, which
/// the pipelines access from one thread at a time.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}
unsafe impl Sync for SendableStream {}

fn find_device(name: Option<&str>, input: bool) -> VocalsResult<cpal::Device> {
    let host = cpal::default_host();
    let kind = if input { "input" } else { "output" };

    let Some(name) = name else {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| VocalsError::Device(format!("No default {kind} device")));
    };

    let devices = if input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| VocalsError::Device(format!("Failed to enumerate {kind} devices: {e}")))?;

    for device in devices {
        if let Ok(device_name) = device.name()
            && device_name == name
        {
            return Ok(device);
        }
    }
    Err(VocalsError::Device(format!("{kind} device '{name}' not found")))
}

/// Names of the available input devices.
pub fn list_input_devices() -> VocalsResult<Vec<String>> {
    let devices = cpal::default_host()
        .input_devices()
        .map_err(|e| VocalsError::Device(format!("Failed to enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Microphone capture through CPAL.
///
/// Samples are re-chunked into frames of `buffer_size` before being sent.
/// A stream error drops the frame sender, which the capture pipeline
/// reports as a device failure.
pub struct CpalInput {
    device_name: Option<String>,
    stream: Option<SendableStream>,
}

impl CpalInput {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            stream: None,
        }
    }

    fn build_stream(
        &self,
        device: &cpal::Device,
        config: &AudioConfig,
        frames: FrameSender,
    ) -> VocalsResult<cpal::Stream> {
        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let frame_len = config.buffer_size.max(1);
        let sink = Arc::new(Mutex::new(Some(frames)));

        let error_sink = sink.clone();
        let err_callback = move |err| {
            error!(error = %err, "Input stream error");
            error_sink.lock().take();
        };

        // f32 first, then i16 for devices that only expose integer formats.
        let f32_sink = sink.clone();
        let mut pending: Vec<f32> = Vec::with_capacity(frame_len * 2);
        let f32_result = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                pending.extend_from_slice(data);
                push_frames(&f32_sink, &mut pending, frame_len);
            },
            err_callback.clone(),
            None,
        );
        if let Ok(stream) = f32_result {
            return Ok(stream);
        }

        let i16_sink = sink;
        let mut pending: Vec<f32> = Vec::with_capacity(frame_len * 2);
        device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    pending.extend(data.iter().map(|&s| s as f32 / 32768.0));
                    push_frames(&i16_sink, &mut pending, frame_len);
                },
                err_callback,
                None,
            )
            .map_err(|e| VocalsError::Device(format!("Failed to build input stream: {e}")))
    }
}

fn push_frames(sink: &Mutex<Option<FrameSender>>, pending: &mut Vec<f32>, frame_len: usize) {
    let mut sink = sink.lock();
    while pending.len() >= frame_len {
        let frame: Vec<f32> = pending.drain(..frame_len).collect();
        let delivered = sink.as_ref().is_some_and(|tx| tx.send(frame).is_ok());
        if !delivered {
            sink.take();
            pending.clear();
            return;
        }
    }
}

impl AudioInput for CpalInput {
    fn start(&mut self, config: &AudioConfig, frames: FrameSender) -> VocalsResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = find_device(self.device_name.as_deref(), true)?;
        let stream = self.build_stream(&device, config, frames)?;
        stream
            .play()
            .map_err(|e| VocalsError::Device(format!("Failed to start input stream: {e}")))?;

        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate,
            channels = config.channels,
            "Input stream started"
        );
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.0.pause() {
                debug!(error = %e, "Failed to pause input stream");
            }
            debug!("Input stream stopped");
        }
    }

    fn name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| "default input".to_string())
    }
}

/// Speaker output through CPAL. A stream is opened per segment and dropped
/// when the segment ends or the play future is dropped.
pub struct CpalOutput {
    device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn play(&self, audio: &DecodedAudio) -> VocalsResult<()> {
        if audio.is_empty() {
            return Ok(());
        }

        let samples = Arc::new(audio.samples.clone());
        let position = Arc::new(AtomicUsize::new(0));
        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let stream = {
            let device = find_device(self.device_name.as_deref(), false)?;
            let config = cpal::StreamConfig {
                channels: audio.channels,
                sample_rate: cpal::SampleRate(audio.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let source = samples.clone();
            let cursor = position.clone();
            let failed = failure.clone();
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let start = cursor.fetch_add(data.len(), Ordering::Relaxed);
                        for (i, out) in data.iter_mut().enumerate() {
                            *out = source.get(start + i).copied().unwrap_or(0.0);
                        }
                    },
                    move |err| {
                        error!(error = %err, "Output stream error");
                        *failed.lock() = Some(err.to_string());
                    },
                    None,
                )
                .map_err(|e| VocalsError::Device(format!("Failed to build output stream: {e}")))?;
            stream
                .play()
                .map_err(|e| VocalsError::Device(format!("Failed to start output stream: {e}")))?;
            SendableStream(stream)
        };

        while position.load(Ordering::Relaxed) < samples.len() {
            if let Some(err) = failure.lock().take() {
                return Err(VocalsError::Device(format!("Output stream failed: {err}")));
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        tokio::time::sleep(DRAIN_TAIL).await;
        drop(stream);
        Ok(())
    }

    fn name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| "default output".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_push_frames_rechunks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Mutex::new(Some(tx));
        let mut pending = vec![0.1; 10];

        push_frames(&sink, &mut pending, 4);
        assert_eq!(pending.len(), 2);
        assert_eq!(rx.try_recv().unwrap().len(), 4);
        assert_eq!(rx.try_recv().unwrap().len(), 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_push_frames_drops_sender_when_receiver_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = Mutex::new(Some(tx));
        let mut pending = vec![0.0; 8];

        push_frames(&sink, &mut pending, 4);
        assert!(sink.lock().is_none());
        assert!(pending.is_empty());
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_list_input_devices() {
        let devices = list_input_devices().unwrap();
        println!("Input devices: {devices:?}");
    }
}
