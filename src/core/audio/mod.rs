//! Bidirectional audio: microphone capture out, synthesized segments in.

mod capture;
mod device;
mod playback;
mod queue;
mod segment;

#[cfg(feature = "cpal-audio")]
mod cpal_device;

pub use capture::AudioCapture;
pub use device::{AudioInput, AudioOutput, FrameSender, UnavailableInput, UnavailableOutput, rms};
pub use playback::AudioPlayback;
pub use queue::AudioQueue;
pub use segment::{AudioSegment, DecodedAudio};

#[cfg(feature = "cpal-audio")]
pub use cpal_device::{CpalInput, CpalOutput, list_input_devices};

/// Default input device for this build.
pub fn default_input(config: &crate::config::AudioConfig) -> Box<dyn AudioInput> {
    #[cfg(feature = "cpal-audio")]
    {
        Box::new(CpalInput::new(config.input_device.clone()))
    }
    #[cfg(not(feature = "cpal-audio"))]
    {
        let _ = config;
        Box::new(UnavailableInput)
    }
}

/// Default output device for this build.
pub fn default_output(config: &crate::config::AudioConfig) -> Box<dyn AudioOutput> {
    #[cfg(feature = "cpal-audio")]
    {
        Box::new(CpalOutput::new(config.output_device.clone()))
    }
    #[cfg(not(feature = "cpal-audio"))]
    {
        let _ = config;
        Box::new(UnavailableOutput)
    }
}
