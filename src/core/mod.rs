pub mod audio;
pub mod connection;
pub mod events;
pub mod state;
pub mod token;

// Re-export commonly used types for convenience
pub use audio::{
    AudioCapture, AudioInput, AudioOutput, AudioPlayback, AudioQueue, AudioSegment, DecodedAudio,
    FrameSender, UnavailableInput, UnavailableOutput,
};

pub use connection::{ConnectionManager, ReconnectPolicy, ServerMessage};

pub use events::{EventBus, EventCategory, Subscription};

pub use state::{ConnectionState, PlaybackState, RecordingState};

pub use token::{TokenProvider, WsToken};
