//! Streaming transport: connection lifecycle, reconnection and wire format.

mod manager;
mod messages;
mod reconnect;

pub use manager::ConnectionManager;
pub use messages::{ClientMessage, ERROR_TYPE, MediaFrame, ServerMessage, TTS_AUDIO_TYPE};
pub use reconnect::ReconnectPolicy;
