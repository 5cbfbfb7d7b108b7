//! Wire messages exchanged with the streaming service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::audio::AudioSegment;
use crate::errors::{VocalsError, VocalsResult};

/// Inbound frame type carrying a synthesized audio segment.
pub const TTS_AUDIO_TYPE: &str = "tts_audio";

/// Inbound frame type carrying a service error.
pub const ERROR_TYPE: &str = "error";

// =============================================================================
// Outbound
// =============================================================================

/// One captured audio frame, tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFrame {
    pub event: String,
    pub data: Vec<f32>,
    pub format: String,
    pub sample_rate: u32,
    pub session_id: String,
}

impl MediaFrame {
    pub fn new(data: Vec<f32>, format: &str, sample_rate: u32, session_id: &str) -> Self {
        Self {
            event: "media".to_string(),
            data,
            format: format.to_string(),
            sample_rate,
            session_id: session_id.to_string(),
        }
    }
}

/// Messages the client writes to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Media(MediaFrame),
    /// Caller-supplied JSON, sent as is
    Raw(Value),
}

impl ClientMessage {
    /// Serialize to the JSON text frame put on the wire.
    pub fn to_text(&self) -> VocalsResult<String> {
        let encoded = match self {
            ClientMessage::Media(frame) => serde_json::to_string(frame),
            ClientMessage::Raw(value) => serde_json::to_string(value),
        };
        encoded.map_err(|e| VocalsError::Protocol(format!("Failed to encode message: {e}")))
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// A parsed inbound frame.
///
/// The service owns the schema; only `type` is required. Anything outside
/// `type` and `data` is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> VocalsResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| VocalsError::Protocol(format!("Invalid inbound frame: {e}")))
    }

    pub fn is_audio(&self) -> bool {
        self.message_type == TTS_AUDIO_TYPE
    }

    pub fn is_error(&self) -> bool {
        self.message_type == ERROR_TYPE
    }

    /// Decode the segment carried by a `tts_audio` frame.
    ///
    /// Returns `None` for any other frame type.
    pub fn audio_segment(&self) -> Option<VocalsResult<AudioSegment>> {
        if !self.is_audio() {
            return None;
        }
        let result = match &self.data {
            Some(data) => AudioSegment::deserialize(data)
                .map_err(|e| VocalsError::Protocol(format!("Invalid tts_audio payload: {e}"))),
            None => Err(VocalsError::Protocol(
                "tts_audio frame without data".to_string(),
            )),
        };
        Some(result)
    }

    /// Convert an `error` frame into a service error.
    ///
    /// `message` and `code` are looked up in `data` first, then at the top level.
    pub fn service_error(&self) -> Option<VocalsError> {
        if !self.is_error() {
            return None;
        }
        let lookup = |key: &str| -> Option<String> {
            self.data
                .as_ref()
                .and_then(|d| d.get(key))
                .or_else(|| self.extra.get(key))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        };

        let message = lookup("message")
            .or_else(|| match &self.data {
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "unknown service error".to_string());

        Some(VocalsError::Service {
            code: lookup("code"),
            message,
        })
    }
}
