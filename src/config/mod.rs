//! Client configuration.
//!
//! Settings are resolved once, before a client exists, from defaults,
//! environment variables and an optional YAML file. Priority:
//! YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `env`: Environment variable loading
//! - `yaml`: YAML configuration file loading
//! - `utils`: Parsing helpers
//!
//! # Example
//! ```rust,no_run
//! use vocals::config::Settings;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Defaults with environment overrides
//! let settings = Settings::from_env()?;
//!
//! // YAML file on top of the environment
//! let settings = Settings::from_file(&PathBuf::from("vocals.yaml"))?;
//! println!("Streaming to {}", settings.ws_endpoint);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{VocalsError, VocalsResult};

mod env;
mod utils;
mod yaml;

pub use yaml::YamlSettings;

/// Default token endpoint path, resolved against the transport host.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "/api/wstoken";

/// Default streaming endpoint.
pub const DEFAULT_WS_ENDPOINT: &str = "ws://localhost:8000/v1/stream/conversation";

/// Connection and authentication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Token endpoint, absolute URL or path relative to the transport host
    pub token_endpoint: String,
    /// Extra headers sent with token requests
    pub headers: HashMap<String, String>,
    /// Connect automatically when entering a client scope
    pub auto_connect: bool,
    /// Reconnection attempts after a transport loss (0 disables reconnection)
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts, in seconds
    pub reconnect_delay: f64,
    /// Refresh the token this many seconds before it expires
    pub token_refresh_buffer: f64,
    /// Streaming transport endpoint (ws:// or wss://)
    pub ws_endpoint: String,
    /// Whether to fetch a token and attach it to the transport URL
    pub use_token_auth: bool,
    /// Service features requested for the stream, e.g. `transcription`
    pub modes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            headers: HashMap::new(),
            auto_connect: true,
            max_reconnect_attempts: 3,
            reconnect_delay: 1.0,
            token_refresh_buffer: 60.0,
            ws_endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            use_token_auth: true,
            modes: Vec::new(),
        }
    }
}

impl Settings {
    /// Check the settings for values the client cannot work with.
    pub fn validate(&self) -> VocalsResult<()> {
        validate_seconds("reconnect_delay", self.reconnect_delay)?;
        validate_seconds("token_refresh_buffer", self.token_refresh_buffer)?;

        let endpoint = self.transport_url()?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(VocalsError::Config(format!(
                "ws_endpoint must use ws:// or wss://, got {}",
                endpoint.scheme()
            )));
        }

        if let Some(mode) = self
            .modes
            .iter()
            .find(|m| m.trim().is_empty() || m.contains(','))
        {
            return Err(VocalsError::Config(format!(
                "Invalid mode '{mode}': modes must be non-empty and must not contain ','"
            )));
        }

        if self.use_token_auth {
            self.token_url()?;
        }
        Ok(())
    }

    /// Delay between reconnection attempts.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.reconnect_delay).unwrap_or_default()
    }

    /// How long before expiry a token is considered stale.
    pub fn refresh_buffer(&self) -> Duration {
        Duration::try_from_secs_f64(self.token_refresh_buffer).unwrap_or_default()
    }

    /// Parsed transport endpoint.
    pub fn transport_url(&self) -> VocalsResult<Url> {
        Url::parse(&self.ws_endpoint)
            .map_err(|e| VocalsError::Config(format!("Invalid ws_endpoint '{}': {e}", self.ws_endpoint)))
    }

    /// Transport endpoint with the requested modes attached as the `modes`
    /// query parameter (comma separated). Left unchanged when no mode is set.
    pub fn stream_url(&self) -> VocalsResult<Url> {
        let mut url = self.transport_url()?;
        if !self.modes.is_empty() {
            url.query_pairs_mut()
                .append_pair("modes", &self.modes.join(","));
        }
        Ok(url)
    }

    /// Token endpoint as an absolute URL.
    ///
    /// A relative endpoint is resolved against the transport host, mapping
    /// `ws` to `http` and `wss` to `https`.
    pub fn token_url(&self) -> VocalsResult<Url> {
        if let Ok(url) = Url::parse(&self.token_endpoint) {
            return Ok(url);
        }

        let mut base = self.transport_url()?;
        let scheme = match base.scheme() {
            "wss" | "https" => "https",
            _ => "http",
        };
        base.set_scheme(scheme).map_err(|_| {
            VocalsError::Config(format!(
                "Cannot derive token host from ws_endpoint '{}'",
                self.ws_endpoint
            ))
        })?;
        base.join(&self.token_endpoint).map_err(|e| {
            VocalsError::Config(format!(
                "Invalid token_endpoint '{}': {e}",
                self.token_endpoint
            ))
        })
    }
}

fn validate_seconds(key: &str, value: f64) -> VocalsResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(VocalsError::Config(format!(
            "{key} must be a non-negative number of seconds, got {value}"
        )));
    }
    Ok(())
}

/// Audio format negotiated with the devices and the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Capture channel count
    pub channels: u16,
    /// Wire format of outbound frames
    pub format: String,
    /// Samples per captured frame
    pub buffer_size: usize,
    /// Play inbound segments as they arrive
    pub auto_playback: bool,
    /// Input device name, system default when unset
    pub input_device: Option<String>,
    /// Output device name, system default when unset
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            format: "pcm_f32le".to_string(),
            buffer_size: 1024,
            auto_playback: true,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> VocalsResult<()> {
        if self.sample_rate == 0 {
            return Err(VocalsError::Config("sample_rate must be positive".to_string()));
        }
        if self.channels == 0 {
            return Err(VocalsError::Config("channels must be positive".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(VocalsError::Config("buffer_size must be positive".to_string()));
        }
        Ok(())
    }
}
