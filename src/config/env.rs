use std::env;

use super::Settings;
use super::utils::{parse_bool, parse_value};
use crate::errors::{VocalsError, VocalsResult};

pub(super) const TOKEN_ENDPOINT_VAR: &str = "VOCALS_TOKEN_ENDPOINT";
pub(super) const WS_ENDPOINT_VAR: &str = "VOCALS_WS_ENDPOINT";
pub(super) const AUTO_CONNECT_VAR: &str = "VOCALS_AUTO_CONNECT";
pub(super) const MAX_RECONNECT_ATTEMPTS_VAR: &str = "VOCALS_MAX_RECONNECT_ATTEMPTS";
pub(super) const RECONNECT_DELAY_VAR: &str = "VOCALS_RECONNECT_DELAY";
pub(super) const TOKEN_REFRESH_BUFFER_VAR: &str = "VOCALS_TOKEN_REFRESH_BUFFER";
pub(super) const USE_TOKEN_AUTH_VAR: &str = "VOCALS_USE_TOKEN_AUTH";
pub(super) const MODES_VAR: &str = "VOCALS_MODES";

impl Settings {
    /// Load settings from environment variables
    ///
    /// Starts from the defaults and applies every `VOCALS_*` variable that is
    /// set. Also loads from .env file if present using dotenvy.
    ///
    /// # Errors
    /// Returns `VocalsError::Config` if a variable is set but malformed.
    pub fn from_env() -> VocalsResult<Self> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut settings = Settings::default();
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `VOCALS_*` environment overrides on top of the current values.
    pub(super) fn apply_env(&mut self) -> VocalsResult<()> {
        if let Some(endpoint) = read_var(TOKEN_ENDPOINT_VAR) {
            self.token_endpoint = endpoint;
        }
        if let Some(endpoint) = read_var(WS_ENDPOINT_VAR) {
            self.ws_endpoint = endpoint;
        }
        if let Some(raw) = read_var(AUTO_CONNECT_VAR) {
            self.auto_connect = parse_flag(AUTO_CONNECT_VAR, &raw)?;
        }
        if let Some(raw) = read_var(MAX_RECONNECT_ATTEMPTS_VAR) {
            self.max_reconnect_attempts = parse_value(MAX_RECONNECT_ATTEMPTS_VAR, &raw)?;
        }
        if let Some(raw) = read_var(RECONNECT_DELAY_VAR) {
            self.reconnect_delay = parse_value(RECONNECT_DELAY_VAR, &raw)?;
        }
        if let Some(raw) = read_var(TOKEN_REFRESH_BUFFER_VAR) {
            self.token_refresh_buffer = parse_value(TOKEN_REFRESH_BUFFER_VAR, &raw)?;
        }
        if let Some(raw) = read_var(USE_TOKEN_AUTH_VAR) {
            self.use_token_auth = parse_flag(USE_TOKEN_AUTH_VAR, &raw)?;
        }
        if let Some(raw) = read_var(MODES_VAR) {
            self.modes = parse_list(&raw);
        }
        Ok(())
    }
}

fn read_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Comma-separated list, blanks dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(key: &str, raw: &str) -> VocalsResult<bool> {
    parse_bool(raw).ok_or_else(|| {
        VocalsError::Config(format!(
            "Invalid value for {key} ('{raw}'): expected true/false"
        ))
    })
}
