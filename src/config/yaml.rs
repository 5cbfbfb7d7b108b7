use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::Settings;
use crate::errors::{VocalsError, VocalsResult};

/// Settings as they appear in a YAML file
///
/// All fields are optional to allow partial configuration; anything left out
/// keeps the value coming from the environment or the defaults.
///
/// # Example YAML structure
/// ```yaml
/// ws_endpoint: "wss://voice.example.com/v1/stream/conversation"
/// token_endpoint: "/api/wstoken"
/// headers:
///   x-api-key: "your-key"
/// auto_connect: false
/// max_reconnect_attempts: 5
/// reconnect_delay: 0.5
/// token_refresh_buffer: 30
/// use_token_auth: true
/// modes: ["transcription", "voice_assistant"]
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct YamlSettings {
    pub token_endpoint: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub auto_connect: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay: Option<f64>,
    pub token_refresh_buffer: Option<f64>,
    pub ws_endpoint: Option<String>,
    pub use_token_auth: Option<bool>,
    pub modes: Option<Vec<String>>,
}

impl YamlSettings {
    /// Load YAML settings from a file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - A field has an invalid type or is unknown
    pub fn from_file(path: &Path) -> VocalsResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VocalsError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        serde_yaml::from_str(&contents)
            .map_err(|e| VocalsError::Config(format!("Failed to parse YAML config: {e}")))
    }

    fn apply(self, settings: &mut Settings) {
        if let Some(v) = self.token_endpoint {
            settings.token_endpoint = v;
        }
        if let Some(v) = self.headers {
            settings.headers = v;
        }
        if let Some(v) = self.auto_connect {
            settings.auto_connect = v;
        }
        if let Some(v) = self.max_reconnect_attempts {
            settings.max_reconnect_attempts = v;
        }
        if let Some(v) = self.reconnect_delay {
            settings.reconnect_delay = v;
        }
        if let Some(v) = self.token_refresh_buffer {
            settings.token_refresh_buffer = v;
        }
        if let Some(v) = self.ws_endpoint {
            settings.ws_endpoint = v;
        }
        if let Some(v) = self.use_token_auth {
            settings.use_token_auth = v;
        }
        if let Some(v) = self.modes {
            settings.modes = v;
        }
    }
}

impl Settings {
    /// Load settings from a YAML file layered over environment variables.
    pub fn from_file(path: &Path) -> VocalsResult<Self> {
        let _ = dotenvy::dotenv();

        let mut settings = Settings::default();
        settings.apply_env()?;
        YamlSettings::from_file(path)?.apply(&mut settings);
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_settings_full() {
        let yaml = r#"
ws_endpoint: "wss://voice.example.com/v1/stream/conversation"
token_endpoint: "https://auth.example.com/token"
headers:
  x-api-key: "secret"
auto_connect: false
max_reconnect_attempts: 7
reconnect_delay: 0.5
token_refresh_buffer: 15
use_token_auth: false
modes: ["transcription", "voice_assistant"]
"#;
        let parsed: YamlSettings = serde_yaml::from_str(yaml).unwrap();
        let mut settings = Settings::default();
        parsed.apply(&mut settings);

        assert_eq!(
            settings.ws_endpoint,
            "wss://voice.example.com/v1/stream/conversation"
        );
        assert_eq!(settings.token_endpoint, "https://auth.example.com/token");
        assert_eq!(settings.headers.get("x-api-key"), Some(&"secret".to_string()));
        assert!(!settings.auto_connect);
        assert_eq!(settings.max_reconnect_attempts, 7);
        assert_eq!(settings.reconnect_delay, 0.5);
        assert_eq!(settings.token_refresh_buffer, 15.0);
        assert!(!settings.use_token_auth);
        assert_eq!(settings.modes, vec!["transcription", "voice_assistant"]);
    }

    #[test]
    fn test_yaml_settings_partial_keeps_defaults() {
        let parsed: YamlSettings = serde_yaml::from_str("max_reconnect_attempts: 1").unwrap();
        let mut settings = Settings::default();
        parsed.apply(&mut settings);

        assert_eq!(settings.max_reconnect_attempts, 1);
        assert_eq!(settings.token_endpoint, "/api/wstoken");
        assert!(settings.auto_connect);
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let result: Result<YamlSettings, _> = serde_yaml::from_str("debug_level: DEBUG");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vocals.yaml");
        fs::write(
            &path,
            "ws_endpoint: \"ws://127.0.0.1:9000/stream\"\nuse_token_auth: false\n",
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.ws_endpoint, "ws://127.0.0.1:9000/stream");
        assert!(!settings.use_token_auth);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = YamlSettings::from_file(Path::new("/nonexistent/vocals.yaml"));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("invalid.yaml");
        fs::write(&path, "invalid: yaml: content:").unwrap();

        let result = YamlSettings::from_file(&path);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
