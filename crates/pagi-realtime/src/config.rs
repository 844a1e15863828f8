//! Runtime settings: file + environment layering for the realtime session.

use crate::audio::AudioFormat;
use crate::error::RealtimeResult;
use crate::session::{ControllerOptions, SessionConfig, TurnDetection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for one realtime deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSettings {
    /// Websocket endpoint of the realtime service
    pub endpoint: String,
    pub model: String,
    /// Falls back to `OPENAI_API_KEY` when unset
    #[serde(default)]
    pub api_key: Option<String>,
    pub sample_rate: u32,
    /// Capture frame length in milliseconds
    pub frame_ms: u32,
    pub inbox_capacity: usize,
    pub instructions: String,
    pub voice: String,
    #[serde(default)]
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetection,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            endpoint: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
            api_key: None,
            sample_rate: 24000,
            frame_ms: 100,
            inbox_capacity: 256,
            instructions: session.instructions,
            voice: session.voice,
            transcription_model: session.transcription_model,
            turn_detection: session.turn_detection,
        }
    }
}

impl RealtimeSettings {
    /// Load settings. Precedence: env `PAGI_REALTIME__*` > file at `PAGI_REALTIME_CONFIG`
    /// (default `config/realtime.toml`) > defaults.
    pub fn load() -> RealtimeResult<Self> {
        let config_path =
            std::env::var("PAGI_REALTIME_CONFIG").unwrap_or_else(|_| "config/realtime.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> RealtimeResult<Self> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("endpoint", defaults.endpoint)?
            .set_default("model", defaults.model)?
            .set_default("sample_rate", defaults.sample_rate as i64)?
            .set_default("frame_ms", defaults.frame_ms as i64)?
            .set_default("inbox_capacity", defaults.inbox_capacity as i64)?
            .set_default("instructions", defaults.instructions)?
            .set_default("voice", defaults.voice)?
            .set_default("transcription_model", defaults.transcription_model)?
            .set_default("turn_detection", "manual")?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PAGI_REALTIME").separator("__"))
            .build()?;

        let mut settings: Self = built.try_deserialize()?;
        if settings.api_key.is_none() {
            settings.api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        }
        Ok(settings)
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::with_frame_ms(self.sample_rate, self.frame_ms)
    }

    /// Session configuration restored on every disconnect.
    pub fn session_defaults(&self) -> SessionConfig {
        SessionConfig {
            instructions: self.instructions.clone(),
            turn_detection: self.turn_detection,
            transcription_model: self.transcription_model.clone(),
            voice: self.voice.clone(),
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            format: self.audio_format(),
            session: self.session_defaults(),
            inbox_capacity: self.inbox_capacity,
        }
    }

    /// Full websocket URL including the model query.
    pub fn websocket_url(&self) -> String {
        format!("{}?model={}", self.endpoint, self.model)
    }
}
