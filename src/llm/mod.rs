pub mod chat;
pub mod payload;
pub mod reconcile;

use serde::{ Deserialize, Serialize };
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.0;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;
pub const MIN_TIMEOUT_SECS: u64 = 30;
pub const MAX_TIMEOUT_SECS: u64 = 120;

/// Per-session request settings. Setters clamp into range, so a stored
/// value is always valid.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RequestConfig {
    model: String,
    temperature: f32,
    timeout_seconds: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RequestConfig {
    pub fn new(model: impl Into<String>, temperature: f32, timeout_seconds: u64) -> Self {
        let mut config = Self::default();
        config.set_model(model);
        config.set_temperature(temperature);
        config.set_timeout_seconds(timeout_seconds);
        config
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Blank model names keep the current value.
    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model.trim().to_string();
        }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = clamp_temperature(temperature);
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    pub fn set_timeout_seconds(&mut self, seconds: u64) {
        self.timeout_seconds = seconds.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Re-applies the setter rules to a config that came from storage.
    pub fn sanitized(self) -> Self {
        Self::new(self.model, self.temperature, self.timeout_seconds)
    }
}

fn clamp_temperature(value: f32) -> f32 {
    if value.is_nan() {
        return MIN_TEMPERATURE;
    }
    value.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
}
