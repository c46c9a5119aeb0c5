/// Engine and model configuration
///
/// Everything here is fixed once the engine is initialized. Configuration can
/// be built in code or loaded from a JSON file.

use crate::audio_buffer::{BUFFER_SIZE, SAMPLE_RATE};
use crate::frontend::FrontendSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Feature window duration (30ms)
pub const FEATURE_DURATION_MS: usize = 30;

/// Feature step duration (10ms)
pub const FEATURE_STEP_MS: usize = 10;

/// Filterbank channels per feature vector
pub const PREPROCESSOR_FEATURE_SIZE: usize = 40;

/// Feature windows that must pass before a detection may fire
pub const MIN_SLICES_BEFORE_DETECTION: usize = 74;

/// Default per-model tensor arena size (128KB)
pub const DEFAULT_ARENA_SIZE: usize = 128 * 1024;

/// Default sliding window length for wake word models
pub const DEFAULT_SLIDING_WINDOW_SIZE: usize = 5;

/// Default probability cutoff for wake word models
pub const DEFAULT_PROBABILITY_CUTOFF: f32 = 0.95;

/// Label reported for voice activity models
pub const VAD_LABEL: &str = "VAD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Model '{0}' has neither a path nor inline data")]
    MissingModelData(String),
}

/// Which decision rule a model uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Mean of the sliding window must exceed the cutoff
    WakeWord,

    /// Max of the sliding window must reach the cutoff
    VoiceActivity,
}

/// Configuration for one streaming model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: ModelKind,

    /// Wake word text reported on detection (VAD models report "VAD")
    #[serde(default)]
    pub label: String,

    /// Path to the compiled model file
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Inline model bytes, takes precedence over `path`
    #[serde(skip)]
    pub data: Option<Arc<[u8]>>,

    /// Probability cutoff (0.0 - 1.0)
    #[serde(default = "default_cutoff")]
    pub probability_cutoff: f32,

    /// Number of recent probabilities the decision rule looks at
    #[serde(default = "default_sliding_window")]
    pub sliding_window_size: usize,

    /// Tensor arena size in bytes
    #[serde(default = "default_arena_size")]
    pub arena_size: usize,
}

fn default_cutoff() -> f32 {
    DEFAULT_PROBABILITY_CUTOFF
}

fn default_sliding_window() -> usize {
    DEFAULT_SLIDING_WINDOW_SIZE
}

fn default_arena_size() -> usize {
    DEFAULT_ARENA_SIZE
}

impl ModelConfig {
    /// Wake word model backed by in-memory model bytes
    pub fn wake_word(label: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            kind: ModelKind::WakeWord,
            label: label.into(),
            path: None,
            data: Some(data.into()),
            probability_cutoff: DEFAULT_PROBABILITY_CUTOFF,
            sliding_window_size: DEFAULT_SLIDING_WINDOW_SIZE,
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }

    /// Voice activity model backed by in-memory model bytes
    pub fn voice_activity(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            kind: ModelKind::VoiceActivity,
            label: VAD_LABEL.to_string(),
            path: None,
            data: Some(data.into()),
            probability_cutoff: 0.5,
            sliding_window_size: DEFAULT_SLIDING_WINDOW_SIZE,
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }

    /// Wake word model read from a compiled model file at initialization
    pub fn wake_word_file(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            data: None,
            ..Self::wake_word(label, Vec::<u8>::new())
        }
    }

    pub fn with_cutoff(mut self, probability_cutoff: f32) -> Self {
        self.probability_cutoff = probability_cutoff;
        self
    }

    pub fn with_sliding_window(mut self, size: usize) -> Self {
        self.sliding_window_size = size;
        self
    }

    pub fn with_arena_size(mut self, bytes: usize) -> Self {
        self.arena_size = bytes;
        self
    }

    /// Label reported when this model fires
    pub fn display_label(&self) -> &str {
        match self.kind {
            ModelKind::VoiceActivity if self.label.is_empty() => VAD_LABEL,
            _ => &self.label,
        }
    }

    /// Resolve the model bytes, reading `path` if no inline data is set
    pub fn model_data(&self) -> Result<Arc<[u8]>, ConfigError> {
        if let Some(data) = &self.data {
            return Ok(Arc::clone(data));
        }

        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingModelData(self.display_label().to_string()))?;

        debug!("Reading model '{}' from {}", self.display_label(), path.display());
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(bytes.into())
    }

    /// Validate model parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.probability_cutoff) {
            return Err(ConfigError::Invalid(format!(
                "probability_cutoff for '{}' must be between 0.0 and 1.0",
                self.display_label()
            )));
        }

        if self.sliding_window_size == 0 {
            return Err(ConfigError::Invalid(format!(
                "sliding_window_size for '{}' must be greater than 0",
                self.display_label()
            )));
        }

        if self.arena_size == 0 {
            return Err(ConfigError::Invalid(format!(
                "arena_size for '{}' must be greater than 0",
                self.display_label()
            )));
        }

        if self.kind == ModelKind::WakeWord && self.label.is_empty() {
            return Err(ConfigError::Invalid(
                "wake word models need a label".to_string(),
            ));
        }

        if self.data.is_none() && self.path.is_none() {
            return Err(ConfigError::MissingModelData(
                self.display_label().to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration for the detection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Input sample rate in Hz
    pub sample_rate: usize,

    /// Feature window duration in milliseconds
    pub window_ms: usize,

    /// Feature step duration in milliseconds
    pub step_ms: usize,

    /// Quantized features per window
    pub feature_size: usize,

    /// Ring buffer capacity in samples
    pub ring_buffer_samples: usize,

    /// Windows to wait after a detection (and after start) before the next
    pub refractory_slices: usize,

    /// Filterbank lower band edge in Hz
    pub lower_band_limit_hz: f32,

    /// Filterbank upper band edge in Hz
    pub upper_band_limit_hz: f32,

    /// Log scale shift applied by the frontend
    pub log_scale_shift: u32,

    /// Models in evaluation order; the first to fire wins
    pub models: Vec<ModelConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            window_ms: FEATURE_DURATION_MS,
            step_ms: FEATURE_STEP_MS,
            feature_size: PREPROCESSOR_FEATURE_SIZE,
            ring_buffer_samples: BUFFER_SIZE,
            refractory_slices: MIN_SLICES_BEFORE_DETECTION,
            lower_band_limit_hz: 125.0,
            upper_band_limit_hz: 7500.0,
            log_scale_shift: 6,
            models: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file
    ///
    /// Relative model paths are resolved against the file's directory.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_json_str(&text)?;
        if let Some(base) = path.parent() {
            for model in &mut config.models {
                if let Some(model_path) = model.path.as_mut() {
                    if model_path.is_relative() {
                        *model_path = base.join(&*model_path);
                    }
                }
            }
        }

        Ok(config)
    }

    /// Append a model (builder style)
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.models.push(model);
        self
    }

    /// Samples consumed per feature step
    pub fn step_samples(&self) -> usize {
        self.sample_rate / 1000 * self.step_ms
    }

    /// Samples covered by one feature window
    pub fn window_samples(&self) -> usize {
        self.sample_rate / 1000 * self.window_ms
    }

    /// Settings handed to the DSP frontend
    pub fn frontend_settings(&self) -> FrontendSettings {
        FrontendSettings {
            sample_rate: self.sample_rate,
            window_ms: self.window_ms,
            step_ms: self.step_ms,
            num_channels: self.feature_size,
            lower_band_limit_hz: self.lower_band_limit_hz,
            upper_band_limit_hz: self.upper_band_limit_hz,
            log_scale_shift: self.log_scale_shift,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate < 1000 {
            return Err(ConfigError::Invalid(format!(
                "sample_rate must be at least 1000 Hz, got {}",
                self.sample_rate
            )));
        }

        if self.step_ms == 0 || self.window_ms < self.step_ms {
            return Err(ConfigError::Invalid(
                "window_ms must be at least step_ms, and step_ms greater than 0".to_string(),
            ));
        }

        if self.feature_size == 0 {
            return Err(ConfigError::Invalid(
                "feature_size must be greater than 0".to_string(),
            ));
        }

        if self.ring_buffer_samples < self.step_samples() {
            return Err(ConfigError::Invalid(format!(
                "ring_buffer_samples ({}) must hold at least one step ({} samples)",
                self.ring_buffer_samples,
                self.step_samples()
            )));
        }

        if self.refractory_slices > i32::MAX as usize {
            return Err(ConfigError::Invalid(
                "refractory_slices is out of range".to_string(),
            ));
        }

        if self.lower_band_limit_hz <= 0.0
            || self.upper_band_limit_hz <= self.lower_band_limit_hz
            || self.upper_band_limit_hz > self.sample_rate as f32 / 2.0
        {
            return Err(ConfigError::Invalid(
                "band limits must satisfy 0 < lower < upper <= sample_rate / 2".to_string(),
            ));
        }

        if !self.models.iter().any(|m| m.kind == ModelKind::WakeWord) {
            return Err(ConfigError::Invalid(
                "at least one wake word model is required".to_string(),
            ));
        }

        for model in &self.models {
            model.validate()?;
        }

        Ok(())
    }
}
