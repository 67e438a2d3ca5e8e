use multiexit::{ExitError, ExitPolicy, ExitThresholds, MultiExitConfig, ThresholdSpec};
use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::loss::LossStrategy;

/// File-level description of a multi-exit run.
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub loss: LossStrategy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DistillationError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: RunConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DistillationError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DistillationError> {
        let mut errors = Vec::new();

        if self.model.num_stages == 0 {
            errors.push("model.num_stages must be greater than 0".to_string());
        }
        if self.model.hidden_dim == 0 {
            errors.push("model.hidden_dim must be greater than 0".to_string());
        }
        if self.model.num_classes == 0 {
            errors.push("model.num_classes must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.model.hidden_dropout) {
            errors.push(format!(
                "model.hidden_dropout must be in [0, 1) (got {})",
                self.model.hidden_dropout
            ));
        }

        let threshold_values = match &self.exit.thresholds {
            ThresholdSpec::Broadcast(value) => std::slice::from_ref(value),
            ThresholdSpec::PerStage(values) => values.as_slice(),
        };
        if threshold_values.iter().any(|value| !value.is_finite()) {
            errors.push("exit.thresholds must be finite numbers".to_string());
        }

        if let ThresholdSpec::PerStage(values) = &self.exit.thresholds {
            if values.len() != self.model.num_stages {
                errors.push(format!(
                    "exit.thresholds lists {} values but model.num_stages is {}",
                    values.len(),
                    self.model.num_stages
                ));
            }
        }

        if let LossStrategy::Distillation(params) = &self.loss {
            errors.extend(params.problems());
        }

        if self.logging.flush_every == 0 {
            errors.push("logging.flush_every must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(DistillationError::validation(errors));
        }

        Ok(())
    }

    pub fn encoder_config(&self) -> MultiExitConfig {
        MultiExitConfig {
            num_stages: self.model.num_stages,
            hidden_dim: self.model.hidden_dim,
            num_classes: self.model.num_classes,
            hidden_dropout: self.model.hidden_dropout,
            policy: self.exit.policy,
        }
    }

    pub fn thresholds(&self) -> Result<ExitThresholds, DistillationError> {
        Ok(self.exit.thresholds.resolve(self.model.num_stages)?)
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    pub num_stages: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    #[serde(default = "default_hidden_dropout")]
    pub hidden_dropout: f32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExitConfig {
    #[serde(default)]
    pub thresholds: ThresholdSpec,
    #[serde(default)]
    pub policy: ExitPolicy,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard_dir: None,
            flush_every: default_flush_every(),
        }
    }
}

fn default_hidden_dropout() -> f32 {
    0.1
}

fn default_enable_stdout() -> bool {
    true
}

fn default_flush_every() -> usize {
    10
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

#[derive(Debug)]
pub enum DistillationError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl DistillationError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for DistillationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistillationError::Io(err) => write!(f, "failed to read config: {}", err),
            DistillationError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            DistillationError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            DistillationError::Initialization(msg) => {
                write!(f, "initialization failed: {}", msg)
            }
            DistillationError::Runtime(msg) => write!(f, "loss computation failed: {}", msg),
        }
    }
}

impl std::error::Error for DistillationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DistillationError::Io(err) => Some(err),
            DistillationError::ConfigFormat(_) | DistillationError::Validation(_) => None,
            DistillationError::Initialization(_) | DistillationError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for DistillationError {
    fn from(value: std::io::Error) -> Self {
        DistillationError::Io(value)
    }
}

impl From<toml::de::Error> for DistillationError {
    fn from(value: toml::de::Error) -> Self {
        DistillationError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for DistillationError {
    fn from(value: serde_json::Error) -> Self {
        DistillationError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for DistillationError {
    fn from(value: candle_core::Error) -> Self {
        DistillationError::Runtime(value.to_string())
    }
}

impl From<ExitError> for DistillationError {
    fn from(value: ExitError) -> Self {
        match value {
            ExitError::InvalidConfig(_)
            | ExitError::ThresholdMismatch { .. }
            | ExitError::MissingParameter(_) => DistillationError::Initialization(value.to_string()),
            ExitError::Shape(_) | ExitError::Candle(_) => DistillationError::Runtime(value.to_string()),
        }
    }
}
