//! Configuration for the controlled executor and its collaborators.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{ControlError, Result};

/// Configuration for controlled DAG execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of tasks of one layer running at the same time
    pub max_parallelism: usize,
    /// How long a decision gate waits for a command before aborting
    pub gate_timeout_secs: u64,
    /// Optional per-task timeout applied when joining a layer
    pub task_timeout_secs: Option<u64>,
    /// Capacity of the event broadcast buffer
    pub event_capacity: usize,
    /// Adaptive threshold tuning
    pub thresholds: ThresholdConfig,
    /// Checkpoint retention
    pub checkpoint: CheckpointConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 3,
            gate_timeout_secs: 300,
            task_timeout_secs: None,
            event_capacity: 1024,
            thresholds: ThresholdConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

/// Tuning of the adaptive threshold controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub initial_explicit_threshold: f64,
    pub initial_suggestion_threshold: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub learning_rate: f64,
    /// Maximum number of records retained
    pub history_size: usize,
    /// Number of most recent records analyzed per adjustment
    pub analysis_window: usize,
    /// An adjustment is attempted every `adjustment_interval` records
    pub adjustment_interval: usize,
    pub false_positive_trigger: f64,
    pub false_negative_trigger: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            initial_explicit_threshold: 0.50,
            initial_suggestion_threshold: 0.70,
            min_threshold: 0.40,
            max_threshold: 0.90,
            learning_rate: 0.05,
            history_size: 50,
            analysis_window: 20,
            adjustment_interval: 10,
            false_positive_trigger: 0.20,
            false_negative_trigger: 0.30,
        }
    }
}

/// Checkpoint retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoints older than this are eligible for cleanup
    pub ttl_secs: u64,
    /// How often the janitor sweeps expired checkpoints
    pub cleanup_interval_secs: u64,
    /// zstd level used for persisted records
    pub compression_level: i32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            cleanup_interval_secs: 300,
            compression_level: 3,
        }
    }
}

impl ExecutorConfig {
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(ControlError::Config(
                "max_parallelism must be greater than 0".into(),
            ));
        }
        if self.gate_timeout_secs == 0 {
            return Err(ControlError::Config(
                "gate_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.gate_timeout_secs > 86400 {
            return Err(ControlError::Config(
                "gate_timeout_secs cannot exceed 24 hours".into(),
            ));
        }
        if let Some(0) = self.task_timeout_secs {
            return Err(ControlError::Config(
                "task_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ControlError::Config(
                "event_capacity must be greater than 0".into(),
            ));
        }
        self.thresholds.validate()?;
        self.checkpoint.validate()
    }

    /// Merges two configurations, with `override_with` taking precedence
    /// wherever it differs from the defaults.
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let defaults = Self::default();
        let pick = |b: usize, o: usize, d: usize| if o != d { o } else { b };

        let merged = Self {
            max_parallelism: pick(
                base.max_parallelism,
                override_with.max_parallelism,
                defaults.max_parallelism,
            ),
            gate_timeout_secs: if override_with.gate_timeout_secs != defaults.gate_timeout_secs {
                override_with.gate_timeout_secs
            } else {
                base.gate_timeout_secs
            },
            task_timeout_secs: override_with.task_timeout_secs.or(base.task_timeout_secs),
            event_capacity: pick(
                base.event_capacity,
                override_with.event_capacity,
                defaults.event_capacity,
            ),
            thresholds: if override_with.thresholds != defaults.thresholds {
                override_with.thresholds.clone()
            } else {
                base.thresholds.clone()
            },
            checkpoint: if override_with.checkpoint != defaults.checkpoint {
                override_with.checkpoint.clone()
            } else {
                base.checkpoint.clone()
            },
        };

        merged.validate()?;
        Ok(merged)
    }

    /// Parses and validates a YAML configuration document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file
    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.min_threshold) || !in_unit(self.max_threshold) {
            return Err(ControlError::Config(
                "threshold bounds must lie within [0, 1]".into(),
            ));
        }
        if self.min_threshold > self.max_threshold {
            return Err(ControlError::Config(
                "min_threshold cannot exceed max_threshold".into(),
            ));
        }
        for (name, value) in [
            ("initial_explicit_threshold", self.initial_explicit_threshold),
            ("initial_suggestion_threshold", self.initial_suggestion_threshold),
        ] {
            if value < self.min_threshold || value > self.max_threshold {
                return Err(ControlError::Config(format!(
                    "{} must lie within [{}, {}]",
                    name, self.min_threshold, self.max_threshold
                )));
            }
        }
        if self.learning_rate <= 0.0 || self.learning_rate > 1.0 {
            return Err(ControlError::Config(
                "learning_rate must lie within (0, 1]".into(),
            ));
        }
        if self.analysis_window == 0 || self.analysis_window > self.history_size {
            return Err(ControlError::Config(
                "analysis_window must be non-zero and fit in history_size".into(),
            ));
        }
        if self.adjustment_interval == 0 {
            return Err(ControlError::Config(
                "adjustment_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Ten years
pub const MAX_CHECKPOINT_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl CheckpointConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(ControlError::Config("ttl_secs must be greater than 0".into()));
        }
        if self.ttl_secs > MAX_CHECKPOINT_TTL_SECS {
            return Err(ControlError::Config(format!(
                "ttl_secs must not exceed {}",
                MAX_CHECKPOINT_TTL_SECS
            )));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ControlError::Config(
                "cleanup_interval_secs must be greater than 0".into(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ControlError::Config(
                "compression_level must lie within 1..=22".into(),
            ));
        }
        Ok(())
    }
}
