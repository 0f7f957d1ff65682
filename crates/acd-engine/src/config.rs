use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AcdError, Result};
use crate::logging::LoggingConfig;

/// ACD engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcdConfig {
    /// Scheduler and event settings
    pub general: GeneralConfig,

    /// Dial attempt timeouts and defaults
    pub dial: DialConfig,

    /// Logging setup
    pub logging: LoggingConfig,

    /// Queue topology
    pub queues: Vec<QueueConfig>,

    /// Operators referenced by queue selectors
    pub operators: Vec<OperatorConfig>,
}

/// General engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Interval between two drain ticks of a queue scheduler
    pub tick_interval_ms: u64,

    /// Capacity used by queues that do not configure their own
    pub default_max_queue_size: usize,

    /// Capacity of the broadcast channel carrying request events
    pub event_channel_capacity: usize,
}

/// Dial attempt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    /// Time an invite may stay unanswered before the attempt is abandoned
    pub invite_timeout_ms: u64,

    /// Maximum wait for a free operator line
    pub line_wait_timeout_ms: u64,

    /// Mode used by operators that do not configure one
    pub default_mode: DialMode,

    /// Scenario name handed to the leg provider with every invite
    pub scenario: Option<String>,
}

/// How a dial manager walks an operator's numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DialMode {
    /// Next number only after the previous attempt failed
    Sequential,

    /// First number now, every remaining number together after `delay_ms`
    ParallelAfterDelay { delay_ms: u64 },
}

/// Queue definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub id: String,

    /// Overrides `general.default_max_queue_size`
    #[serde(default)]
    pub max_size: Option<usize>,

    /// Priority selectors, any order; sorted by threshold when built
    #[serde(default)]
    pub selectors: Vec<SelectorConfig>,
}

/// Priority selector definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub name: String,

    /// Lowest request priority this selector serves
    pub priority: i32,

    /// Operator ids, in rotation order
    #[serde(default)]
    pub operators: Vec<String>,

    /// Steps run when no operator of this selector accepts a request
    #[serde(default)]
    pub busy_policy: Vec<BusyStepConfig>,
}

/// One step of a busy-policy chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusyStepConfig {
    /// Keep waiting while the request has been queued for less than `timeout_ms`
    Wait { timeout_ms: u64 },

    /// Move the request to a named queue
    MoveToQueue { queue: String },

    /// Move the request to its own target queue
    MoveToTargetQueue,

    /// Hand the request to a registered side-effect sink
    Emit { sink: String },
}

/// Operator definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub id: String,

    /// Phone numbers dialled for this operator, in order
    pub numbers: Vec<String>,

    #[serde(default)]
    pub mode: Option<DialMode>,

    #[serde(default)]
    pub person_id: Option<String>,

    #[serde(default)]
    pub person_description: Option<String>,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Pause after a request this operator failed to handle
    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Pause after a handled request
    #[serde(default)]
    pub wrap_up_ms: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_concurrent_requests() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl AcdConfig {
    /// Parse a configuration from TOML
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| AcdError::config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AcdError::config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.general.tick_interval_ms == 0 {
            return Err(AcdError::config("tick_interval_ms must be greater than 0"));
        }

        if self.general.default_max_queue_size == 0 {
            return Err(AcdError::config("default_max_queue_size must be greater than 0"));
        }

        if self.general.event_channel_capacity == 0 {
            return Err(AcdError::config("event_channel_capacity must be greater than 0"));
        }

        let mut operator_ids = HashSet::new();
        for operator in &self.operators {
            if !operator_ids.insert(operator.id.as_str()) {
                return Err(AcdError::config(format!("Duplicate operator id: {}", operator.id)));
            }
            if operator.numbers.is_empty() {
                return Err(AcdError::config(format!("Operator {} has no numbers", operator.id)));
            }
            if operator.max_concurrent_requests == 0 {
                return Err(AcdError::config(format!(
                    "Operator {} must accept at least one request", operator.id
                )));
            }
        }

        let mut queue_ids = HashSet::new();
        for queue in &self.queues {
            if !queue_ids.insert(queue.id.as_str()) {
                return Err(AcdError::config(format!("Duplicate queue id: {}", queue.id)));
            }
            if queue.max_size == Some(0) {
                return Err(AcdError::config(format!("Queue {} has max_size 0", queue.id)));
            }
        }

        for queue in &self.queues {
            for selector in &queue.selectors {
                for operator in &selector.operators {
                    if !operator_ids.contains(operator.as_str()) {
                        return Err(AcdError::config(format!(
                            "Selector {} in queue {} references unknown operator {}",
                            selector.name, queue.id, operator
                        )));
                    }
                }
                for step in &selector.busy_policy {
                    match step {
                        BusyStepConfig::MoveToQueue { queue: target } if !queue_ids.contains(target.as_str()) => {
                            return Err(AcdError::config(format!(
                                "Selector {} in queue {} moves requests to unknown queue {}",
                                selector.name, queue.id, target
                            )));
                        }
                        BusyStepConfig::Emit { sink } if sink.is_empty() => {
                            return Err(AcdError::config(format!(
                                "Selector {} in queue {} has an emit step without sink",
                                selector.name, queue.id
                            )));
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }
}

impl GeneralConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl DialConfig {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_timeout_ms)
    }

    pub fn line_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.line_wait_timeout_ms)
    }
}

impl DialMode {
    /// Parallel delay, if any
    pub fn parallel_delay(&self) -> Option<Duration> {
        match self {
            DialMode::Sequential => None,
            DialMode::ParallelAfterDelay { delay_ms } => Some(Duration::from_millis(*delay_ms)),
        }
    }
}

impl OperatorConfig {
    /// Operator with default settings dialling the given numbers
    pub fn new(id: impl Into<String>, numbers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            numbers,
            mode: None,
            person_id: None,
            person_description: None,
            max_concurrent_requests: 1,
            retry_delay_ms: 0,
            wrap_up_ms: 0,
            enabled: true,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            default_max_queue_size: 100,
            event_channel_capacity: 1024,
        }
    }
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            invite_timeout_ms: 30_000,
            line_wait_timeout_ms: 5_000,
            default_mode: DialMode::Sequential,
            scenario: None,
        }
    }
}

impl Default for DialMode {
    fn default() -> Self {
        DialMode::Sequential
    }
}
