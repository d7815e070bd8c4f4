use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{event::DEFAULT_EVENT_QUEUE_CAPACITY, guest::RuntimeLimits};

/// Name a CPU must be attached under to count as the main CPU.
pub const MAIN_CPU_NAME: &str = "cpu";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComputerConfig {
    /// Bytes available to guest-created resources.
    pub memory_budget: usize,
    pub event_queue_capacity: usize,
    pub speaker_channels: usize,
    pub step_time_limit_ms: u64,
    pub instruction_limit: u64,
}

impl Default for ComputerConfig {
    fn default() -> Self {
        Self {
            memory_budget: 4 * 1024 * 1024,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            speaker_channels: 8,
            step_time_limit_ms: 5000,
            instruction_limit: 1_000_000,
        }
    }
}

impl ComputerConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("parsing computer configuration")
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn runtime_limits(&self) -> RuntimeLimits {
        RuntimeLimits {
            step_time_limit: Duration::from_millis(self.step_time_limit_ms),
            instruction_limit: self.instruction_limit,
        }
    }
}
