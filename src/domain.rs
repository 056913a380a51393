#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use anyhow::{bail, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::validation::{validate_agent, validate_controller};

pub const DEFAULT_TARGET_CPU_PERCENT: f64 = 40.0;
pub const DEFAULT_TARGET_MEM_PERCENT: f64 = 60.0;
pub const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 3;
pub const DEFAULT_CPU_WINDOW_SECONDS: u64 = 1;
pub const DEFAULT_PROTECTION_FACTOR: f64 = 0.95;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    CPU,
    MEMORY,
}

impl Resource {
    /// Lower-case label used for metric labels and URL paths.
    pub fn label(self) -> &'static str {
        match self {
            Resource::CPU => "cpu",
            Resource::MEMORY => "memory",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::CPU => f.write_str("CPU"),
            Resource::MEMORY => f.write_str("MEMORY"),
        }
    }
}

impl FromStr for Resource {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> AnyResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::CPU),
            "memory" | "mem" => Ok(Self::MEMORY),
            other => bail!(format!("unsupported resource: {other}")),
        }
    }
}

/// Per-resource controller settings. Only obtainable through
/// [`ControllerConfig::new`], so every instance has passed validation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ControllerConfig {
    target_percent: f64,
    check_interval_seconds: u64,
    sample_window_seconds: u64,
}

impl ControllerConfig {
    pub fn new(
        target_percent: f64,
        check_interval_seconds: u64,
        sample_window_seconds: u64,
    ) -> AnyResult<Self> {
        let cfg = Self {
            target_percent,
            check_interval_seconds,
            sample_window_seconds,
        };
        validate_controller(&cfg)?;
        Ok(cfg)
    }

    pub fn target_percent(&self) -> f64 {
        self.target_percent
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_secs(self.sample_window_seconds)
    }
}

/// Inner-loop constants for the CPU subsystem.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CpuTuning {
    pub adjust_interval: Duration,
    pub adjust_window: Duration,
    pub base_work: Duration,
    pub base_sleep: Duration,
    pub trim_every_cycles: u64,
    pub trim_window: Duration,
    pub trim_step: f64,
    /// Actuator threads per episode; `None` means one per available core.
    pub workers: Option<usize>,
}

impl Default for CpuTuning {
    fn default() -> Self {
        Self {
            adjust_interval: Duration::from_millis(500),
            adjust_window: Duration::from_secs(1),
            base_work: Duration::from_millis(100),
            base_sleep: Duration::from_millis(100),
            trim_every_cycles: 10,
            trim_window: Duration::from_millis(200),
            trim_step: 0.05,
            workers: None,
        }
    }
}

impl CpuTuning {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
            })
            .max(1)
    }
}

/// Inner-loop constants for the memory subsystem.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryTuning {
    pub adjust_interval: Duration,
    pub protection_factor: f64,
    pub emergency_grace: Duration,
    pub min_block_floor: u64,
    pub max_block_floor: u64,
}

impl Default for MemoryTuning {
    fn default() -> Self {
        Self {
            adjust_interval: Duration::from_secs(1),
            protection_factor: DEFAULT_PROTECTION_FACTOR,
            emergency_grace: Duration::from_secs(2),
            min_block_floor: 32 * MIB,
            max_block_floor: 256 * MIB,
        }
    }
}

impl MemoryTuning {
    pub fn protection_percent(&self) -> f64 {
        self.protection_factor * 100.0
    }
}

/// Everything the agent needs to build its controllers. Fields are private;
/// every constructor and `with_*` override re-runs validation.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    cpu: Option<ControllerConfig>,
    memory: Option<ControllerConfig>,
    cpu_tuning: CpuTuning,
    memory_tuning: MemoryTuning,
}

impl AgentConfig {
    pub fn new(
        cpu: Option<ControllerConfig>,
        memory: Option<ControllerConfig>,
        protection_factor: f64,
    ) -> AnyResult<Self> {
        let cfg = Self {
            cpu,
            memory,
            cpu_tuning: CpuTuning::default(),
            memory_tuning: MemoryTuning {
                protection_factor,
                ..MemoryTuning::default()
            },
        };
        validate_agent(&cfg)?;
        Ok(cfg)
    }

    pub fn with_cpu_tuning(self, cpu_tuning: CpuTuning) -> AnyResult<Self> {
        let cfg = Self { cpu_tuning, ..self };
        validate_agent(&cfg)?;
        Ok(cfg)
    }

    /// Replaces the memory tuning, protection factor included.
    pub fn with_memory_tuning(self, memory_tuning: MemoryTuning) -> AnyResult<Self> {
        let cfg = Self {
            memory_tuning,
            ..self
        };
        validate_agent(&cfg)?;
        Ok(cfg)
    }

    pub fn cpu(&self) -> Option<ControllerConfig> {
        self.cpu
    }

    pub fn memory(&self) -> Option<ControllerConfig> {
        self.memory
    }

    pub fn cpu_tuning(&self) -> CpuTuning {
        self.cpu_tuning
    }

    pub fn memory_tuning(&self) -> MemoryTuning {
        self.memory_tuning
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub resource: Resource,
    pub active: bool,
    pub target_percent: f64,
    /// Load factor for CPU, allocation rate for memory.
    pub signal: f64,
    pub last_observed_percent: Option<f64>,
    pub episodes: u64,
    pub episode_started_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub cpu: Option<ControllerStatus>,
    pub memory: Option<ControllerStatus>,
}

impl AgentStatus {
    pub fn get(&self, resource: Resource) -> Option<&ControllerStatus> {
        match resource {
            Resource::CPU => self.cpu.as_ref(),
            Resource::MEMORY => self.memory.as_ref(),
        }
    }
}
