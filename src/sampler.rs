#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

//! Host utilization sampling.
//!
//! Sampling calls block: a CPU sample lasts as long as the requested averaging
//! window. Async callers go through [`sample_cpu`] / [`sample_mem`], which move
//! the call onto the blocking pool so no runtime worker (and no lock) is held
//! while the window elapses.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{MemoryRefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SampleError {
    #[error("sampler returned a non-finite value")]
    NotFinite,
    #[error("platform metrics unavailable: {0}")]
    Unavailable(String),
    #[error("sampling task aborted: {0}")]
    Aborted(String),
}

pub trait UtilizationSampler: Send + Sync {
    /// Average busy percentage of all cores over `window` (0-100). Blocks for `window`.
    fn sample_cpu_percent(&self, window: Duration) -> Result<f64, SampleError>;

    /// Instantaneous used/total memory percentage (0-100).
    fn sample_mem_percent(&self) -> Result<f64, SampleError>;

    fn total_memory_bytes(&self) -> u64;
}

pub type SharedSampler = Arc<dyn UtilizationSampler>;

/// Rejects NaN and infinities so callers only ever see usable readings.
pub fn finite(value: f64) -> Result<f64, SampleError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SampleError::NotFinite)
    }
}

pub async fn sample_cpu(sampler: &SharedSampler, window: Duration) -> Result<f64, SampleError> {
    let sampler = Arc::clone(sampler);
    tokio::task::spawn_blocking(move || sampler.sample_cpu_percent(window))
        .await
        .map_err(|e| SampleError::Aborted(e.to_string()))?
        .and_then(finite)
}

pub async fn sample_mem(sampler: &SharedSampler) -> Result<f64, SampleError> {
    let sampler = Arc::clone(sampler);
    tokio::task::spawn_blocking(move || sampler.sample_mem_percent())
        .await
        .map_err(|e| SampleError::Aborted(e.to_string()))?
        .and_then(finite)
}

/// `sysinfo`-backed sampler for the local host.
pub struct SystemSampler {
    memory: Mutex<System>,
    total_memory: u64,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        let total_memory = system.total_memory();
        Self {
            memory: Mutex::new(system),
            total_memory,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UtilizationSampler for SystemSampler {
    fn sample_cpu_percent(&self, window: Duration) -> Result<f64, SampleError> {
        // Each call owns its baseline; concurrent callers with different
        // windows would otherwise reset each other's measurement.
        let mut system = System::new();
        system.refresh_cpu_usage();
        std::thread::sleep(window.max(MINIMUM_CPU_UPDATE_INTERVAL));
        system.refresh_cpu_usage();
        if system.cpus().is_empty() {
            return Err(SampleError::Unavailable("no cpus reported".into()));
        }
        finite(f64::from(system.global_cpu_usage()))
    }

    fn sample_mem_percent(&self) -> Result<f64, SampleError> {
        let (used, total) = {
            let mut system = self.memory.lock();
            system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
            (system.used_memory(), system.total_memory())
        };
        if total == 0 {
            return Err(SampleError::Unavailable("total memory reported as zero".into()));
        }
        #[allow(clippy::cast_precision_loss)]
        let percent = used as f64 / total as f64 * 100.0;
        finite(percent)
    }

    fn total_memory_bytes(&self) -> u64 {
        self.total_memory
    }
}
