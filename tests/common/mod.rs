#![allow(dead_code)]

use chimp_pressure_agent::domain::{ControllerConfig, CpuTuning, MemoryTuning};
use chimp_pressure_agent::sampler::{SampleError, UtilizationSampler};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

enum Step {
    /// `None` stands for a platform failure.
    Reading(Option<f64>),
    Panic,
}

/// Steps are served from the queue first, then `fallback` forever.
struct Script {
    queued: VecDeque<Step>,
    fallback: Option<f64>,
    calls: usize,
}

impl Script {
    fn new(fallback: f64) -> Self {
        Self { queued: VecDeque::new(), fallback: Some(fallback), calls: 0 }
    }

    fn next(&mut self) -> Result<f64, SampleError> {
        self.calls += 1;
        let reading = match self.queued.pop_front() {
            Some(Step::Reading(reading)) => reading,
            Some(Step::Panic) => panic!("scripted sampler panic"),
            None => self.fallback,
        };
        reading.ok_or_else(|| SampleError::Unavailable("scripted failure".into()))
    }
}

pub struct ScriptedSampler {
    cpu: Mutex<Script>,
    mem: Mutex<Script>,
    total_memory: u64,
}

impl ScriptedSampler {
    pub fn new(cpu_percent: f64, mem_percent: f64) -> Arc<Self> {
        Self::with_total_memory(cpu_percent, mem_percent, 64 * MIB)
    }

    pub fn with_total_memory(cpu_percent: f64, mem_percent: f64, total_memory: u64) -> Arc<Self> {
        Arc::new(Self {
            cpu: Mutex::new(Script::new(cpu_percent)),
            mem: Mutex::new(Script::new(mem_percent)),
            total_memory,
        })
    }

    pub fn push_cpu(&self, reading: Option<f64>) {
        self.cpu.lock().queued.push_back(Step::Reading(reading));
    }

    pub fn push_mem(&self, reading: Option<f64>) {
        self.mem.lock().queued.push_back(Step::Reading(reading));
    }

    /// The next queued cpu call panics instead of returning.
    pub fn push_cpu_panic(&self) {
        self.cpu.lock().queued.push_back(Step::Panic);
    }

    pub fn push_mem_panic(&self) {
        self.mem.lock().queued.push_back(Step::Panic);
    }

    pub fn set_cpu(&self, reading: Option<f64>) {
        self.cpu.lock().fallback = reading;
    }

    pub fn set_mem(&self, reading: Option<f64>) {
        self.mem.lock().fallback = reading;
    }

    pub fn cpu_calls(&self) -> usize {
        self.cpu.lock().calls
    }

    pub fn mem_calls(&self) -> usize {
        self.mem.lock().calls
    }
}

impl UtilizationSampler for ScriptedSampler {
    fn sample_cpu_percent(&self, _window: Duration) -> Result<f64, SampleError> {
        self.cpu.lock().next()
    }

    fn sample_mem_percent(&self) -> Result<f64, SampleError> {
        self.mem.lock().next()
    }

    fn total_memory_bytes(&self) -> u64 {
        self.total_memory
    }
}

pub fn config(target_percent: f64) -> ControllerConfig {
    ControllerConfig::new(target_percent, 1, 1).expect("config")
}

pub fn fast_cpu_tuning() -> CpuTuning {
    CpuTuning {
        adjust_interval: Duration::from_millis(20),
        adjust_window: Duration::from_millis(1),
        base_work: Duration::from_millis(5),
        base_sleep: Duration::from_millis(5),
        trim_every_cycles: 10,
        trim_window: Duration::from_millis(1),
        trim_step: 0.05,
        workers: Some(2),
    }
}

pub fn fast_memory_tuning() -> MemoryTuning {
    MemoryTuning {
        adjust_interval: Duration::from_millis(20),
        protection_factor: 0.95,
        emergency_grace: Duration::from_millis(10),
        min_block_floor: 4096,
        max_block_floor: 64 * 1024,
    }
}
