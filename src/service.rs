#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use anyhow::Result as AnyResult;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cpu_controller::CpuController;
use crate::domain::{AgentConfig, AgentStatus, Resource};
use crate::episode::StopSignal;
use crate::mem_controller::MemoryController;
use crate::metrics::Metrics;
use crate::sampler::SharedSampler;

/// Owns the enabled controllers and their supervisor loops.
#[derive(Clone)]
pub struct ControllerRunner {
    cpu: Option<Arc<CpuController>>,
    memory: Option<Arc<MemoryController>>,
    metrics: Metrics,
    shutdown: Arc<StopSignal>,
    tasks: Arc<Mutex<Vec<(Resource, JoinHandle<()>)>>>,
}

impl ControllerRunner {
    pub fn new(config: &AgentConfig, sampler: SharedSampler, metrics: Metrics) -> Self {
        let cpu = config.cpu().map(|cfg| {
            Arc::new(CpuController::new(
                cfg,
                config.cpu_tuning(),
                Arc::clone(&sampler),
                metrics.clone(),
            ))
        });
        let memory = config.memory().map(|cfg| {
            Arc::new(MemoryController::new(
                cfg,
                config.memory_tuning(),
                Arc::clone(&sampler),
                metrics.clone(),
            ))
        });
        Self {
            cpu,
            memory,
            metrics,
            shutdown: Arc::new(StopSignal::new(0)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn cpu(&self) -> Option<&Arc<CpuController>> {
        self.cpu.as_ref()
    }

    pub fn memory(&self) -> Option<&Arc<MemoryController>> {
        self.memory.as_ref()
    }

    /// Spawns one supervisor loop per enabled controller. Returns the number
    /// of loops started; zero if already started or shut down.
    pub fn start(&self) -> usize {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.shutdown.is_stopped() {
            return 0;
        }
        if let Some(cpu) = &self.cpu {
            let handle = tokio::spawn(Arc::clone(cpu).run(self.shutdown.listener()));
            tasks.push((Resource::CPU, handle));
        }
        if let Some(memory) = &self.memory {
            let handle = tokio::spawn(Arc::clone(memory).run(self.shutdown.listener()));
            tasks.push((Resource::MEMORY, handle));
        }
        info!(controllers = tasks.len(), "controllers started");
        tasks.len()
    }

    /// Stops every supervisor loop and waits for them to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.stop();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (resource, handle) in tasks {
            if let Err(e) = handle.await {
                error!(%resource, error = %e, "supervisor task failed");
            }
        }
        info!("controllers stopped");
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            cpu: self.cpu.as_ref().map(|c| c.status()),
            memory: self.memory.as_ref().map(|m| m.status()),
        }
    }

    pub fn encode_metrics(&self) -> AnyResult<Vec<u8>> {
        self.metrics.encode_text()
    }

    pub fn health(&self) -> HealthReport {
        let running = |resource: Resource| -> Option<bool> {
            let enabled = match resource {
                Resource::CPU => self.cpu.is_some(),
                Resource::MEMORY => self.memory.is_some(),
            };
            enabled.then(|| {
                self.tasks
                    .lock()
                    .iter()
                    .any(|(r, h)| *r == resource && !h.is_finished())
            })
        };
        let cpu_running = running(Resource::CPU);
        let memory_running = running(Resource::MEMORY);
        let metrics_ok = self.metrics.encode_text().is_ok();
        let registry_metrics = self.metrics.registry.gather().len();
        let shutting_down = self.shutdown.is_stopped();
        let loops_ok =
            shutting_down || (cpu_running != Some(false) && memory_running != Some(false));
        let status = if metrics_ok && loops_ok { "ok" } else { "degraded" };
        HealthReport {
            status: status.to_string(),
            cpu_running,
            memory_running,
            metrics_ok,
            registry_metrics,
            shutting_down,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub cpu_running: Option<bool>,
    pub memory_running: Option<bool>,
    pub metrics_ok: bool,
    pub registry_metrics: usize,
    pub shutting_down: bool,
}

/// Best-effort text of a panic payload.
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
