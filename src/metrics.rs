#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use anyhow::{Context, Result as AnyResult};
use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::domain::Resource;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub cpu_active: IntGauge,
    pub cpu_load_factor: Gauge,
    pub cpu_observed_percent: Gauge,
    pub cpu_target_percent: Gauge,
    pub cpu_workers: IntGauge,
    pub mem_active: IntGauge,
    pub mem_allocation_rate: Gauge,
    pub mem_observed_percent: Gauge,
    pub mem_target_percent: Gauge,
    pub mem_allocated_bytes: IntGauge,
    pub episodes_total: IntCounterVec,
    pub skipped_samples_total: IntCounterVec,
    pub emergency_frees_total: IntCounter,
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
    name: &str,
) -> AnyResult<C> {
    registry
        .register(Box::new(collector.clone()))
        .with_context(|| format!("register {name}"))?;
    Ok(collector)
}

impl Metrics {
    pub fn new() -> AnyResult<Self> {
        let registry = Registry::new();
        let cpu_active =
            IntGauge::with_opts(Opts::new("agent_cpu_active", "1 while cpu actuators run"))
                .context("create cpu_active")?;
        let cpu_load_factor =
            Gauge::with_opts(Opts::new("agent_cpu_load_factor", "current cpu load factor"))
                .context("create cpu_load_factor")?;
        let cpu_observed_percent = Gauge::with_opts(Opts::new(
            "agent_cpu_observed_percent",
            "last sampled host cpu percent",
        ))
        .context("create cpu_observed_percent")?;
        let cpu_target_percent =
            Gauge::with_opts(Opts::new("agent_cpu_target_percent", "cpu target percent"))
                .context("create cpu_target_percent")?;
        let cpu_workers =
            IntGauge::with_opts(Opts::new("agent_cpu_workers", "running cpu actuator threads"))
                .context("create cpu_workers")?;
        let mem_active =
            IntGauge::with_opts(Opts::new("agent_mem_active", "1 while memory adjuster runs"))
                .context("create mem_active")?;
        let mem_allocation_rate = Gauge::with_opts(Opts::new(
            "agent_mem_allocation_rate",
            "current memory allocation rate",
        ))
        .context("create mem_allocation_rate")?;
        let mem_observed_percent = Gauge::with_opts(Opts::new(
            "agent_mem_observed_percent",
            "last sampled host memory percent",
        ))
        .context("create mem_observed_percent")?;
        let mem_target_percent =
            Gauge::with_opts(Opts::new("agent_mem_target_percent", "memory target percent"))
                .context("create mem_target_percent")?;
        let mem_allocated_bytes =
            IntGauge::with_opts(Opts::new("agent_mem_allocated_bytes", "bytes held by the arena"))
                .context("create mem_allocated_bytes")?;
        let episodes_total = IntCounterVec::new(
            Opts::new("agent_episodes_total", "activations per resource"),
            &["resource"],
        )
        .context("create episodes_total")?;
        let skipped_samples_total = IntCounterVec::new(
            Opts::new("agent_skipped_samples_total", "ticks skipped on sampler failure"),
            &["resource"],
        )
        .context("create skipped_samples_total")?;
        let emergency_frees_total = IntCounter::with_opts(Opts::new(
            "agent_emergency_frees_total",
            "protection threshold breaches",
        ))
        .context("create emergency_frees_total")?;

        Ok(Self {
            cpu_active: register(&registry, cpu_active, "cpu_active")?,
            cpu_load_factor: register(&registry, cpu_load_factor, "cpu_load_factor")?,
            cpu_observed_percent: register(
                &registry,
                cpu_observed_percent,
                "cpu_observed_percent",
            )?,
            cpu_target_percent: register(&registry, cpu_target_percent, "cpu_target_percent")?,
            cpu_workers: register(&registry, cpu_workers, "cpu_workers")?,
            mem_active: register(&registry, mem_active, "mem_active")?,
            mem_allocation_rate: register(&registry, mem_allocation_rate, "mem_allocation_rate")?,
            mem_observed_percent: register(
                &registry,
                mem_observed_percent,
                "mem_observed_percent",
            )?,
            mem_target_percent: register(&registry, mem_target_percent, "mem_target_percent")?,
            mem_allocated_bytes: register(&registry, mem_allocated_bytes, "mem_allocated_bytes")?,
            episodes_total: register(&registry, episodes_total, "episodes_total")?,
            skipped_samples_total: register(
                &registry,
                skipped_samples_total,
                "skipped_samples_total",
            )?,
            emergency_frees_total: register(
                &registry,
                emergency_frees_total,
                "emergency_frees_total",
            )?,
            registry,
        })
    }

    pub fn mark_episode(&self, resource: Resource) {
        self.episodes_total.with_label_values(&[resource.label()]).inc();
    }

    pub fn mark_skipped(&self, resource: Resource) {
        self.skipped_samples_total
            .with_label_values(&[resource.label()])
            .inc();
    }

    pub fn set_allocated_bytes(&self, bytes: u64) {
        self.mem_allocated_bytes
            .set(i64::try_from(bytes).unwrap_or(i64::MAX));
    }

    pub fn encode_text(&self) -> AnyResult<Vec<u8>> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf).context("encode metrics")?;
        Ok(buf)
    }
}
