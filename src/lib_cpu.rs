#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::control::SharedSignal;
use crate::domain::CpuTuning;
use crate::episode::StopListener;
use crate::sampler::{finite, SharedSampler};
use crate::service::describe_panic;

const BURN_BATCH: usize = 1_000;

/// One actuator's work/sleep split at `load_factor = 1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DutyCycle {
    pub work: Duration,
    pub sleep: Duration,
    period: Duration,
}

impl DutyCycle {
    pub fn new(work: Duration, sleep: Duration) -> Self {
        Self {
            work,
            sleep,
            period: work + sleep,
        }
    }

    /// Work scaled by `load_factor`, sleep by `2 - load_factor`.
    pub fn scaled(&self, load_factor: f64) -> (Duration, Duration) {
        let lf = if load_factor.is_finite() {
            load_factor.clamp(0.0, 2.0)
        } else {
            1.0
        };
        (self.work.mul_f64(lf), self.sleep.mul_f64(2.0 - lf))
    }

    /// Percentage of the cycle spent working at `load_factor`.
    pub fn utilization(&self, load_factor: f64) -> f64 {
        let (work, sleep) = self.scaled(load_factor);
        let total = (work + sleep).as_secs_f64();
        if total <= 0.0 {
            0.0
        } else {
            work.as_secs_f64() / total * 100.0
        }
    }

    /// Slow one-sided correction: lengthen work when under target, sleep when
    /// over. The split is renormalized to the original period so stop latency
    /// stays bounded however long the worker runs.
    pub fn trim(&mut self, observed_percent: f64, target_percent: f64, step: f64) {
        let mut work = self.work.as_secs_f64();
        let mut sleep = self.sleep.as_secs_f64();
        if observed_percent < target_percent {
            work *= 1.0 + step;
        } else if observed_percent > target_percent {
            sleep *= 1.0 + step;
        } else {
            return;
        }
        let total = work + sleep;
        if total <= 0.0 {
            return;
        }
        let period = self.period.as_secs_f64();
        self.work = Duration::from_secs_f64(period * work / total);
        self.sleep = Duration::from_secs_f64(period * sleep / total);
    }

    /// Burns CPU for the scaled work time, then sleeps whatever is left of the
    /// scaled period. Returns the realized wall time of the cycle.
    pub fn run_cycle(&self, load_factor: f64) -> Duration {
        let (work, sleep) = self.scaled(load_factor);
        let started = Instant::now();
        burn_for(work);
        let remaining = (work + sleep).saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
        started.elapsed()
    }
}

/// Spins on floating point work until `duration` has elapsed. Returns the
/// number of batches completed.
pub fn burn_for(duration: Duration) -> u64 {
    let deadline = Instant::now() + duration;
    let mut acc = 1.0_f64;
    let mut batches = 0u64;
    while Instant::now() < deadline {
        for _ in 0..BURN_BATCH {
            acc = std::hint::black_box((acc + 1.000_001).sqrt());
        }
        batches += 1;
    }
    batches
}

/// Everything one actuator thread reads. Workers never write controller state.
pub struct WorkerContext {
    pub index: usize,
    pub target_percent: f64,
    pub tuning: CpuTuning,
    pub active: Arc<AtomicBool>,
    pub load_factor: Arc<SharedSignal>,
    pub stop: StopListener,
    pub sampler: SharedSampler,
}

impl WorkerContext {
    fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.stop.is_stopped()
    }
}

pub fn spawn_worker(ctx: WorkerContext) -> std::io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name(format!("cpu-actuator-{}", ctx.index))
        .spawn(move || run_worker(&ctx))
}

/// Runs duty cycles until the episode ends; returns the number of cycles.
/// A panic inside a cycle is logged and the loop re-entered.
pub fn run_worker(ctx: &WorkerContext) -> u64 {
    let mut duty = DutyCycle::new(ctx.tuning.base_work, ctx.tuning.base_sleep);
    let mut cycles = 0u64;
    debug!(worker = ctx.index, episode = ctx.stop.episode(), "cpu actuator started");
    while ctx.is_live() {
        match panic::catch_unwind(AssertUnwindSafe(|| run_cycles(ctx, &mut duty, &mut cycles))) {
            Ok(()) => break,
            Err(payload) => {
                error!(
                    worker = ctx.index,
                    panic = %describe_panic(payload.as_ref()),
                    "cpu actuator panicked"
                );
                thread::sleep(ctx.tuning.base_sleep);
            }
        }
    }
    debug!(worker = ctx.index, cycles, "cpu actuator stopped");
    cycles
}

fn run_cycles(ctx: &WorkerContext, duty: &mut DutyCycle, cycles: &mut u64) {
    while ctx.is_live() {
        duty.run_cycle(ctx.load_factor.load());
        *cycles += 1;
        if ctx.tuning.trim_every_cycles > 0 && *cycles % ctx.tuning.trim_every_cycles == 0 {
            match ctx
                .sampler
                .sample_cpu_percent(ctx.tuning.trim_window)
                .and_then(finite)
            {
                Ok(observed) => {
                    duty.trim(observed, ctx.target_percent, ctx.tuning.trim_step);
                    debug!(
                        worker = ctx.index,
                        observed,
                        work = ?duty.work,
                        sleep = ?duty.sleep,
                        "duty cycle trimmed"
                    );
                }
                Err(e) => debug!(worker = ctx.index, error = %e, "trim sample skipped"),
            }
        }
    }
}
