#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

//! CPU supervisor (outer on/off loop with hysteresis) and adjuster (inner
//! PID loop writing the load factor read by the actuator threads).

use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::control::{smoothing_for_target, FeedbackController, FeedbackParams, SharedSignal};
use crate::domain::{ControllerConfig, ControllerStatus, CpuTuning, Resource};
use crate::episode::{StopListener, StopSignal};
use crate::lib_cpu::{spawn_worker, WorkerContext};
use crate::metrics::Metrics;
use crate::sampler::{sample_cpu, sample_mem, SharedSampler};
use crate::service::describe_panic;

/// Relative half-width of the dead zone around the target.
pub const HYSTERESIS_BAND: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Activate,
    Deactivate,
    Hold,
}

/// Activate below `target * 0.95` when idle, deactivate above `target * 1.05`
/// when running, otherwise hold.
pub fn hysteresis_decision(
    target_percent: f64,
    current_percent: f64,
    active: bool,
) -> Transition {
    if !active && current_percent < target_percent * (1.0 - HYSTERESIS_BAND) {
        Transition::Activate
    } else if active && current_percent > target_percent * (1.0 + HYSTERESIS_BAND) {
        Transition::Deactivate
    } else {
        Transition::Hold
    }
}

struct CpuEpisode {
    stop: StopSignal,
    started_ts: i64,
    workers: Vec<JoinHandle<u64>>,
    adjuster: tokio::task::JoinHandle<()>,
}

pub struct CpuController {
    config: ControllerConfig,
    tuning: CpuTuning,
    smoothing: f64,
    sampler: SharedSampler,
    metrics: Metrics,
    active: Arc<AtomicBool>,
    load_factor: Arc<SharedSignal>,
    last_observed: SharedSignal,
    episodes: AtomicU64,
    episode: Mutex<Option<CpuEpisode>>,
}

impl CpuController {
    pub fn new(
        config: ControllerConfig,
        tuning: CpuTuning,
        sampler: SharedSampler,
        metrics: Metrics,
    ) -> Self {
        metrics.cpu_target_percent.set(config.target_percent());
        metrics.cpu_load_factor.set(FeedbackParams::CPU.initial);
        Self {
            smoothing: smoothing_for_target(config.target_percent()),
            config,
            tuning,
            sampler,
            metrics,
            active: Arc::new(AtomicBool::new(false)),
            load_factor: Arc::new(SharedSignal::new(FeedbackParams::CPU.initial)),
            last_observed: SharedSignal::new(f64::NAN),
            episodes: AtomicU64::new(0),
            episode: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn load_factor(&self) -> f64 {
        self.load_factor.load()
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.episode.lock().as_ref().map_or(0, |e| e.workers.len())
    }

    pub fn status(&self) -> ControllerStatus {
        let (started, workers) = self
            .episode
            .lock()
            .as_ref()
            .map_or((None, 0), |e| (Some(e.started_ts), e.workers.len()));
        let observed = self.last_observed.load();
        ControllerStatus {
            resource: Resource::CPU,
            active: self.is_active(),
            target_percent: self.config.target_percent(),
            signal: self.load_factor(),
            last_observed_percent: observed.is_finite().then_some(observed),
            episodes: self.episodes(),
            episode_started_ts: started,
            allocated_bytes: None,
            workers: Some(workers),
        }
    }

    /// Supervisor loop at `check_interval` until `shutdown` fires. Leaves the
    /// controller inactive on return.
    pub async fn run(self: Arc<Self>, mut shutdown: StopListener) {
        let mut ticker = interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target_percent = self.config.target_percent(),
            smoothing = self.smoothing,
            "cpu supervisor started"
        );
        loop {
            tokio::select! {
                () = shutdown.stopped() => break,
                _ = ticker.tick() => {}
            }
            if let Err(payload) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                error!(
                    resource = "cpu",
                    panic = %describe_panic(payload.as_ref()),
                    "supervisor tick panicked"
                );
            }
        }
        self.deactivate().await;
        info!("cpu supervisor stopped");
    }

    /// One supervisor decision. Sampler failures skip the tick.
    pub async fn tick(&self) -> Transition {
        match sample_mem(&self.sampler).await {
            Ok(mem_percent) => debug!(mem_percent, "host memory"),
            Err(e) => debug!(error = %e, "memory sample unavailable"),
        }
        let current = match sample_cpu(&self.sampler, self.config.sample_window()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(resource = "cpu", error = %e, "cpu sample failed; skipping tick");
                self.metrics.mark_skipped(Resource::CPU);
                return Transition::Hold;
            }
        };
        self.last_observed.store(current);
        self.metrics.cpu_observed_percent.set(current);

        let target = self.config.target_percent();
        let decision = hysteresis_decision(target, current, self.is_active());
        debug!(current, target, ?decision, "cpu supervisor tick");
        match decision {
            Transition::Activate => {
                self.activate();
            }
            Transition::Deactivate => {
                self.deactivate().await;
            }
            Transition::Hold => {}
        }
        decision
    }

    /// Starts a new episode: one actuator thread per worker slot plus the
    /// adjuster task. Returns `false` if an episode is already running.
    /// Must be called from within a tokio runtime.
    pub fn activate(&self) -> bool {
        let mut slot = self.episode.lock();
        if slot.is_some() {
            return false;
        }
        let episode = self.episodes.fetch_add(1, Ordering::AcqRel) + 1;
        let stop = StopSignal::new(episode);
        self.load_factor.store(FeedbackParams::CPU.initial);
        self.active.store(true, Ordering::Release);

        let mut workers = Vec::with_capacity(self.tuning.worker_count());
        for index in 0..self.tuning.worker_count() {
            let ctx = WorkerContext {
                index,
                target_percent: self.config.target_percent(),
                tuning: self.tuning,
                active: Arc::clone(&self.active),
                load_factor: Arc::clone(&self.load_factor),
                stop: stop.listener(),
                sampler: Arc::clone(&self.sampler),
            };
            match spawn_worker(ctx) {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(worker = index, error = %e, "failed to spawn cpu actuator"),
            }
        }

        let adjuster = CpuAdjuster {
            target_percent: self.config.target_percent(),
            tuning: self.tuning,
            sampler: Arc::clone(&self.sampler),
            controller: FeedbackController::new(FeedbackParams::CPU, self.smoothing),
            load_factor: Arc::clone(&self.load_factor),
            active: Arc::clone(&self.active),
            stop: stop.listener(),
            metrics: self.metrics.clone(),
        };
        let adjuster = tokio::spawn(adjuster.run());

        self.metrics.mark_episode(Resource::CPU);
        self.metrics.cpu_active.set(1);
        self.metrics.cpu_load_factor.set(FeedbackParams::CPU.initial);
        self.metrics
            .cpu_workers
            .set(i64::try_from(workers.len()).unwrap_or(i64::MAX));
        info!(
            episode,
            workers = workers.len(),
            target_percent = self.config.target_percent(),
            "cpu control activated"
        );

        *slot = Some(CpuEpisode {
            stop,
            started_ts: chrono::Utc::now().timestamp(),
            workers,
            adjuster,
        });
        true
    }

    /// Ends the running episode and waits for its adjuster and workers.
    /// Returns `false` if nothing was running.
    pub async fn deactivate(&self) -> bool {
        let taken = self.episode.lock().take();
        let Some(CpuEpisode { stop, workers, adjuster, .. }) = taken else {
            return false;
        };
        self.active.store(false, Ordering::Release);
        stop.stop();
        self.metrics.cpu_active.set(0);
        self.metrics.cpu_workers.set(0);

        if let Err(e) = adjuster.await {
            if e.is_panic() {
                error!(episode = stop.episode(), "cpu adjuster panicked");
            }
        }
        let cycles = tokio::task::spawn_blocking(move || {
            workers
                .into_iter()
                .map(|h| h.join().unwrap_or(0))
                .sum::<u64>()
        })
        .await
        .unwrap_or(0);
        info!(episode = stop.episode(), cycles, "cpu control deactivated");
        true
    }
}

struct CpuAdjuster {
    target_percent: f64,
    tuning: CpuTuning,
    sampler: SharedSampler,
    controller: FeedbackController,
    load_factor: Arc<SharedSignal>,
    active: Arc<AtomicBool>,
    stop: StopListener,
    metrics: Metrics,
}

impl CpuAdjuster {
    async fn run(mut self) {
        let mut ticker = interval(self.tuning.adjust_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.stop.stopped() => break,
                _ = ticker.tick() => {}
            }
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            let sample = tokio::select! {
                () = self.stop.stopped() => break,
                r = sample_cpu(&self.sampler, self.tuning.adjust_window) => r,
            };
            match sample {
                Ok(current) if current > 0.0 => self.adjust(current),
                Ok(current) => debug!(current, "cpu sample not positive; skipping adjust"),
                Err(e) => {
                    warn!(resource = "cpu", error = %e, "adjuster sample failed");
                    self.metrics.mark_skipped(Resource::CPU);
                }
            }
        }
        debug!(episode = self.stop.episode(), "cpu adjuster stopped");
    }

    fn adjust(&mut self, current: f64) {
        let target = self.target_percent;
        let dt = self.tuning.adjust_interval;
        let controller = &mut self.controller;
        match panic::catch_unwind(AssertUnwindSafe(|| controller.update(target, current, dt))) {
            Ok(load_factor) => {
                self.load_factor.store(load_factor);
                self.metrics.cpu_load_factor.set(load_factor);
                self.metrics.cpu_observed_percent.set(current);
                debug!(
                    current,
                    load_factor,
                    integral = self.controller.integral(),
                    "cpu load factor adjusted"
                );
            }
            Err(payload) => {
                error!(panic = %describe_panic(payload.as_ref()), "cpu adjust step panicked");
                self.controller.reset();
            }
        }
    }
}
