#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

//! Memory supervisor (on/off below target, protection override) and adjuster
//! (PID-driven allocation rate applied inline to the arena).

use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::control::{smoothing_for_target, FeedbackController, FeedbackParams, SharedSignal};
use crate::domain::{ControllerConfig, ControllerStatus, MemoryTuning, Resource};
use crate::episode::{StopListener, StopSignal};
use crate::lib_mem::{ArenaAction, BlockSizes, MemoryArena};
use crate::metrics::Metrics;
use crate::sampler::{sample_mem, SharedSampler};
use crate::service::describe_panic;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmergencyOutcome {
    pub freed_first: u64,
    pub resampled_percent: Option<f64>,
    pub freed_second: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MemoryAction {
    Skipped,
    Emergency(EmergencyOutcome),
    Activated,
    Deactivated,
    Hold,
}

struct MemEpisode {
    stop: StopSignal,
    started_ts: i64,
    adjuster: tokio::task::JoinHandle<()>,
}

pub struct MemoryController {
    config: ControllerConfig,
    tuning: MemoryTuning,
    smoothing: f64,
    sampler: SharedSampler,
    metrics: Metrics,
    arena: Arc<MemoryArena>,
    total_memory: u64,
    active: Arc<AtomicBool>,
    allocation_rate: Arc<SharedSignal>,
    last_observed: SharedSignal,
    episodes: AtomicU64,
    episode: Mutex<Option<MemEpisode>>,
}

impl MemoryController {
    pub fn new(
        config: ControllerConfig,
        tuning: MemoryTuning,
        sampler: SharedSampler,
        metrics: Metrics,
    ) -> Self {
        let total_memory = sampler.total_memory_bytes();
        let sizes = BlockSizes::for_total(total_memory, &tuning);
        metrics.mem_target_percent.set(config.target_percent());
        metrics.mem_allocation_rate.set(FeedbackParams::MEMORY.initial);
        metrics.set_allocated_bytes(0);
        Self {
            smoothing: smoothing_for_target(config.target_percent()),
            config,
            tuning,
            sampler,
            metrics,
            arena: Arc::new(MemoryArena::new(sizes)),
            total_memory,
            active: Arc::new(AtomicBool::new(false)),
            allocation_rate: Arc::new(SharedSignal::new(FeedbackParams::MEMORY.initial)),
            last_observed: SharedSignal::new(f64::NAN),
            episodes: AtomicU64::new(0),
            episode: Mutex::new(None),
        }
    }

    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn allocation_rate(&self) -> f64 {
        self.allocation_rate.load()
    }

    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ControllerStatus {
        let started = self.episode.lock().as_ref().map(|e| e.started_ts);
        let observed = self.last_observed.load();
        ControllerStatus {
            resource: Resource::MEMORY,
            active: self.is_active(),
            target_percent: self.config.target_percent(),
            signal: self.allocation_rate(),
            last_observed_percent: observed.is_finite().then_some(observed),
            episodes: self.episodes(),
            episode_started_ts: started,
            allocated_bytes: Some(self.arena.allocated_bytes()),
            workers: None,
        }
    }

    /// Supervisor loop at `check_interval` until `shutdown` fires. Everything
    /// the arena holds is released on return.
    pub async fn run(self: Arc<Self>, mut shutdown: StopListener) {
        let mut ticker = interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target_percent = self.config.target_percent(),
            protection_percent = self.tuning.protection_percent(),
            total_memory = self.total_memory,
            "memory supervisor started"
        );
        loop {
            tokio::select! {
                () = shutdown.stopped() => break,
                _ = ticker.tick() => {}
            }
            if let Err(payload) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                error!(
                    resource = "memory",
                    panic = %describe_panic(payload.as_ref()),
                    "supervisor tick panicked"
                );
            }
        }
        self.deactivate().await;
        let leftover = self.arena.release_all();
        self.metrics.set_allocated_bytes(0);
        info!(leftover, "memory supervisor stopped");
    }

    /// One supervisor decision: protection first, then on/off against the target.
    pub async fn tick(&self) -> MemoryAction {
        let current = match sample_mem(&self.sampler).await {
            Ok(v) => v,
            Err(e) => {
                warn!(resource = "memory", error = %e, "memory sample failed; skipping tick");
                self.metrics.mark_skipped(Resource::MEMORY);
                return MemoryAction::Skipped;
            }
        };
        self.record_observed(current);

        if current > self.tuning.protection_percent() {
            return MemoryAction::Emergency(self.emergency_free(current).await);
        }

        let target = self.config.target_percent();
        let should_be_active = current < target;
        debug!(current, target, should_be_active, "memory supervisor tick");
        match (should_be_active, self.is_active()) {
            (true, false) => {
                self.activate();
                MemoryAction::Activated
            }
            (false, true) => {
                self.deactivate().await;
                MemoryAction::Deactivated
            }
            _ => MemoryAction::Hold,
        }
    }

    /// Halves the arena, waits out the grace period, and drops everything if
    /// the host is still at or over the protection threshold.
    pub async fn emergency_free(&self, observed_percent: f64) -> EmergencyOutcome {
        let threshold = self.tuning.protection_percent();
        warn!(
            observed_percent,
            threshold,
            allocated = self.arena.allocated_bytes(),
            "memory above protection threshold; emergency free"
        );
        self.metrics.emergency_frees_total.inc();
        let freed_first = self.arena.free_fraction(0.5);
        self.metrics.set_allocated_bytes(self.arena.allocated_bytes());

        sleep(self.tuning.emergency_grace).await;

        let resampled_percent = match sample_mem(&self.sampler).await {
            Ok(v) => {
                self.record_observed(v);
                Some(v)
            }
            Err(e) => {
                warn!(error = %e, "re-sample after emergency free failed");
                None
            }
        };
        let mut freed_second = 0;
        if resampled_percent.is_some_and(|v| v >= threshold) {
            freed_second = self.arena.release_all();
            self.metrics.set_allocated_bytes(0);
            warn!(
                freed = freed_second,
                "still at or above protection threshold; released entire arena"
            );
        }
        EmergencyOutcome {
            freed_first,
            resampled_percent,
            freed_second,
        }
    }

    /// Starts the adjuster for a new episode. Returns `false` if one is
    /// already running. Must be called from within a tokio runtime.
    pub fn activate(&self) -> bool {
        let mut slot = self.episode.lock();
        if slot.is_some() {
            return false;
        }
        let episode = self.episodes.fetch_add(1, Ordering::AcqRel) + 1;
        let stop = StopSignal::new(episode);
        self.allocation_rate.store(FeedbackParams::MEMORY.initial);
        self.active.store(true, Ordering::Release);

        let adjuster = MemoryAdjuster {
            target_percent: self.config.target_percent(),
            tuning: self.tuning,
            sampler: Arc::clone(&self.sampler),
            controller: FeedbackController::new(FeedbackParams::MEMORY, self.smoothing),
            arena: Arc::clone(&self.arena),
            total_memory: self.total_memory,
            allocation_rate: Arc::clone(&self.allocation_rate),
            active: Arc::clone(&self.active),
            stop: stop.listener(),
            metrics: self.metrics.clone(),
        };
        let adjuster = tokio::spawn(adjuster.run());

        self.metrics.mark_episode(Resource::MEMORY);
        self.metrics.mem_active.set(1);
        info!(
            episode,
            target_percent = self.config.target_percent(),
            "memory control activated"
        );
        *slot = Some(MemEpisode {
            stop,
            started_ts: chrono::Utc::now().timestamp(),
            adjuster,
        });
        true
    }

    /// Stops the adjuster and releases the whole arena. Returns `false` if
    /// nothing was running.
    pub async fn deactivate(&self) -> bool {
        let taken = self.episode.lock().take();
        let Some(MemEpisode { stop, adjuster, .. }) = taken else {
            return false;
        };
        self.active.store(false, Ordering::Release);
        stop.stop();
        if let Err(e) = adjuster.await {
            if e.is_panic() {
                error!(episode = stop.episode(), "memory adjuster panicked");
            }
        }
        let released = self.arena.release_all();
        self.allocation_rate.store(FeedbackParams::MEMORY.initial);
        self.metrics.mem_active.set(0);
        self.metrics.mem_allocation_rate.set(FeedbackParams::MEMORY.initial);
        self.metrics.set_allocated_bytes(0);
        info!(episode = stop.episode(), released, "memory control deactivated");
        true
    }

    fn record_observed(&self, percent: f64) {
        self.last_observed.store(percent);
        self.metrics.mem_observed_percent.set(percent);
    }
}

struct MemoryAdjuster {
    target_percent: f64,
    tuning: MemoryTuning,
    sampler: SharedSampler,
    controller: FeedbackController,
    arena: Arc<MemoryArena>,
    total_memory: u64,
    allocation_rate: Arc<SharedSignal>,
    active: Arc<AtomicBool>,
    stop: StopListener,
    metrics: Metrics,
}

impl MemoryAdjuster {
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
            match sample_mem(&self.sampler).await {
                Ok(current) if current > 0.0 => {
                    let step = AssertUnwindSafe(self.adjust(current)).catch_unwind().await;
                    if let Err(payload) = step {
                        error!(
                            panic = %describe_panic(payload.as_ref()),
                            "memory adjust step panicked"
                        );
                        self.controller.reset();
                    }
                }
                Ok(current) => debug!(current, "memory sample not positive; skipping adjust"),
                Err(e) => {
                    warn!(resource = "memory", error = %e, "adjuster sample failed");
                    self.metrics.mark_skipped(Resource::MEMORY);
                }
            }
        }
        debug!(episode = self.stop.episode(), "memory adjuster stopped");
    }

    async fn adjust(&mut self, current: f64) {
        let rate = self
            .controller
            .update(self.target_percent, current, self.tuning.adjust_interval);
        self.allocation_rate.store(rate);
        self.metrics.mem_allocation_rate.set(rate);
        self.metrics.mem_observed_percent.set(current);

        let action = self
            .arena
            .sizes()
            .plan(rate, self.total_memory, self.arena.allocated_bytes());
        let arena = Arc::clone(&self.arena);
        let applied = tokio::task::spawn_blocking(move || match action {
            ArenaAction::Allocate(size) => arena.allocate(size),
            ArenaAction::Free(size) => Ok(arena.free(size)),
            ArenaAction::Idle => Ok(0),
        })
        .await;
        match applied {
            Ok(Ok(bytes)) => debug!(current, rate, ?action, bytes, "memory arena adjusted"),
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), ?action, "arena allocation failed"),
            Err(e) => error!(error = %e, "arena task failed"),
        }
        self.metrics.set_allocated_bytes(self.arena.allocated_bytes());
    }
}
