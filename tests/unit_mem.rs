#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

mod common;

use chimp_pressure_agent::domain::MemoryTuning;
use chimp_pressure_agent::episode::StopSignal;
use chimp_pressure_agent::lib_mem::{ArenaAction, BlockSizes, MemoryArena};
use chimp_pressure_agent::mem_controller::{MemoryAction, MemoryController};
use chimp_pressure_agent::metrics::Metrics;
use chimp_pressure_agent::sampler::SharedSampler;
use common::{config, fast_memory_tuning, ScriptedSampler, MIB};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const GIB: u64 = 1024 * MIB;

fn small_arena() -> MemoryArena {
    MemoryArena::new(BlockSizes::new(16, 4096))
}

fn controller(target: f64, sampler: &Arc<ScriptedSampler>) -> (MemoryController, Metrics) {
    let metrics = Metrics::new().expect("metrics");
    let shared: SharedSampler = sampler.clone();
    let ctrl = MemoryController::new(config(target), fast_memory_tuning(), shared, metrics.clone());
    (ctrl, metrics)
}

#[test]
fn allocate_then_free_tracks_exact_bytes() {
    let arena = small_arena();
    assert_eq!(arena.allocate(1000).expect("alloc"), 1000);
    assert_eq!(arena.allocated_bytes(), 1000);
    assert_eq!(arena.block_count(), 1);

    assert_eq!(arena.free(300), 300);
    assert_eq!(arena.allocated_bytes(), 700);
    assert_eq!(arena.block_count(), 1);

    assert_eq!(arena.free(10_000), 700);
    assert_eq!(arena.allocated_bytes(), 0);
    assert_eq!(arena.block_count(), 0);
    assert_eq!(arena.free(10), 0);
}

#[test]
fn free_drops_tail_blocks_before_shrinking() {
    let arena = small_arena();
    for _ in 0..3 {
        arena.allocate(100).expect("alloc");
    }
    assert_eq!(arena.free(150), 150);
    assert_eq!(arena.block_count(), 2);
    assert_eq!(arena.allocated_bytes(), 150);
    assert_eq!(arena.free_fraction(0.5), 75);
    assert_eq!(arena.release_all(), 75);
    assert_eq!(arena.allocated_bytes(), 0);
}

#[test]
fn zero_sized_allocation_is_a_noop() {
    let arena = small_arena();
    assert_eq!(arena.allocate(0).expect("alloc"), 0);
    assert_eq!(arena.block_count(), 0);
}

#[test]
fn block_sizes_respect_floors() {
    let tuning = MemoryTuning::default();
    let small = BlockSizes::for_total(GIB, &tuning);
    assert_eq!(small, BlockSizes::new(32 * MIB, 256 * MIB));

    let large = BlockSizes::for_total(64 * GIB, &tuning);
    assert_eq!(large.min(), 64 * GIB / 100);
    assert_eq!(large.max(), 64 * GIB / 20);
}

#[test]
fn inverted_block_bounds_are_ordered() {
    let sizes = BlockSizes::new(4096, 16);
    assert_eq!((sizes.min(), sizes.max()), (4096, 4096));
    assert_eq!(sizes.plan(0.5, 1_000_000, 0), ArenaAction::Allocate(4096));
    assert_eq!(sizes.plan(-0.01, 0, 10), ArenaAction::Free(2048));

    let tuning = MemoryTuning {
        min_block_floor: 8 * MIB,
        max_block_floor: MIB,
        ..MemoryTuning::default()
    };
    let floored = BlockSizes::for_total(MIB, &tuning);
    assert_eq!((floored.min(), floored.max()), (8 * MIB, 8 * MIB));
}

#[test]
fn plan_clamps_to_block_sizes() {
    let sizes = BlockSizes::new(32 * MIB, 256 * MIB);
    assert_eq!(sizes.plan(0.05, GIB, 0), ArenaAction::Allocate(53_687_091));
    assert_eq!(sizes.plan(0.1, 64 * GIB, 0), ArenaAction::Allocate(256 * MIB));
    assert_eq!(sizes.plan(0.001, GIB, 0), ArenaAction::Allocate(32 * MIB));
    assert_eq!(sizes.plan(-0.05, GIB, 100 * MIB), ArenaAction::Free(16 * MIB));
    assert_eq!(sizes.plan(-0.05, GIB, 8 * GIB), ArenaAction::Free(256 * MIB));
    assert_eq!(sizes.plan(0.0, GIB, GIB), ArenaAction::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emergency_free_halves_then_releases_everything() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 96.0, MIB);
    let (ctrl, metrics) = controller(60.0, &sampler);
    ctrl.arena().allocate(1000).expect("alloc");

    let MemoryAction::Emergency(outcome) = ctrl.tick().await else {
        panic!("expected emergency free");
    };
    assert_eq!(outcome.freed_first, 500);
    assert_eq!(outcome.resampled_percent, Some(96.0));
    assert_eq!(outcome.freed_second, 500);
    assert_eq!(ctrl.arena().allocated_bytes(), 0);
    assert!(!ctrl.is_active());
    assert_eq!(metrics.emergency_frees_total.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emergency_free_stops_at_half_once_pressure_drops() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 90.0, MIB);
    sampler.push_mem(Some(96.0));
    let (ctrl, _metrics) = controller(60.0, &sampler);
    ctrl.arena().allocate(1000).expect("alloc");

    let MemoryAction::Emergency(outcome) = ctrl.tick().await else {
        panic!("expected emergency free");
    };
    assert_eq!(outcome.freed_first, 500);
    assert_eq!(outcome.resampled_percent, Some(90.0));
    assert_eq!(outcome.freed_second, 0);
    assert_eq!(ctrl.arena().allocated_bytes(), 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emergency_free_releases_everything_at_exact_threshold() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 95.0, MIB);
    sampler.push_mem(Some(96.0));
    let (ctrl, metrics) = controller(60.0, &sampler);
    ctrl.arena().allocate(1000).expect("alloc");

    let MemoryAction::Emergency(outcome) = ctrl.tick().await else {
        panic!("expected emergency free");
    };
    assert_eq!(outcome.freed_first, 500);
    assert_eq!(outcome.resampled_percent, Some(95.0));
    assert_eq!(outcome.freed_second, 500);
    assert_eq!(ctrl.arena().allocated_bytes(), 0);
    assert_eq!(metrics.mem_allocated_bytes.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exact_threshold_does_not_trigger_emergency() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 95.0, MIB);
    let (ctrl, metrics) = controller(60.0, &sampler);
    ctrl.arena().allocate(1000).expect("alloc");

    assert_eq!(ctrl.tick().await, MemoryAction::Hold);
    assert_eq!(ctrl.arena().allocated_bytes(), 1000);
    assert_eq!(metrics.emergency_frees_total.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tick_toggles_on_target_and_releases_on_deactivate() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 40.0, MIB);
    let (ctrl, metrics) = controller(60.0, &sampler);

    assert_eq!(ctrl.tick().await, MemoryAction::Activated);
    assert!(ctrl.is_active());
    assert_eq!(ctrl.tick().await, MemoryAction::Hold);

    sleep(Duration::from_millis(150)).await;
    assert!(ctrl.arena().allocated_bytes() > 0);
    assert!(ctrl.allocation_rate() > 0.0);

    sampler.set_mem(Some(70.0));
    assert_eq!(ctrl.tick().await, MemoryAction::Deactivated);
    assert!(!ctrl.is_active());
    assert_eq!(ctrl.arena().allocated_bytes(), 0);
    assert_eq!(metrics.mem_allocated_bytes.get(), 0);
    assert_eq!(ctrl.tick().await, MemoryAction::Hold);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activate_and_deactivate_are_idempotent() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 70.0, MIB);
    let (ctrl, _metrics) = controller(60.0, &sampler);
    assert!(!ctrl.deactivate().await);
    assert!(ctrl.activate());
    assert!(!ctrl.activate());
    assert_eq!(ctrl.episodes(), 1);
    assert!(ctrl.deactivate().await);
    assert!(!ctrl.deactivate().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_samples_skip_the_tick() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 40.0, MIB);
    sampler.push_mem(Some(f64::NAN));
    sampler.push_mem(None);
    let (ctrl, metrics) = controller(60.0, &sampler);
    assert_eq!(ctrl.tick().await, MemoryAction::Skipped);
    assert_eq!(ctrl.tick().await, MemoryAction::Skipped);
    assert!(!ctrl.is_active());
    assert_eq!(metrics.skipped_samples_total.with_label_values(&["memory"]).get(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_loop_releases_arena_on_shutdown() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 40.0, MIB);
    let (ctrl, _metrics) = controller(60.0, &sampler);
    let ctrl = Arc::new(ctrl);
    let shutdown = StopSignal::new(0);
    let handle = tokio::spawn(Arc::clone(&ctrl).run(shutdown.listener()));

    sleep(Duration::from_millis(150)).await;
    assert!(ctrl.is_active());
    assert!(ctrl.status().allocated_bytes.unwrap_or(0) > 0);

    shutdown.stop();
    handle.await.expect("supervisor task");
    assert!(!ctrl.is_active());
    assert_eq!(ctrl.arena().allocated_bytes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_loop_survives_panicking_sampler() {
    let sampler = ScriptedSampler::with_total_memory(10.0, 40.0, MIB);
    sampler.push_mem_panic();
    let (ctrl, metrics) = controller(60.0, &sampler);
    let ctrl = Arc::new(ctrl);
    let shutdown = StopSignal::new(0);
    let handle = tokio::spawn(Arc::clone(&ctrl).run(shutdown.listener()));

    // first tick hits the panic, the second arrives one check interval later
    sleep(Duration::from_millis(1200)).await;
    assert!(sampler.mem_calls() >= 2);
    assert!(ctrl.is_active());
    assert_eq!(ctrl.episodes(), 1);
    assert_eq!(metrics.skipped_samples_total.with_label_values(&["memory"]).get(), 1);

    shutdown.stop();
    handle.await.expect("supervisor task");
    assert!(!ctrl.is_active());
}
