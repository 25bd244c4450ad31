//! Integration tests for wasm-tiering-core.
//!
//! These tests drive the complete tier-up pipeline:
//! - Callee group creation through the engine
//! - Counter-triggered background compilation
//! - Linking and publication into replacement / OSR-entry slots
//! - Fallback when executable memory runs out

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use wasm_tiering_common::{CompilerConfig, TierError, TierUpThresholds, TieringConfig};
use wasm_tiering_core::{
    BackendOutput, Callee, CallSiteIndex, CompilationMode, CompileRequest, CompileTier,
    CompiledCode, Entrypoint, ExecutableAllocator, FunctionCodeBlock, FunctionDefinition,
    FunctionIdentity, FunctionIndex, MemoryMode, PlanKey, PlanStatus, StackMaps,
    SyntheticBackend, TagFilter, TagIndex, TierCompiler, TieringEngine, UnlinkedHandlerInfo,
};

fn engine(baseline: u32, optimizing: u32, osr: u32, executable_memory_kb: usize) -> TieringEngine {
    let config = TieringConfig {
        thresholds: TierUpThresholds {
            baseline_after_calls: baseline,
            optimizing_after_calls: optimizing,
            osr_after_back_edges: osr,
        },
        compiler: CompilerConfig {
            worker_threads: 2,
            executable_memory_kb,
        },
    };
    TieringEngine::new(&config).unwrap()
}

fn functions(count: usize, bytecode_len: usize) -> Vec<FunctionDefinition> {
    (0..count)
        .map(|i| {
            FunctionDefinition::named(
                format!("func{i}"),
                FunctionCodeBlock::new(vec![0u8; bytecode_len])
                    .with_locals(2)
                    .with_loop(8, 1),
            )
        })
        .collect()
}

// ============================================================================
// Test: End-to-end Baseline Tier-up
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_three_function_baseline_tier_up() {
    const K: u32 = 10;
    let engine = engine(K, 1_000, 1_000, 1024);
    let group = engine.create_group(0, functions(3, 32));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f0 = FunctionIndex(0);
    let mode = MemoryMode::BoundsChecking;

    let interpreter_entry = group.get(f0).entrypoint();
    for _ in 0..K {
        let callee = coordinator.on_call(f0, mode);
        assert_eq!(callee.mode(), CompilationMode::Interpreter);
    }
    coordinator.wait_idle().await;

    assert_eq!(
        coordinator.plan_status(&PlanKey::baseline(f0, mode)),
        Some(PlanStatus::Installed)
    );
    let callee = coordinator.on_call(f0, mode);
    assert_eq!(callee.mode(), CompilationMode::Baseline);
    assert_ne!(callee.entrypoint(), interpreter_entry);
    assert!(callee.code_range().contains(callee.entrypoint()));

    // No back-edges were recorded, so no OSR entry exists.
    assert!(group.osr_entry(f0, mode).is_none());
    // Other functions and modes are untouched.
    assert_eq!(
        coordinator.on_call(FunctionIndex(1), mode).mode(),
        CompilationMode::Interpreter
    );
    assert_eq!(
        coordinator.on_call(f0, MemoryMode::Signaling).mode(),
        CompilationMode::Interpreter
    );
}

// ============================================================================
// Test: Baseline to Optimizing
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_optimizing_replaces_baseline() {
    let engine = engine(2, 3, 1_000, 1024);
    let group = engine.create_group(0, functions(1, 16));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f0 = FunctionIndex(0);
    let mode = MemoryMode::Signaling;

    for _ in 0..2 {
        coordinator.on_call(f0, mode);
    }
    coordinator.wait_idle().await;
    let baseline = coordinator.on_call(f0, mode);
    assert_eq!(baseline.mode(), CompilationMode::Baseline);
    for _ in 0..2 {
        coordinator.on_call(f0, mode);
    }
    coordinator.wait_idle().await;

    let optimizing = coordinator.on_call(f0, mode);
    assert_eq!(optimizing.mode(), CompilationMode::Optimizing);
    assert_eq!(optimizing.memory_mode(), Some(mode));

    // Published into the baseline's slot too.
    let from_baseline = baseline.as_baseline().unwrap().replacement().load().unwrap();
    assert!(Arc::ptr_eq(&from_baseline, &optimizing));

    // Both compiled tiers stay attributable while the group lives.
    assert!(Arc::ptr_eq(
        &group.callee_for_pc(baseline.entrypoint()).unwrap(),
        &baseline
    ));
    assert!(Arc::ptr_eq(
        &group.callee_for_pc(optimizing.entrypoint()).unwrap(),
        &optimizing
    ));
}

// ============================================================================
// Test: OSR Entry
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_loop_back_edges_install_osr_entry() {
    let engine = engine(1_000, 1_000, 5, 1024);
    let group = engine.create_group(0, functions(2, 32));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f1 = FunctionIndex(1);
    let mode = MemoryMode::BoundsChecking;

    for _ in 0..5 {
        assert!(coordinator.on_loop_back_edge(f1, mode, 0).is_none());
    }
    coordinator.wait_idle().await;

    let entry = coordinator.on_loop_back_edge(f1, mode, 0).unwrap();
    let osr = entry.as_osr_entry().unwrap();
    assert_eq!(entry.mode(), CompilationMode::OptimizingOsrEntry);
    assert_eq!(osr.loop_index(), 0);
    // Two locals plus one live value at the header.
    assert_eq!(osr.scratch_buffer_size(), 24);
    assert_eq!(entry.stackmap(CallSiteIndex(0)).len(), 3);

    // A different loop does not enter this code.
    assert!(coordinator.on_loop_back_edge(f1, mode, 1).is_none());
    assert!(Arc::ptr_eq(&group.osr_entry(f1, mode).unwrap(), &entry));
    // Calls still go to the interpreter.
    assert_eq!(group.call_target(f1, mode).mode(), CompilationMode::Interpreter);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_osr_entry_from_baseline() {
    let engine = engine(1, 1_000, 2, 1024);
    let group = engine.create_group(0, functions(1, 32));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f0 = FunctionIndex(0);
    let mode = MemoryMode::BoundsChecking;

    coordinator.on_call(f0, mode);
    coordinator.wait_idle().await;
    let baseline = coordinator.on_call(f0, mode);
    assert_eq!(baseline.mode(), CompilationMode::Baseline);

    for _ in 0..2 {
        coordinator.on_loop_back_edge(f0, mode, 0);
    }
    coordinator.wait_idle().await;

    let entry = coordinator.on_loop_back_edge(f0, mode, 0).unwrap();
    assert!(Arc::ptr_eq(
        &baseline.as_baseline().unwrap().osr_entry().load().unwrap(),
        &entry
    ));
    assert!(group.get(f0).as_interpreter().unwrap().osr_entry(mode).load().is_none());
    assert!(Arc::ptr_eq(&group.osr_entry(f0, mode).unwrap(), &entry));
}

// ============================================================================
// Test: Idempotent Publication
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_compilations_publish_once() {
    let engine = engine(1_000, 1_000, 1_000, 1024);
    let group = engine.create_group(0, functions(1, 64));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let key = PlanKey::baseline(FunctionIndex(0), MemoryMode::BoundsChecking);
    let dispatch_bytes = engine.allocator().bytes_in_use();

    let first = coordinator.request(key);
    let second = coordinator.request(key);
    let first = assert_ok!(first.await.unwrap());
    let second = assert_ok!(second.await.unwrap());

    // Both report the single published callee.
    assert!(Arc::ptr_eq(&first, &second));
    let slot = group
        .get(FunctionIndex(0))
        .as_interpreter()
        .unwrap()
        .replacement(MemoryMode::BoundsChecking);
    assert_eq!(slot.history().len(), 1);
    assert!(Arc::ptr_eq(&slot.load().unwrap(), &first));

    // The losing compilation's code was freed.
    assert_eq!(
        engine.allocator().bytes_in_use(),
        dispatch_bytes + first.code_range().len()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_racing_optimizing_plans_agree_on_one_callee() {
    let engine = engine(1_000, 1_000, 1_000, 1024);
    let group = engine.create_group(0, functions(1, 32));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f0 = FunctionIndex(0);
    let mode = MemoryMode::Signaling;

    let baseline = assert_ok!(coordinator.request(PlanKey::baseline(f0, mode)).await.unwrap());
    let first = coordinator.request(PlanKey::optimizing(f0, mode));
    let second = coordinator.request(PlanKey::optimizing(f0, mode));
    let first = assert_ok!(first.await.unwrap());
    let second = assert_ok!(second.await.unwrap());

    assert!(Arc::ptr_eq(&first, &second));
    let interpreter_slot = group.get(f0).as_interpreter().unwrap().replacement(mode);
    let baseline_slot = baseline.as_baseline().unwrap().replacement();
    assert!(Arc::ptr_eq(
        &interpreter_slot.load().unwrap(),
        &baseline_slot.load().unwrap()
    ));
    assert_eq!(baseline_slot.history().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_optimizing_plan_forwards_the_interpreter_slot_winner() {
    let engine = engine(1_000, 1_000, 1_000, 1024);
    let group = engine.create_group(0, functions(1, 32));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f0 = FunctionIndex(0);
    let mode = MemoryMode::BoundsChecking;
    let interpreter = group.get(f0);

    let baseline = assert_ok!(coordinator.request(PlanKey::baseline(f0, mode)).await.unwrap());

    // Another plan has won the interpreter slot but not yet reached the
    // baseline callee's slot.
    let output = SyntheticBackend
        .compile(
            &CompileRequest {
                function: Arc::clone(interpreter),
                tier: CompileTier::Optimizing,
                memory_mode: mode,
            },
            engine.allocator(),
        )
        .unwrap();
    let earlier = Callee::optimizing(interpreter.identity().clone(), output.code, mode);
    interpreter
        .as_interpreter()
        .unwrap()
        .replacement(mode)
        .publish(Arc::clone(&earlier))
        .unwrap();

    let installed = assert_ok!(coordinator.request(PlanKey::optimizing(f0, mode)).await.unwrap());

    assert!(Arc::ptr_eq(&installed, &earlier));
    assert!(Arc::ptr_eq(
        &baseline.as_baseline().unwrap().replacement().load().unwrap(),
        &earlier
    ));
    assert_eq!(
        coordinator.plan_status(&PlanKey::optimizing(f0, mode)),
        Some(PlanStatus::Rejected)
    );
}

/// Fails the first compilation after a delay and delegates the rest.
#[derive(Default)]
struct SlowFirstFailure {
    calls: AtomicUsize,
    slow_finished: AtomicBool,
}

impl TierCompiler for SlowFirstFailure {
    fn name(&self) -> &str {
        "slow-first-failure"
    }

    fn compile(
        &self,
        request: &CompileRequest,
        allocator: &ExecutableAllocator,
    ) -> Result<BackendOutput, TierError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(200));
            self.slow_finished.store(true, Ordering::SeqCst);
            return Err(TierError::compilation_failed(
                request.identity().index().0,
                "slow compilation gave up",
            ));
        }
        SyntheticBackend.compile(request, allocator)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_idle_covers_repeated_requests() {
    let backend = Arc::new(SlowFirstFailure::default());
    let engine = TieringEngine::with_backend(&TieringConfig::default(), backend.clone()).unwrap();
    let group = engine.create_group(0, functions(1, 32));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let key = PlanKey::baseline(FunctionIndex(0), MemoryMode::BoundsChecking);

    drop(coordinator.request(key));
    drop(coordinator.request(key));
    coordinator.wait_idle().await;

    assert!(backend.slow_finished.load(Ordering::SeqCst));
    assert_eq!(coordinator.pending(), 0);
    // The failure finished last but does not hide the installed callee.
    assert_eq!(coordinator.plan_status(&key), Some(PlanStatus::Installed));
    assert_eq!(
        group.call_target(FunctionIndex(0), MemoryMode::BoundsChecking).mode(),
        CompilationMode::Baseline
    );
}

// ============================================================================
// Test: Tier-up Monotonicity
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_replacement_never_moves_down() {
    let engine = engine(1_000, 1_000, 1_000, 1024);
    let group = engine.create_group(0, functions(1, 16));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f0 = FunctionIndex(0);
    let mode = MemoryMode::Signaling;

    assert_ok!(coordinator.request(PlanKey::baseline(f0, mode)).await.unwrap());
    assert_ok!(coordinator.request(PlanKey::optimizing(f0, mode)).await.unwrap());
    let late = assert_ok!(coordinator.request(PlanKey::baseline(f0, mode)).await.unwrap());

    assert_eq!(late.mode(), CompilationMode::Optimizing);
    // The earlier baseline plan installed; the late rejection does not mask it.
    assert_eq!(
        coordinator.plan_status(&PlanKey::baseline(f0, mode)),
        Some(PlanStatus::Installed)
    );
    for _ in 0..100 {
        assert_eq!(group.call_target(f0, mode).mode(), CompilationMode::Optimizing);
    }
}

// ============================================================================
// Test: Out of Executable Memory
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_memory_stays_in_interpreter() {
    // 4 KiB go to the interpreter dispatch, leaving 1 KiB for JIT code.
    let engine = engine(3, 1_000, 1_000, 5);
    let group = engine.create_group(0, functions(1, 1024));
    let coordinator = engine.coordinator(Arc::clone(&group), tokio::runtime::Handle::current());
    let f0 = FunctionIndex(0);
    let mode = MemoryMode::BoundsChecking;
    let key = PlanKey::baseline(f0, mode);

    for _ in 0..3 {
        coordinator.on_call(f0, mode);
    }
    coordinator.wait_idle().await;

    let Some(PlanStatus::Failed(err)) = coordinator.plan_status(&key) else {
        panic!("expected a failed plan");
    };
    assert!(err.is_resource_exhaustion());

    // Falls back indefinitely without retrying.
    for _ in 0..10 {
        assert_eq!(coordinator.on_call(f0, mode).mode(), CompilationMode::Interpreter);
    }
    assert_eq!(coordinator.pending(), 0);
    assert_eq!(coordinator.plans().len(), 1);
    assert!(!group.get(f0).as_interpreter().unwrap().replacement(mode).is_set());

    let err = assert_err!(coordinator.request(key).await.unwrap());
    assert!(err.is_resource_exhaustion());
}

// ============================================================================
// Test: Exception Handler Resolution
// ============================================================================

#[test]
fn test_innermost_catch_all_wins() {
    let allocator = ExecutableAllocator::new(4096);
    let memory = allocator.allocate(0x40).unwrap();
    let start = memory.range().start();
    let h1 = start.offset(0x30);
    let h2 = start.offset(0x38);
    let err_tag = TagIndex(0);

    let callee = Callee::optimizing(
        FunctionIdentity::named(FunctionIndex(0), "thrower"),
        CompiledCode {
            entrypoint: Entrypoint::new(memory, 0, Vec::new()),
            call_sites: Vec::new(),
            stackmaps: StackMaps::new(),
            unlinked_handlers: vec![
                UnlinkedHandlerInfo::new(0x10..0x20, TagFilter::Tag(err_tag)),
                UnlinkedHandlerInfo::new(0x12..0x18, TagFilter::CatchAll),
            ],
            handler_locations: vec![h1, h2],
        },
        MemoryMode::BoundsChecking,
    );

    assert_eq!(callee.handler_for(0x15, Some(err_tag)).unwrap().landing_pad, h2);
    assert_eq!(callee.handler_for(0x15, None).unwrap().landing_pad, h2);
    assert_eq!(callee.handler_for(0x1c, Some(err_tag)).unwrap().landing_pad, h1);
    assert!(callee.handler_for(0x1c, Some(TagIndex(1))).is_none());
    assert!(callee.handler_for(0x08, Some(err_tag)).is_none());
}
