//! Tier-up coordination.
//!
//! [`TierUpCoordinator`] is what executing threads call at function entry
//! and at loop back-edges. It bumps the callee's counters, starts a
//! background compilation the first time a threshold is crossed, and
//! hands back whatever code the slots currently point at. It never waits
//! for a compilation.
//!
//! Compilations run on the tokio blocking pool. When one finishes, its
//! callee is fully linked and then published; a failed compilation
//! publishes nothing and the function stays in its current tier. Nothing
//! is retried.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use wasm_tiering_common::{TierError, TierUpThresholds};

use crate::backend::{CompileRequest, CompileTier, TierCompiler};
use crate::callee::{BaselineCallee, Callee, CalleeKind, CompilationMode, FunctionIndex};
use crate::executable::ExecutableAllocator;
use crate::group::CalleeGroup;
use crate::memory_mode::MemoryMode;
use crate::slot::CalleeSlot;
use crate::tier_up::TierUpCounter;

/// Identifies one compilation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    /// Function being compiled.
    pub function: FunctionIndex,
    /// Memory mode the code is specialized for.
    pub memory_mode: MemoryMode,
    /// Tier being produced.
    pub tier: CompileTier,
    /// Tier the function is running in when the plan is made. Decides which
    /// slot an OSR entry is published into.
    pub source: CompilationMode,
}

impl PlanKey {
    /// Interpreter to baseline.
    pub fn baseline(function: FunctionIndex, memory_mode: MemoryMode) -> Self {
        Self {
            function,
            memory_mode,
            tier: CompileTier::Baseline,
            source: CompilationMode::Interpreter,
        }
    }

    /// Baseline to optimizing.
    pub fn optimizing(function: FunctionIndex, memory_mode: MemoryMode) -> Self {
        Self {
            function,
            memory_mode,
            tier: CompileTier::Optimizing,
            source: CompilationMode::Baseline,
        }
    }

    /// OSR entry at `loop_index`, entered from `source`.
    ///
    /// # Panics
    ///
    /// Panics unless `source` is the interpreter or baseline tier.
    pub fn osr_entry(
        function: FunctionIndex,
        memory_mode: MemoryMode,
        loop_index: u32,
        source: CompilationMode,
    ) -> Self {
        assert!(
            matches!(source, CompilationMode::Interpreter | CompilationMode::Baseline),
            "{source} code does not tier up through OSR"
        );
        Self {
            function,
            memory_mode,
            tier: CompileTier::OsrEntry { loop_index },
            source,
        }
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "function {} {} ({}, from {})",
            self.function.0, self.tier, self.memory_mode, self.source
        )
    }
}

/// State of a compilation plan.
///
/// When the same plan is requested more than once, `Installed` sticks, and
/// a finished compilation only overwrites `Compiling` if no later request
/// has replaced its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStatus {
    /// Running on the blocking pool.
    Compiling {
        /// Plan id, as it appears in logs.
        id: Uuid,
    },
    /// Finished and published.
    Installed,
    /// Finished, but the slot already held an equal or higher tier.
    Rejected,
    /// The backend failed; the slot was left as it was.
    Failed(TierError),
}

struct Inner {
    group: Arc<CalleeGroup>,
    backend: Arc<dyn TierCompiler>,
    allocator: ExecutableAllocator,
    thresholds: TierUpThresholds,
    plans: DashMap<PlanKey, PlanStatus>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// One compilation on the blocking pool. Dropping it wakes `wait_idle`
/// when it was the last one.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn start(inner: &Arc<Inner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Drives tier-up for one callee group.
///
/// Cloning is cheap; clones share plans and slots.
#[derive(Clone)]
pub struct TierUpCoordinator {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl TierUpCoordinator {
    /// Create a coordinator that compiles on `runtime`'s blocking pool.
    pub fn new(
        group: Arc<CalleeGroup>,
        backend: Arc<dyn TierCompiler>,
        allocator: ExecutableAllocator,
        thresholds: TierUpThresholds,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                group,
                backend,
                allocator,
                thresholds,
                plans: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            runtime,
        }
    }

    /// The callee group being tiered up.
    pub fn group(&self) -> &Arc<CalleeGroup> {
        &self.inner.group
    }

    /// Record a call of `index` under `mode` and return the callee to enter.
    ///
    /// Crossing the call threshold starts the next tier's compilation once;
    /// the returned callee is whatever is installed right now.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn on_call(&self, index: FunctionIndex, mode: MemoryMode) -> Arc<Callee> {
        let target = self.inner.group.call_target(index, mode);

        match target.kind() {
            CalleeKind::Interpreter(interpreter) => {
                if interpreter.tier_up().record_call()
                    && interpreter.requests(mode).replacement.try_claim()
                {
                    drop(self.request(PlanKey::baseline(index, mode)));
                }
            }
            CalleeKind::Baseline(baseline) => {
                if baseline.tier_up().record_call()
                    && baseline.did_start_compiling_replacement().try_claim()
                {
                    drop(self.request(PlanKey::optimizing(index, mode)));
                }
            }
            CalleeKind::Optimizing(_) | CalleeKind::OsrEntry(_) | CalleeKind::EmbedderEntry(_) => {}
        }

        target
    }

    /// Record a back-edge of `loop_index` in a frame of `index` running the
    /// currently installed tier under `mode`.
    ///
    /// Returns the OSR-entry callee to jump into if one is installed for
    /// this loop. Crossing the back-edge threshold starts its compilation
    /// once.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn on_loop_back_edge(
        &self,
        index: FunctionIndex,
        mode: MemoryMode,
        loop_index: u32,
    ) -> Option<Arc<Callee>> {
        let current = self.inner.group.call_target(index, mode);

        let (slot, counter, claim): (&CalleeSlot, &TierUpCounter, _) = match current.kind() {
            CalleeKind::Interpreter(interpreter) => (
                interpreter.osr_entry(mode),
                interpreter.tier_up(),
                &interpreter.requests(mode).osr_entry,
            ),
            CalleeKind::Baseline(baseline) => (
                baseline.osr_entry(),
                baseline.tier_up(),
                baseline.did_start_compiling_osr_entry(),
            ),
            CalleeKind::Optimizing(_) | CalleeKind::OsrEntry(_) | CalleeKind::EmbedderEntry(_) => {
                return None;
            }
        };

        if let Some(entry) = slot.load() {
            let matches = entry
                .as_osr_entry()
                .is_some_and(|osr| osr.loop_index() == loop_index);
            return matches.then_some(entry);
        }

        if counter.record_back_edge() && claim.try_claim() {
            let key = PlanKey::osr_entry(index, mode, loop_index, current.mode());
            drop(self.request(key));
        }
        None
    }

    /// Compile and publish the plan `key` on the blocking pool.
    ///
    /// Does not consult request flags, so calling it twice races two
    /// compilations; exactly one of them gets published. The handle
    /// resolves to the callee the target slot holds afterwards.
    ///
    /// # Errors
    ///
    /// The handle resolves to the backend's error if compilation failed.
    pub fn request(&self, key: PlanKey) -> JoinHandle<Result<Arc<Callee>, TierError>> {
        let id = Uuid::new_v4();
        self.inner
            .plans
            .entry(key)
            .and_modify(|status| {
                if *status != PlanStatus::Installed {
                    *status = PlanStatus::Compiling { id };
                }
            })
            .or_insert(PlanStatus::Compiling { id });
        debug!(plan_id = %id, plan = %key, "Compilation requested");

        let in_flight = InFlight::start(&self.inner);
        self.runtime.spawn_blocking(move || {
            let result = compile_and_install(&in_flight.0, key, id);
            drop(in_flight);
            result
        })
    }

    /// Status of plan `key`, if it was ever requested.
    pub fn plan_status(&self, key: &PlanKey) -> Option<PlanStatus> {
        self.inner.plans.get(key).map(|status| status.clone())
    }

    /// Number of compilations still running, counting repeated requests
    /// of the same plan separately.
    pub fn pending(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no compilation is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Register before checking so a wakeup in between is not lost.
            idle.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Snapshot of every plan and its status.
    pub fn plans(&self) -> Vec<(PlanKey, PlanStatus)> {
        self.inner
            .plans
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

impl fmt::Debug for TierUpCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierUpCoordinator")
            .field("group", &self.inner.group)
            .field("backend", &self.inner.backend.name())
            .field("plans", &self.inner.plans.len())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Latest baseline callee published for `interpreter` under `mode`.
fn installed_baseline(interpreter: &Callee, mode: MemoryMode) -> Option<Arc<Callee>> {
    interpreter
        .as_interpreter()?
        .replacement(mode)
        .history()
        .into_iter()
        .rev()
        .find(|callee| callee.mode() == CompilationMode::Baseline)
}

/// Record how plan `id` of `key` ended. See [`PlanStatus`] for precedence.
fn settle(inner: &Inner, key: PlanKey, id: Uuid, outcome: PlanStatus) {
    let mut status = inner
        .plans
        .entry(key)
        .or_insert(PlanStatus::Compiling { id });
    let overwrite = match (&*status, &outcome) {
        (_, PlanStatus::Installed) => true,
        (PlanStatus::Compiling { id: latest }, _) => *latest == id,
        _ => false,
    };
    if overwrite {
        *status = outcome;
    }
}

fn record_failure(inner: &Inner, key: PlanKey, id: Uuid, err: TierError) -> TierError {
    warn!(plan_id = %id, plan = %key, error = %err, "Compilation failed, staying in current tier");
    settle(inner, key, id, PlanStatus::Failed(err.clone()));
    err
}

#[instrument(skip(inner), fields(plan = %key))]
fn compile_and_install(inner: &Inner, key: PlanKey, id: Uuid) -> Result<Arc<Callee>, TierError> {
    let function = Arc::clone(inner.group.get(key.function));
    let identity = function.identity().clone();
    let mode = key.memory_mode;
    let baseline = installed_baseline(&function, mode);

    if matches!(key.tier, CompileTier::OsrEntry { .. })
        && key.source == CompilationMode::Baseline
        && baseline.is_none()
    {
        let err = TierError::compilation_failed(
            key.function.0,
            "no baseline code installed to enter from",
        );
        return Err(record_failure(inner, key, id, err));
    }

    let request = CompileRequest {
        function: Arc::clone(&function),
        tier: key.tier,
        memory_mode: mode,
    };

    let output = match inner.backend.compile(&request, &inner.allocator) {
        Ok(output) => output,
        Err(err) => return Err(record_failure(inner, key, id, err)),
    };

    let callee = match key.tier {
        CompileTier::Baseline => Callee::baseline(
            identity,
            output.code,
            mode,
            TierUpCounter::for_baseline(&inner.thresholds),
        ),
        CompileTier::Optimizing => Callee::optimizing(identity, output.code, mode),
        CompileTier::OsrEntry { loop_index } => Callee::osr_entry(
            identity,
            output.code,
            mode,
            loop_index,
            output.scratch_buffer_size,
        ),
    };

    let Some(interpreter) = function.as_interpreter() else {
        unreachable!("callee groups hold interpreter callees only");
    };
    let baseline_callee = baseline.as_ref().and_then(|b| b.as_baseline());
    // `mirror` receives whatever wins `slot`, never a callee of its own.
    let (slot, mirror) = match (key.tier, key.source) {
        (CompileTier::OsrEntry { .. }, CompilationMode::Baseline) => match baseline_callee {
            Some(baseline) => (baseline.osr_entry(), None),
            None => unreachable!("checked before compiling"),
        },
        (CompileTier::OsrEntry { .. }, _) => (interpreter.osr_entry(mode), None),
        (CompileTier::Optimizing, _) => (
            interpreter.replacement(mode),
            baseline_callee.map(BaselineCallee::replacement),
        ),
        (CompileTier::Baseline, _) => (interpreter.replacement(mode), None),
    };

    let code_range = callee.code_range();
    match slot.publish(callee) {
        Ok(()) => {
            settle(inner, key, id, PlanStatus::Installed);
            info!(
                plan_id = %id,
                function = %function.identity(),
                code = ?code_range,
                "Compiled callee installed"
            );
        }
        Err(rejected) => {
            settle(inner, key, id, PlanStatus::Rejected);
            debug!(
                plan_id = %id,
                rejected = %rejected.mode(),
                "Slot already holds an equal or higher tier"
            );
        }
    }

    let winner = slot
        .load()
        .ok_or_else(|| TierError::compilation_failed(key.function.0, "slot empty after publish"))?;

    // Frames still entering through the baseline callee see the same code.
    if let Some(mirror) = mirror {
        match mirror.publish(Arc::clone(&winner)) {
            Ok(()) => debug!(plan_id = %id, "Baseline callee forwards to optimizing code"),
            Err(_) => debug!(plan_id = %id, "Baseline callee already forwards"),
        }
    }

    Ok(winner)
}
