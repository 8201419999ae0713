//! Off-thread sweeping.
//!
//! The mutator still performs marking inside a stop-the-world section, but
//! the sweep's list walk runs on a dedicated worker thread while the mutator
//! keeps allocating. The hand-off works on a half-open range of each sweep
//! list: a payload-less sentinel slot is spliced in at the head, the worker
//! partitions everything *after* it, and allocations made while the sweep is
//! in flight prepend *before* it. When the worker finishes it stitches the
//! survivor chain back onto the sentinel. Payload destruction and slot
//! recycling stay on the mutator: the worker publishes a chain of dead ids,
//! reclaimed the next time the mutator synchronizes with the worker.
//!
//! Safety contract: while the worker state is `Sweeping`, headers of objects
//! at or after a sentinel belong to the worker and the mutator must not touch
//! them. The mutator only prepends to list heads and reads or writes headers
//! of objects it allocated after the hand-off, so the two sides never alias.

use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::collect;
use crate::emitter::Emitter;
use crate::fatal;
use crate::heap::{CHUNK_CAPACITY, Heap, HeapConfig, Store};
use crate::object::{AllocOptions, Header, ObjectCell, ObjectId, Trace};
use crate::roots::{Local, Scope};
use crate::stats::CycleStats;

/// Raw cell pointer the worker may dereference under the hand-off contract.
struct SendPtr(NonNull<ObjectCell>);

// Safety: the pointee is only accessed per the hand-off contract above; the
// mutator stays away from handed-off headers until the worker goes idle.
unsafe impl Send for SendPtr {}

/// One sweep list handed to the worker: the spliced sentinel and the start of
/// the half-open range to partition. Both are `None` for a list that was
/// empty at hand-off.
struct ListJob {
    sentinel: Option<ObjectId>,
    first: Option<ObjectId>,
}

struct SweepJob {
    chunk_bases: Vec<SendPtr>,
    lists: [ListJob; 2],
    /// Mark-phase counters, completed by the worker.
    stats: CycleStats,
}

struct SweepOutcome {
    /// Per-list chains of dead ids, linked through their headers.
    dead: [Option<ObjectId>; 2],
    stats: CycleStats,
}

enum WorkerState {
    Idle,
    CycleRequested(SweepJob),
    Sweeping,
    ShutdownRequested,
}

struct State {
    worker: WorkerState,
    outcome: Option<SweepOutcome>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// A heap whose sweep phase runs on a background thread.
///
/// Handles and scopes stay single-threaded; only the list partitioning moves
/// off-thread. Explicit cycles go through [`ConcurrentHeap::request_cycle`];
/// never run a synchronous cycle on the wrapped heap while this wrapper is
/// alive.
pub struct ConcurrentHeap {
    heap: Heap,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Default for ConcurrentHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentHeap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let heap = Heap::with_config(config);
        // The allocation interval is rerouted through request_cycle.
        heap.core.borrow_mut().auto_trigger = false;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                worker: WorkerState::Idle,
                outcome: None,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let worker = match std::thread::Builder::new()
            .name("scopegc-sweep".into())
            .spawn(move || worker_loop(&thread_shared))
        {
            Ok(handle) => handle,
            Err(_) => fatal("failed to spawn the sweep thread"),
        };
        Self {
            heap,
            shared,
            worker: Some(worker),
        }
    }

    /// The wrapped heap, for handle operations like
    /// [`Heap::root_member`]. Do not call [`Heap::collect`] through it.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn scope(&self) -> Scope {
        self.heap.scope()
    }

    pub fn alloc<T: Trace>(&self, value: T) -> Local<T> {
        self.maybe_request_cycle();
        self.heap.alloc(value)
    }

    pub fn alloc_atomic<T: Trace>(&self, value: T) -> Local<T> {
        self.maybe_request_cycle();
        self.heap.alloc_atomic(value)
    }

    pub fn alloc_with_options<T: Trace>(&self, options: AllocOptions, value: T) -> Local<T> {
        self.maybe_request_cycle();
        self.heap.alloc_with_options(options, value)
    }

    pub fn set_emitter(&self, emitter: Box<dyn Emitter>) {
        self.heap.set_emitter(emitter);
    }

    /// Statistics of the most recently *completed* cycle. A cycle whose sweep
    /// is still in flight is not visible here until the next synchronization.
    pub fn last_stats(&self) -> CycleStats {
        self.heap.last_stats()
    }

    /// Start a cycle: apply any finished sweep, mark on this thread, then
    /// hand the sweep to the worker and return without waiting for it. Blocks
    /// only if a previous sweep is still running.
    pub fn request_cycle(&self) {
        let mut state = self.shared.state.lock();
        while !matches!(state.worker, WorkerState::Idle) {
            self.shared.cond.wait(&mut state);
        }
        self.apply_outcome(&mut state);
        self.start_cycle(&mut state);
    }

    /// Block until the worker is idle and its outcome has been applied.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !matches!(state.worker, WorkerState::Idle) {
            self.shared.cond.wait(&mut state);
        }
        self.apply_outcome(&mut state);
    }

    /// Allocation-interval trigger: request a cycle only if the worker is
    /// idle; with a sweep already in flight the interval check retries on a
    /// later allocation.
    fn maybe_request_cycle(&self) {
        let due = {
            let core = self.heap.core.borrow();
            core.config.gc_interval_bytes != 0
                && core.bytes_since_gc >= core.config.gc_interval_bytes
        };
        if !due {
            return;
        }
        let mut state = self.shared.state.lock();
        if matches!(state.worker, WorkerState::Idle) {
            self.apply_outcome(&mut state);
            self.start_cycle(&mut state);
        }
    }

    /// Stop-the-world section: mark, splice sentinels, snapshot chunk bases,
    /// hand off. Caller holds the state lock with the worker idle and any
    /// previous outcome already applied.
    fn start_cycle(&self, state: &mut State) {
        let mut emitter = self.heap.core.borrow_mut().emitter.take();
        if let Some(e) = emitter.as_deref_mut() {
            e.cycle_start();
            e.mark_start();
        }

        let mut stats = CycleStats::default();
        let job = {
            let mut core = self.heap.core.borrow_mut();
            let core = &mut *core;
            collect::seed_and_mark(core, &mut stats);

            let lists = [
                splice_sentinel(&mut core.store, &mut core.drop_head, AllocOptions::default()),
                splice_sentinel(&mut core.store, &mut core.skip_head, AllocOptions::skip_drop()),
            ];
            core.bytes_since_gc = 0;
            SweepJob {
                chunk_bases: core.store.chunk_bases().into_iter().map(SendPtr).collect(),
                lists,
                stats,
            }
        };

        if let Some(e) = emitter.as_deref_mut() {
            e.mark_end();
            e.sweep_start();
        }
        self.heap.core.borrow_mut().emitter = emitter;

        state.worker = WorkerState::CycleRequested(job);
        self.shared.cond.notify_all();
    }

    /// Reclaim the dead chains of a finished sweep and publish its
    /// statistics. The deferred sweep_end/cycle_end hooks fire here, on the
    /// mutator.
    fn apply_outcome(&self, state: &mut State) {
        let Some(outcome) = state.outcome.take() else {
            return;
        };
        {
            let mut core = self.heap.core.borrow_mut();
            let core = &mut *core;
            for head in outcome.dead {
                let mut cursor = head;
                while let Some(id) = cursor {
                    cursor = core.store.cell(id).header.next();
                    collect::reclaim_cell(core, id);
                }
            }
            core.last_stats = outcome.stats;
        }
        let mut emitter = self.heap.core.borrow_mut().emitter.take();
        if let Some(e) = emitter.as_deref_mut() {
            e.sweep_end();
            e.cycle_end(&outcome.stats);
        }
        self.heap.core.borrow_mut().emitter = emitter;
    }
}

impl Drop for ConcurrentHeap {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            while !matches!(state.worker, WorkerState::Idle) {
                self.shared.cond.wait(&mut state);
            }
            self.apply_outcome(&mut state);
            state.worker = WorkerState::ShutdownRequested;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Splice a payload-less sentinel at the list head so in-flight allocations
/// and the sweep range cannot collide. The sentinel stays unmarked; the next
/// cycle reclaims it as a husk.
fn splice_sentinel(
    store: &mut Store,
    head: &mut Option<ObjectId>,
    options: AllocOptions,
) -> ListJob {
    let first = *head;
    if first.is_none() {
        return ListJob {
            sentinel: None,
            first: None,
        };
    }
    let sentinel = store.reserve(options);
    store.cell(sentinel).header.set_next(first);
    *head = Some(sentinel);
    ListJob {
        sentinel: Some(sentinel),
        first,
    }
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if matches!(state.worker, WorkerState::ShutdownRequested) {
            return;
        }
        if matches!(state.worker, WorkerState::CycleRequested(_)) {
            if let WorkerState::CycleRequested(job) =
                std::mem::replace(&mut state.worker, WorkerState::Sweeping)
            {
                let outcome = MutexGuard::unlocked(&mut state, || run_sweep(&job));
                state.outcome = Some(outcome);
                state.worker = WorkerState::Idle;
                shared.cond.notify_all();
            }
            continue;
        }
        shared.cond.wait(&mut state);
    }
}

/// Partition both handed-off ranges. Headers only: survivors are unmarked and
/// relinked behind their sentinel, the dead are chained for the mutator to
/// reclaim.
fn run_sweep(job: &SweepJob) -> SweepOutcome {
    let mut stats = job.stats;
    let mut dead = [None, None];
    for (list, dead_head) in job.lists.iter().zip(dead.iter_mut()) {
        let mut live_head: Option<ObjectId> = None;
        let mut last_kept: Option<ObjectId> = None;
        let mut cursor = list.first;
        while let Some(id) = cursor {
            let header = resolve(&job.chunk_bases, id);
            cursor = header.next();
            if header.marked() {
                header.set_marked(false);
                header.set_next(None);
                match last_kept {
                    Some(prev) => resolve(&job.chunk_bases, prev).set_next(Some(id)),
                    None => live_head = Some(id),
                }
                last_kept = Some(id);
                stats.retained += 1;
            } else {
                header.set_next(*dead_head);
                *dead_head = Some(id);
                stats.collected += 1;
            }
        }
        if let Some(sentinel) = list.sentinel {
            resolve(&job.chunk_bases, sentinel).set_next(live_head);
        }
    }
    SweepOutcome { dead, stats }
}

fn resolve(bases: &[SendPtr], id: ObjectId) -> &Header {
    match bases.get(id.0 / CHUNK_CAPACITY) {
        // Safety: chunk cells never move, the snapshot covers every id in the
        // handed-off ranges, and the mutator leaves these headers alone until
        // the worker reports idle.
        Some(base) => unsafe { &base.0.add(id.0 % CHUNK_CAPACITY).as_ref().header },
        None => fatal("sweep job referenced an id outside the chunk snapshot"),
    }
}
