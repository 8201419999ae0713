//! The heap: arena storage, the allocator, and the "current heap" context.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::collect;
use crate::emitter::Emitter;
use crate::fatal;
use crate::object::{AllocOptions, Header, ObjectCell, ObjectId, Trace};
use crate::roots::{Local, RootSet, Scope};
use crate::stack::{ChunkedStack, StackMark};
use crate::stats::CycleStats;

/// Objects per arena chunk. Chunks are allocated at full capacity and never
/// reallocate, so cell addresses stay stable for the heap's lifetime.
pub(crate) const CHUNK_CAPACITY: usize = 256;

/// Heap construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Bytes allocated between automatic collection cycles. `0` disables the
    /// auto-trigger; cycles then only run on explicit request.
    pub gc_interval_bytes: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            gc_interval_bytes: 8 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Store - the chunked cell arena
// ============================================================================

pub(crate) struct Store {
    chunks: Vec<Vec<ObjectCell>>,
    free: Vec<ObjectId>,
}

impl Store {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn cell(&self, id: ObjectId) -> &ObjectCell {
        match self
            .chunks
            .get(id.0 / CHUNK_CAPACITY)
            .and_then(|chunk| chunk.get(id.0 % CHUNK_CAPACITY))
        {
            Some(cell) => cell,
            None => fatal("object id out of arena bounds"),
        }
    }

    /// Take a slot for a new allocation: recycle from the free list or grow
    /// the arena. The payload is installed by the caller once construction
    /// finishes.
    pub(crate) fn reserve(&mut self, options: AllocOptions) -> ObjectId {
        if let Some(id) = self.free.pop() {
            match self
                .chunks
                .get_mut(id.0 / CHUNK_CAPACITY)
                .and_then(|chunk| chunk.get_mut(id.0 % CHUNK_CAPACITY))
            {
                Some(cell) => cell.header.reset(options),
                None => fatal("free list held an id out of arena bounds"),
            }
            return id;
        }

        let needs_chunk = self
            .chunks
            .last()
            .is_none_or(|chunk| chunk.len() == CHUNK_CAPACITY);
        if needs_chunk {
            self.chunks.push(Vec::with_capacity(CHUNK_CAPACITY));
        }
        let chunk_index = self.chunks.len().saturating_sub(1);
        match self.chunks.last_mut() {
            Some(chunk) => {
                let id = ObjectId(chunk_index * CHUNK_CAPACITY + chunk.len());
                chunk.push(ObjectCell::new(Header::new(options)));
                id
            }
            None => fatal("arena lost its chunk during reserve"),
        }
    }

    /// Return a reclaimed slot to the free list. The payload must already be
    /// gone.
    pub(crate) fn release(&mut self, id: ObjectId) {
        self.free.push(id);
    }

    /// Base cell of every chunk, for the concurrent sweeper's index
    /// resolution. Snapshot taken inside the stop-the-world section.
    #[cfg(feature = "concurrent")]
    pub(crate) fn chunk_bases(&self) -> Vec<std::ptr::NonNull<ObjectCell>> {
        self.chunks
            .iter()
            .map(|chunk| match chunk.first() {
                Some(cell) => std::ptr::NonNull::from(cell),
                None => fatal("arena contains an empty chunk"),
            })
            .collect()
    }
}

// ============================================================================
// HeapCore - all per-heap state, behind one RefCell
// ============================================================================

/// One root-stack slot: the rooted object (or null) plus the epoch stamped
/// when the slot was pushed. A handle presents its slot's epoch on every
/// access; a mismatch means the slot was rewound and reused since the handle
/// was created.
pub(crate) struct RootSlot {
    pub(crate) value: Option<ObjectId>,
    pub(crate) epoch: u64,
}

pub(crate) struct HeapCore {
    pub(crate) store: Store,
    /// Local-handle slots across all active scopes, innermost on top.
    pub(crate) root_stack: ChunkedStack<RootSlot>,
    /// Transient per-cycle mark worklist; empty between cycles.
    pub(crate) worklist: ChunkedStack<ObjectId>,
    /// Root-stack heights of the active scopes, for defensive LIFO checks.
    pub(crate) scopes: Vec<StackMark>,
    pub(crate) roots: RootSet,
    /// Head of the intrusive list of objects whose destructor runs at sweep.
    pub(crate) drop_head: Option<ObjectId>,
    /// Head of the intrusive list of objects swept without a destructor call.
    pub(crate) skip_head: Option<ObjectId>,
    pub(crate) bytes_since_gc: usize,
    /// Source of root-slot epochs; bumped on every push.
    slot_epoch: u64,
    pub(crate) config: HeapConfig,
    pub(crate) emitter: Option<Box<dyn Emitter>>,
    pub(crate) last_stats: CycleStats,
    /// Cleared when a ConcurrentHeap reroutes the auto-trigger through
    /// itself.
    pub(crate) auto_trigger: bool,
}

impl HeapCore {
    fn new(config: HeapConfig) -> Self {
        Self {
            store: Store::new(),
            root_stack: ChunkedStack::new(),
            worklist: ChunkedStack::new(),
            scopes: Vec::new(),
            roots: RootSet::new(),
            drop_head: None,
            skip_head: None,
            bytes_since_gc: 0,
            slot_epoch: 0,
            config,
            emitter: None,
            last_stats: CycleStats::default(),
            auto_trigger: true,
        }
    }

    /// Push a root-stack slot with a fresh epoch; returns the slot index and
    /// the epoch a handle must present to use it.
    pub(crate) fn push_root(&mut self, value: Option<ObjectId>) -> (usize, u64) {
        self.slot_epoch += 1;
        self.root_stack.push(RootSlot {
            value,
            epoch: self.slot_epoch,
        });
        (self.root_stack.len() - 1, self.slot_epoch)
    }

    /// Link a reserved slot into the sweep list selected by its header.
    fn link(&mut self, id: ObjectId) {
        let head = if self.store.cell(id).header.runs_drop() {
            &mut self.drop_head
        } else {
            &mut self.skip_head
        };
        let old_head = head.take();
        *head = Some(id);
        self.store.cell(id).header.set_next(old_head);
    }

    pub(crate) fn auto_trigger_due(&self) -> bool {
        self.auto_trigger
            && self.config.gc_interval_bytes != 0
            && self.bytes_since_gc >= self.config.gc_interval_bytes
    }
}

impl Drop for HeapCore {
    fn drop(&mut self) {
        // The skip-destructor contract holds at teardown too: discard those
        // payloads before the arena drops the remaining objects normally.
        let mut cursor = self.skip_head.take();
        while let Some(id) = cursor {
            let cell = self.store.cell(id);
            cursor = cell.header.next();
            let boxed = cell.payload.borrow_mut().take();
            if let Some(boxed) = boxed {
                collect::release_without_drop(boxed);
            }
        }
    }
}

// ============================================================================
// Heap - the public handle
// ============================================================================

/// An independent garbage-collected heap. `Heap` is a cheap handle; clones
/// refer to the same heap.
pub struct Heap {
    pub(crate) core: Rc<RefCell<HeapCore>>,
}

impl Clone for Heap {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            core: Rc::new(RefCell::new(HeapCore::new(config))),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<HeapCore>> {
        Rc::downgrade(&self.core)
    }

    /// Open a scope: local handles acquired until the returned guard drops
    /// are unrooted together when it does.
    pub fn scope(&self) -> Scope {
        Scope::enter(self)
    }

    /// Allocate a traceable object rooted in the innermost open scope.
    pub fn alloc<T: Trace>(&self, value: T) -> Local<T> {
        self.alloc_with_options(AllocOptions::default(), value)
    }

    /// Allocate a leaf object: it is kept alive like any other, but the mark
    /// phase never invokes its `trace`.
    pub fn alloc_atomic<T: Trace>(&self, value: T) -> Local<T> {
        self.alloc_with_options(AllocOptions::atomic(), value)
    }

    pub fn alloc_with_options<T: Trace>(&self, options: AllocOptions, value: T) -> Local<T> {
        match self.try_alloc_with(options, |_| Ok::<T, std::convert::Infallible>(value)) {
            Ok(local) => local,
            Err(never) => match never {},
        }
    }

    /// Allocate with a fallible initializer. The slot is linked into the heap
    /// and rooted on the stack *before* `init` runs, so a cycle triggered
    /// from inside the initializer (directly or by a nested allocation)
    /// cannot reclaim the object under construction. If `init` fails, the
    /// already-linked slot is left payload-less; the next sweep that finds it
    /// unreachable reclaims it as a no-op, never running `T`'s destructor.
    pub fn try_alloc_with<T, E, F>(&self, options: AllocOptions, init: F) -> Result<Local<T>, E>
    where
        T: Trace,
        F: FnOnce(&Heap) -> Result<T, E>,
    {
        let due = {
            let mut core = self.core.borrow_mut();
            core.bytes_since_gc = core.bytes_since_gc.saturating_add(size_of::<T>());
            core.auto_trigger_due()
        };
        if due {
            self.collect();
        }

        let (slot, epoch) = {
            let mut core = self.core.borrow_mut();
            if core.scopes.is_empty() {
                fatal("allocation requires an open scope");
            }
            let id = core.store.reserve(options);
            core.link(id);
            core.push_root(Some(id))
        };

        // No borrow is held here: the initializer may allocate or trigger a
        // cycle. The object under construction survives via its stack slot.
        let value = init(self)?;

        {
            let core = self.core.borrow();
            let id = match core.root_stack.get(slot).and_then(|s| s.value) {
                Some(id) => id,
                None => fatal("allocation slot vanished during construction"),
            };
            *core.store.cell(id).payload.borrow_mut() = Some(Box::new(value));
        }
        Ok(Local::from_slot(self.downgrade(), slot, epoch))
    }

    /// Run a full mark-and-sweep cycle synchronously.
    pub fn collect(&self) {
        let mut emitter = self.core.borrow_mut().emitter.take();
        let stats = collect::run_cycle(&self.core, emitter.as_deref_mut());
        let mut core = self.core.borrow_mut();
        core.emitter = emitter;
        core.last_stats = stats;
        core.bytes_since_gc = 0;
    }

    /// Install a phase observer. Replaces any previous emitter.
    pub fn set_emitter(&self, emitter: Box<dyn Emitter>) {
        self.core.borrow_mut().emitter = Some(emitter);
    }

    /// Statistics of the most recently completed cycle.
    pub fn last_stats(&self) -> CycleStats {
        self.core.borrow().last_stats
    }

    /// Make this heap the thread's current heap for the guard's lifetime.
    /// Nestable; the previous current heap is restored when the guard drops.
    pub fn enter(&self) -> HeapContext {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        HeapContext {
            expected: Rc::as_ptr(&self.core),
        }
    }

    /// The innermost entered heap on this thread.
    pub fn current() -> Heap {
        CURRENT.with(|stack| match stack.borrow().last() {
            Some(heap) => heap.clone(),
            None => fatal("no current heap on this thread"),
        })
    }

    pub(crate) fn ptr_eq_weak(&self, other: &Weak<RefCell<HeapCore>>) -> bool {
        std::ptr::eq(Rc::as_ptr(&self.core), other.as_ptr())
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<Heap>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard returned by [`Heap::enter`].
pub struct HeapContext {
    expected: *const RefCell<HeapCore>,
}

impl Drop for HeapContext {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.pop() {
                Some(top) if Rc::as_ptr(&top.core) == self.expected => {}
                _ => fatal("heap context released out of nesting order"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::Tracer;

    struct Plain(#[allow(dead_code)] u64);

    impl Trace for Plain {
        fn trace(&self, _tracer: &mut Tracer<'_>) {}
    }

    #[test]
    fn current_heap_nesting() {
        let a = Heap::new();
        let b = Heap::new();
        let outer = a.enter();
        assert!(Heap::current().core.as_ptr() == a.core.as_ptr());
        {
            let _inner = b.enter();
            assert!(Heap::current().core.as_ptr() == b.core.as_ptr());
        }
        assert!(Heap::current().core.as_ptr() == a.core.as_ptr());
        drop(outer);
    }

    #[test]
    fn auto_trigger_interval() {
        let heap = Heap::with_config(HeapConfig {
            gc_interval_bytes: size_of::<Plain>() * 8,
        });
        let scope = heap.scope();
        for i in 0..7 {
            heap.alloc(Plain(i));
        }
        // Interval not yet crossed: no cycle has run.
        assert_eq!(heap.last_stats(), CycleStats::default());
        for i in 0..4 {
            heap.alloc(Plain(i));
        }
        // The crossing allocation ran a cycle; everything was rooted.
        assert_eq!(heap.last_stats().collected, 0);
        assert!(heap.last_stats().retained >= 7);
        drop(scope);
    }

    #[test]
    fn zero_interval_disables_auto_trigger() {
        let heap = Heap::with_config(HeapConfig {
            gc_interval_bytes: 0,
        });
        let scope = heap.scope();
        for i in 0..100 {
            heap.alloc(Plain(i));
        }
        assert_eq!(heap.last_stats(), CycleStats::default());
        drop(scope);
    }
}
