//! The mark-and-sweep cycle.
//!
//! Marking is worklist-driven, never recursive: roots are flag-marked and
//! pushed, then the worklist is drained, tracing each object exactly once.
//! Sweeping walks the two intrusive lists, relinking survivors in place and
//! reclaiming the rest. Objects allocated while marking runs (from inside an
//! initializer) are linked at the list heads already marked via their stack
//! slot, so a cycle observed mid-construction never eats the new object.

use std::cell::RefCell;
use std::rc::Rc;

use crate::emitter::Emitter;
use crate::fatal;
use crate::heap::{HeapCore, Store};
use crate::object::{HeapObject, ObjectId, Trace};
use crate::roots::Member;
use crate::stack::ChunkedStack;
use crate::stats::CycleStats;

/// Handed to [`Trace::trace`] implementations; report each member edge with
/// [`Tracer::mark`].
pub struct Tracer<'a> {
    store: &'a Store,
    worklist: &'a mut ChunkedStack<ObjectId>,
}

impl Tracer<'_> {
    pub fn mark<T: Trace>(&mut self, member: &Member<T>) {
        if let Some(id) = member.target() {
            mark_one(self.store, self.worklist, id);
        }
    }
}

/// Flag an object and, if it has traceable members, queue it. Already-marked
/// objects are skipped, which is what terminates marking on cyclic graphs.
fn mark_one(store: &Store, worklist: &mut ChunkedStack<ObjectId>, id: ObjectId) {
    let header = &store.cell(id).header;
    if header.marked() {
        return;
    }
    header.set_marked(true);
    if header.traceable() {
        worklist.push(id);
    }
}

/// Seed the worklist from the root stack and the global-root registry, then
/// drain it. On return every reachable object is marked and the worklist is
/// empty again.
pub(crate) fn seed_and_mark(core: &mut HeapCore, stats: &mut CycleStats) {
    if !core.worklist.is_empty() {
        fatal("mark worklist not empty at cycle start");
    }

    let HeapCore {
        store,
        root_stack,
        worklist,
        roots,
        ..
    } = core;

    for slot in root_stack.iter().rev() {
        if let Some(id) = slot.value {
            stats.on_stack += 1;
            mark_one(store, worklist, id);
        }
    }
    for id in roots.iter() {
        mark_one(store, worklist, id);
    }

    while let Some(id) = worklist.pop() {
        stats.traced += 1;
        let payload = store.cell(id).payload.borrow();
        if let Some(object) = payload.as_deref() {
            let mut tracer = Tracer {
                store: &*store,
                worklist: &mut *worklist,
            };
            object.trace_object(&mut tracer);
        }
    }
}

/// Partition one sweep list: survivors are unmarked and relinked in their
/// original order, dead ids are appended to `dead` for reclamation.
pub(crate) fn sweep_list(
    store: &Store,
    head: &mut Option<ObjectId>,
    dead: &mut Vec<ObjectId>,
    stats: &mut CycleStats,
) {
    let mut cursor = head.take();
    let mut last_kept: Option<ObjectId> = None;
    while let Some(id) = cursor {
        let header = &store.cell(id).header;
        cursor = header.next();
        if header.marked() {
            header.set_marked(false);
            header.set_next(None);
            match last_kept {
                Some(prev) => store.cell(prev).header.set_next(Some(id)),
                None => *head = Some(id),
            }
            last_kept = Some(id);
            stats.retained += 1;
        } else {
            dead.push(id);
            stats.collected += 1;
        }
    }
}

/// Tear down one dead object: drop or discard the payload per its header,
/// then recycle the slot. Payload-less husks (failed initializers, recycled
/// sentinels) tear down as a no-op.
pub(crate) fn reclaim_cell(core: &mut HeapCore, id: ObjectId) {
    let boxed = core.store.cell(id).payload.borrow_mut().take();
    if let Some(boxed) = boxed {
        if core.store.cell(id).header.runs_drop() {
            drop(boxed);
        } else {
            release_without_drop(boxed);
        }
    }
    core.store.release(id);
}

/// Free the payload's storage without running its destructor.
pub(crate) fn release_without_drop(boxed: Box<dyn HeapObject>) {
    let raw = Box::into_raw(boxed);
    // Safety: the box was leaked just above and is never touched again; only
    // its storage is returned to the allocator.
    unsafe {
        let layout = std::alloc::Layout::for_value(&*raw);
        if layout.size() != 0 {
            std::alloc::dealloc(raw.cast::<u8>(), layout);
        }
    }
}

/// One full synchronous cycle over `core`. The emitter (if any) sees the
/// phase transitions in order; the heap borrow is held for the whole cycle,
/// so destructors must not call back into the heap.
pub(crate) fn run_cycle(
    core: &Rc<RefCell<HeapCore>>,
    mut emitter: Option<&mut (dyn Emitter + 'static)>,
) -> CycleStats {
    if let Some(e) = emitter.as_deref_mut() {
        e.cycle_start();
    }
    let mut stats = CycleStats::default();
    {
        let mut core = core.borrow_mut();
        let core = &mut *core;

        if let Some(e) = emitter.as_deref_mut() {
            e.mark_start();
        }
        seed_and_mark(core, &mut stats);
        if let Some(e) = emitter.as_deref_mut() {
            e.mark_end();
        }

        if let Some(e) = emitter.as_deref_mut() {
            e.sweep_start();
        }
        let mut dead = Vec::new();
        sweep_list(&core.store, &mut core.drop_head, &mut dead, &mut stats);
        sweep_list(&core.store, &mut core.skip_head, &mut dead, &mut stats);
        for id in dead {
            reclaim_cell(core, id);
        }
        if let Some(e) = emitter.as_deref_mut() {
            e.sweep_end();
        }
    }
    if let Some(e) = emitter {
        e.cycle_end(&stats);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    struct Node {
        next: Member<Node>,
    }

    impl Node {
        fn new() -> Self {
            Self {
                next: Member::new(),
            }
        }
    }

    impl Trace for Node {
        fn trace(&self, tracer: &mut Tracer<'_>) {
            tracer.mark(&self.next);
        }
    }

    #[test]
    fn shared_target_traced_once() {
        let heap = Heap::new();
        let _scope = heap.scope();
        let a = heap.alloc(Node::new());
        let b = heap.alloc(Node::new());
        let c = heap.alloc(Node::new());
        a.borrow().next.assign(&c);
        b.borrow().next.assign(&c);
        c.clear();
        heap.collect();
        let stats = heap.last_stats();
        assert_eq!(stats.retained, 3);
        assert_eq!(stats.collected, 0);
        // c reached twice, traced once.
        assert_eq!(stats.traced, 3);
    }

    #[test]
    fn unreachable_cycle_is_collected() {
        let heap = Heap::new();
        let _scope = heap.scope();
        let a = heap.alloc(Node::new());
        let b = heap.alloc(Node::new());
        a.borrow().next.assign(&b);
        b.borrow().next.assign(&a);
        a.clear();
        b.clear();
        heap.collect();
        assert_eq!(heap.last_stats().collected, 2);
        assert_eq!(heap.last_stats().retained, 0);
    }

    #[test]
    fn atomic_objects_are_kept_but_never_traced() {
        struct Blob([u8; 32]);
        impl Trace for Blob {
            fn trace(&self, _tracer: &mut Tracer<'_>) {
                #[allow(clippy::panic)]
                {
                    panic!("trace invoked on an atomic object");
                }
            }
        }

        let heap = Heap::new();
        let _scope = heap.scope();
        let _blob = heap.alloc_atomic(Blob([0; 32]));
        heap.collect();
        let stats = heap.last_stats();
        assert_eq!(stats.on_stack, 1);
        assert_eq!(stats.traced, 0);
        assert_eq!(stats.retained, 1);
    }

    #[test]
    fn survivors_sweep_back_into_a_walkable_list() {
        let heap = Heap::new();
        let _scope = heap.scope();
        let keep = heap.alloc(Node::new());
        for _ in 0..10 {
            let dead = heap.alloc(Node::new());
            dead.clear();
        }
        heap.collect();
        assert_eq!(heap.last_stats().collected, 10);
        assert_eq!(heap.last_stats().retained, 1);
        // A second cycle walks the rebuilt list without incident.
        heap.collect();
        assert_eq!(heap.last_stats().retained, 1);
        assert_eq!(heap.last_stats().collected, 0);
        drop(keep);
    }
}
