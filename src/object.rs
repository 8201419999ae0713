//! Per-object bookkeeping: ids, headers, and the trace seam.
//!
//! Every collectible object lives in one arena slot and carries a small
//! header: the index of the next object in whichever intrusive list currently
//! holds it, the transient mark flag, and two flags fixed at allocation time
//! (whether the object has traceable members, and whether sweep runs its
//! destructor). Links are arena indices, not addresses, so no pointer tagging
//! or alignment tricks are involved.

use std::any::Any;
use std::cell::{Cell, RefCell};

use crate::collect::Tracer;

/// Index of an object's slot in the heap arena. Stable for the object's whole
/// lifetime; slots of collected objects are recycled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjectId(pub(crate) usize);

/// How an allocation participates in tracing and sweeping.
#[derive(Clone, Copy, Debug)]
pub struct AllocOptions {
    /// Objects with no outgoing edges ("atomic") are flag-marked but never
    /// pushed onto the mark worklist and never have `trace` invoked.
    pub traceable: bool,
    /// When false, sweep releases the payload's storage without running its
    /// destructor. For trivially-droppable payloads only.
    pub run_drop: bool,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            traceable: true,
            run_drop: true,
        }
    }
}

impl AllocOptions {
    pub fn atomic() -> Self {
        Self {
            traceable: false,
            ..Self::default()
        }
    }

    pub fn skip_drop() -> Self {
        Self {
            run_drop: false,
            ..Self::default()
        }
    }
}

pub(crate) struct Header {
    next: Cell<Option<ObjectId>>,
    marked: Cell<bool>,
    /// Immutable after allocation.
    traceable: bool,
    /// Immutable after allocation; selects the sweep list.
    run_drop: bool,
}

impl Header {
    pub(crate) fn new(options: AllocOptions) -> Self {
        Self {
            next: Cell::new(None),
            marked: Cell::new(false),
            traceable: options.traceable,
            run_drop: options.run_drop,
        }
    }

    pub(crate) fn next(&self) -> Option<ObjectId> {
        self.next.get()
    }

    pub(crate) fn set_next(&self, next: Option<ObjectId>) {
        self.next.set(next);
    }

    pub(crate) fn marked(&self) -> bool {
        self.marked.get()
    }

    pub(crate) fn set_marked(&self, marked: bool) {
        self.marked.set(marked);
    }

    pub(crate) fn traceable(&self) -> bool {
        self.traceable
    }

    pub(crate) fn runs_drop(&self) -> bool {
        self.run_drop
    }

    /// Reinitialize a recycled slot's header for a fresh allocation.
    pub(crate) fn reset(&mut self, options: AllocOptions) {
        self.next = Cell::new(None);
        self.marked = Cell::new(false);
        self.traceable = options.traceable;
        self.run_drop = options.run_drop;
    }
}

/// One arena slot: header plus the payload. The payload is absent while the
/// initializer is still running (or failed), for recycled slots, and for the
/// sentinel slots the concurrent sweep splices in; such husks trace nothing
/// and tear down as a no-op.
pub(crate) struct ObjectCell {
    pub(crate) header: Header,
    pub(crate) payload: RefCell<Option<Box<dyn HeapObject>>>,
}

impl ObjectCell {
    pub(crate) fn new(header: Header) -> Self {
        Self {
            header,
            payload: RefCell::new(None),
        }
    }
}

/// Implemented by every collectible type: report each outgoing member-handle
/// edge to the tracer. Leaf types write an empty body; allocating them with
/// [`AllocOptions::atomic`] additionally skips the call entirely.
pub trait Trace: 'static {
    fn trace(&self, tracer: &mut Tracer<'_>);
}

/// Object-erased view the collector works with. Blanket-implemented for every
/// `Trace` type; the `Any` plumbing backs the typed handle accessors.
pub(crate) trait HeapObject: Any {
    fn trace_object(&self, tracer: &mut Tracer<'_>);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Trace> HeapObject for T {
    fn trace_object(&self, tracer: &mut Tracer<'_>) {
        self.trace(tracer);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
