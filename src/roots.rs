//! Scopes, local handles, member handles, and global roots.
//!
//! Liveness never comes from a handle value itself: a local handle is alive
//! because its slot is still on the root stack, a member edge because its
//! owner is reachable, a global root because its registry entry has not been
//! removed. Handles are thin indices plus a weak back reference to the heap.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use crate::fatal;
use crate::heap::{Heap, HeapCore, RootSlot};
use crate::object::{ObjectCell, ObjectId, Trace};
use crate::stack::StackMark;

/// Reserved seam for a future incremental/concurrent write barrier; every
/// handle store goes through here.
#[inline]
fn write_barrier(_old: Option<ObjectId>, _new: Option<ObjectId>) {}

// ============================================================================
// Scope
// ============================================================================

/// A lexical rooting frame. Entering snapshots the root-stack height; exiting
/// rewinds to it, unrooting every local handle acquired in between (including
/// the implicit slots pushed by allocations). Scopes must be released in
/// strict nesting order.
pub struct Scope {
    heap: Heap,
    bottom: StackMark,
    depth: usize,
}

impl Scope {
    pub(crate) fn enter(heap: &Heap) -> Scope {
        let mut core = heap.core.borrow_mut();
        let bottom = core.root_stack.preserve();
        core.scopes.push(bottom);
        Scope {
            heap: heap.clone(),
            bottom,
            depth: core.scopes.len() - 1,
        }
    }

    /// Move one local handle past the rewind point, so its value survives
    /// into the enclosing scope. Everything else rooted in this scope is
    /// unrooted immediately. Returns the relocated handle; this is how a
    /// helper returns a rooted value without the caller re-rooting it.
    pub fn close<T: Trace>(&mut self, local: Local<T>) -> Local<T> {
        if !self.heap.ptr_eq_weak(&local.core) {
            fatal("closed a local handle from a different heap");
        }
        let target = local.target();
        let mut core = self.heap.core.borrow_mut();
        if core.scopes.len() != self.depth + 1 {
            fatal("scope closed out of nesting order");
        }
        core.root_stack.restore(self.bottom);
        let (slot, epoch) = core.push_root(target);
        self.bottom = StackMark(slot + 1);
        if let Some(recorded) = core.scopes.get_mut(self.depth) {
            *recorded = self.bottom;
        }
        Local::from_slot(local.core.clone(), slot, epoch)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let trigger = {
            let mut core = self.heap.core.borrow_mut();
            if core.scopes.len() != self.depth + 1 {
                fatal("scope released out of nesting order");
            }
            core.scopes.pop();
            core.root_stack.restore(self.bottom);
            core.scopes.is_empty() && core.auto_trigger_due()
        };
        if trigger {
            self.heap.collect();
        }
    }
}

// ============================================================================
// Local - a root-stack-resident handle
// ============================================================================

/// A rooted reference living in one root-stack slot for the enclosing scope's
/// lifetime. Cloning acquires a fresh slot holding the same object; handles
/// carry no reference count.
pub struct Local<T: Trace> {
    pub(crate) core: Weak<RefCell<HeapCore>>,
    slot: usize,
    /// Epoch of the slot this handle was minted for; see [`RootSlot`].
    epoch: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Trace> Local<T> {
    pub(crate) fn from_slot(core: Weak<RefCell<HeapCore>>, slot: usize, epoch: u64) -> Self {
        Self {
            core,
            slot,
            epoch,
            _marker: PhantomData,
        }
    }

    pub(crate) fn upgrade(&self) -> Rc<RefCell<HeapCore>> {
        match self.core.upgrade() {
            Some(core) => core,
            None => fatal("local handle outlived its heap"),
        }
    }

    /// Resolve this handle's slot, checking the epoch stamp. An index that is
    /// in bounds again because the stack regrew after a rewind is still a
    /// stale handle, not the same slot.
    fn slot_in<'a>(&self, core: &'a HeapCore) -> &'a RootSlot {
        match core.root_stack.get(self.slot) {
            Some(slot) if slot.epoch == self.epoch => slot,
            _ => fatal("local handle used after its scope exited"),
        }
    }

    pub(crate) fn target(&self) -> Option<ObjectId> {
        let core = self.upgrade();
        let core = core.borrow();
        self.slot_in(&core).value
    }

    fn write(&self, value: Option<ObjectId>) {
        let core = self.upgrade();
        let mut core = core.borrow_mut();
        match core.root_stack.get_mut(self.slot) {
            Some(slot) if slot.epoch == self.epoch => {
                write_barrier(slot.value, value);
                slot.value = value;
            }
            _ => fatal("local handle used after its scope exited"),
        }
    }

    pub fn is_null(&self) -> bool {
        self.target().is_none()
    }

    /// Null out this slot; the object stays alive only if something else
    /// still roots or references it.
    pub fn clear(&self) {
        self.write(None);
    }

    /// Rebind this slot to the object `source` currently refers to.
    pub fn set(&self, source: &Local<T>) {
        self.write(source.target());
    }

    fn cell_ptr(&self) -> NonNull<ObjectCell> {
        let core = self.upgrade();
        let core = core.borrow();
        match self.slot_in(&core).value {
            Some(id) => NonNull::from(core.store.cell(id)),
            None => fatal("dereferenced a null local handle"),
        }
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        let cell = self.cell_ptr();
        // Safety: arena cells never move while the heap is alive, and this
        // handle's slot keeps the object from being reclaimed for as long as
        // the returned guard can live.
        let payload = unsafe { cell.as_ref() }.payload.borrow();
        match Ref::filter_map(payload, |p| {
            p.as_deref().and_then(|obj| obj.as_any().downcast_ref::<T>())
        }) {
            Ok(value) => value,
            Err(_) => fatal("local handle does not refer to a live object of its type"),
        }
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        let cell = self.cell_ptr();
        // Safety: as in `borrow`.
        let payload = unsafe { cell.as_ref() }.payload.borrow_mut();
        match RefMut::filter_map(payload, |p| {
            p.as_deref_mut()
                .and_then(|obj| obj.as_any_mut().downcast_mut::<T>())
        }) {
            Ok(value) => value,
            Err(_) => fatal("local handle does not refer to a live object of its type"),
        }
    }
}

impl<T: Trace> Clone for Local<T> {
    fn clone(&self) -> Self {
        let value = self.target();
        let core = self.upgrade();
        let mut core_mut = core.borrow_mut();
        let (slot, epoch) = core_mut.push_root(value);
        Local::from_slot(self.core.clone(), slot, epoch)
    }
}

// ============================================================================
// Member - an in-object edge
// ============================================================================

/// A pointer field embedded in a collectible object. The owner's `trace`
/// reports each member to the tracer; that reachability edge is the only
/// thing keeping the target alive through this handle.
pub struct Member<T: Trace> {
    target: Cell<Option<ObjectId>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Trace> Member<T> {
    pub fn new() -> Self {
        Self {
            target: Cell::new(None),
            _marker: PhantomData,
        }
    }

    pub(crate) fn target(&self) -> Option<ObjectId> {
        self.target.get()
    }

    pub fn assign(&self, local: &Local<T>) {
        let new = local.target();
        write_barrier(self.target.get(), new);
        self.target.set(new);
    }

    /// Copy the edge out of another member (both inside already-rooted
    /// objects).
    pub fn assign_from(&self, other: &Member<T>) {
        let new = other.target.get();
        write_barrier(self.target.get(), new);
        self.target.set(new);
    }

    pub fn clear(&self) {
        write_barrier(self.target.get(), None);
        self.target.set(None);
    }

    pub fn is_null(&self) -> bool {
        self.target.get().is_none()
    }
}

impl<T: Trace> Default for Member<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Root the object a member currently points at in the innermost open
    /// scope, returning a fresh local handle (or `None` for a null member).
    pub fn root_member<T: Trace>(&self, member: &Member<T>) -> Option<Local<T>> {
        let id = member.target()?;
        let mut core = self.core.borrow_mut();
        if core.scopes.is_empty() {
            fatal("rooting a member requires an open scope");
        }
        let (slot, epoch) = core.push_root(Some(id));
        Some(Local::from_slot(self.downgrade(), slot, epoch))
    }
}

// ============================================================================
// Root - a global/manual root
// ============================================================================

/// An explicitly registered root, independent of any scope. Constructing
/// inserts into the heap's root registry, dropping removes; the referenced
/// object (if any) is treated as live for every cycle in between.
pub struct Root<T: Trace> {
    core: Weak<RefCell<HeapCore>>,
    key: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Trace> Root<T> {
    pub fn new(local: &Local<T>) -> Root<T> {
        let target = local.target();
        let core = local.upgrade();
        let key = core.borrow_mut().roots.insert(target);
        Root {
            core: local.core.clone(),
            key,
            _marker: PhantomData,
        }
    }
}

impl<T: Trace> Drop for Root<T> {
    fn drop(&mut self) {
        // Heap already gone: nothing to unregister.
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().roots.remove(self.key);
        }
    }
}

/// Slab of registered global roots: stable keys, free-list reuse, every live
/// entry visited exactly once per cycle.
pub(crate) struct RootSet {
    entries: Vec<RootEntry>,
    free: Vec<usize>,
}

enum RootEntry {
    Vacant,
    Occupied(Option<ObjectId>),
}

impl RootSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: Option<ObjectId>) -> usize {
        if let Some(key) = self.free.pop() {
            match self.entries.get_mut(key) {
                Some(entry) => *entry = RootEntry::Occupied(value),
                None => fatal("root registry free list out of bounds"),
            }
            key
        } else {
            self.entries.push(RootEntry::Occupied(value));
            self.entries.len() - 1
        }
    }

    fn remove(&mut self, key: usize) {
        match self.entries.get_mut(key) {
            Some(entry @ RootEntry::Occupied(_)) => {
                *entry = RootEntry::Vacant;
                self.free.push(key);
            }
            _ => fatal("global root unregistered twice"),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ObjectId> {
        self.entries.iter().filter_map(|entry| match entry {
            RootEntry::Occupied(Some(id)) => Some(*id),
            _ => None,
        })
    }
}
