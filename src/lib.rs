//! Embeddable, precise, non-moving garbage collector
//!
//! Objects live in a per-heap arena and never move. Liveness is structural:
//! a scope roots the local handles acquired inside it, member handles inside
//! objects carry reachability between objects, and explicit [`Root`]s pin
//! objects across scopes. Collection is cooperative mark-and-sweep, run
//! either on request or automatically after a configurable volume of
//! allocation.
//!
//! # Example
//!
//! ```
//! use scopegc::{Heap, Local, Member, Trace, Tracer};
//!
//! struct Node {
//!     label: &'static str,
//!     next: Member<Node>,
//! }
//!
//! impl Trace for Node {
//!     fn trace(&self, tracer: &mut Tracer<'_>) {
//!         tracer.mark(&self.next);
//!     }
//! }
//!
//! let heap = Heap::new();
//! let _scope = heap.scope();
//! let head: Local<Node> = heap.alloc(Node { label: "head", next: Member::new() });
//! let tail = heap.alloc(Node { label: "tail", next: Member::new() });
//! head.borrow().next.assign(&tail);
//! tail.clear();
//!
//! heap.collect();
//! // tail is only reachable through head now, and still alive.
//! let tail = heap.root_member(&head.borrow().next).unwrap();
//! assert_eq!(tail.borrow().label, "tail");
//! ```

mod collect;
mod emitter;
mod heap;
mod object;
mod roots;
mod stack;
mod stats;

#[cfg(feature = "concurrent")]
mod concurrent;

pub use collect::Tracer;
pub use emitter::{Emitter, NullEmitter};
pub use heap::{Heap, HeapConfig, HeapContext};
pub use object::{AllocOptions, ObjectId, Trace};
pub use roots::{Local, Member, Root, Scope};
pub use stats::CycleStats;

#[cfg(feature = "concurrent")]
pub use concurrent::ConcurrentHeap;

#[cfg(feature = "emitter-log")]
pub use emitter::LogEmitter;

/// Contract violations (unbalanced scopes, stale handles, ids out of bounds)
/// are programming errors, not recoverable conditions.
#[allow(clippy::panic)]
pub(crate) fn fatal(msg: &str) -> ! {
    panic!("scopegc: {msg}");
}
