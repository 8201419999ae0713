//! Reachability through locals, members, and closed scopes.

use scopegc::{Heap, Member, Trace, Tracer};

struct Node {
    label: &'static str,
    next: Member<Node>,
}

impl Node {
    fn new(label: &'static str) -> Self {
        Self {
            label,
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
#[allow(clippy::expect_used)]
fn member_edges_and_scope_close() {
    let heap = Heap::new();
    let _outer = heap.scope();

    let a = {
        let mut inner = heap.scope();
        let a = heap.alloc(Node::new("a"));
        let _b = heap.alloc(Node::new("b"));
        let _c = heap.alloc(Node::new("c"));
        let d = heap.alloc(Node::new("d"));
        a.borrow().next.assign(&d);
        inner.close(a)
    };

    // b and c lost their roots when the inner scope exited; d hangs off a.
    heap.collect();
    assert_eq!(heap.last_stats().collected, 2);
    assert_eq!(heap.last_stats().retained, 2);
    assert_eq!(a.borrow().label, "a");
    let d = heap.root_member(&a.borrow().next).expect("edge to d");
    assert_eq!(d.borrow().label, "d");
    d.clear();

    // Severing the member edge orphans d.
    a.borrow().next.clear();
    heap.collect();
    assert_eq!(heap.last_stats().collected, 1);

    // Clearing the last local orphans a.
    a.clear();
    heap.collect();
    assert_eq!(heap.last_stats().collected, 1);
    assert_eq!(heap.last_stats().retained, 0);
}

#[test]
fn long_chain_marks_without_recursion() {
    let heap = Heap::new();
    let _scope = heap.scope();

    // Deep singly-linked chain; a recursive marker would blow the thread
    // stack long before this.
    let head = heap.alloc(Node::new("head"));
    let tail = head.clone();
    for _ in 0..200_000 {
        let next = heap.alloc(Node::new("link"));
        tail.borrow().next.assign(&next);
        tail.set(&next);
        next.clear();
    }
    tail.clear();

    heap.collect();
    assert_eq!(heap.last_stats().collected, 0);
    assert_eq!(heap.last_stats().retained, 200_001);

    head.borrow().next.clear();
    head.clear();
    heap.collect();
    assert_eq!(heap.last_stats().collected, 200_001);
}

#[test]
#[allow(clippy::expect_used)]
fn member_copy_between_objects() {
    let heap = Heap::new();
    let _scope = heap.scope();
    let a = heap.alloc(Node::new("a"));
    let b = heap.alloc(Node::new("b"));
    let target = heap.alloc(Node::new("target"));
    a.borrow().next.assign(&target);
    b.borrow().next.assign_from(&a.borrow().next);
    target.clear();
    a.borrow().next.clear();

    // The copied edge alone keeps the target alive.
    heap.collect();
    assert_eq!(heap.last_stats().collected, 0);
    let via_b = heap.root_member(&b.borrow().next).expect("edge from b");
    assert_eq!(via_b.borrow().label, "target");
}

#[test]
#[allow(clippy::expect_used)]
fn atomic_leaf_is_kept_without_tracing() {
    struct Blob {
        bytes: [u8; 64],
    }

    impl Trace for Blob {
        fn trace(&self, _tracer: &mut Tracer<'_>) {
            #[allow(clippy::panic)]
            {
                panic!("trace invoked on an atomic object");
            }
        }
    }

    struct Holder {
        blob: Member<Blob>,
    }

    impl Trace for Holder {
        fn trace(&self, tracer: &mut Tracer<'_>) {
            tracer.mark(&self.blob);
        }
    }

    let heap = Heap::new();
    let _scope = heap.scope();
    let holder = heap.alloc(Holder {
        blob: Member::new(),
    });
    let blob = heap.alloc_atomic(Blob { bytes: [7; 64] });
    holder.borrow().blob.assign(&blob);
    blob.clear();

    // Reached through the member edge, flag-marked, never traced.
    heap.collect();
    assert_eq!(heap.last_stats().retained, 2);
    assert_eq!(heap.last_stats().collected, 0);
    let blob = heap.root_member(&holder.borrow().blob).expect("blob edge");
    assert_eq!(blob.borrow().bytes, [7; 64]);
}
