//! Per-cycle collection statistics.

/// Counters for one collection cycle, reported to the emitter at cycle end
/// and readable afterwards via `Heap::last_stats`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct CycleStats {
    /// Non-null local-handle slots visited while seeding roots.
    pub on_stack: usize,
    /// Objects popped from the worklist and traced (atomic leaves are
    /// flag-marked but never counted here).
    pub traced: usize,
    /// Objects that survived the sweep.
    pub retained: usize,
    /// Objects reclaimed by the sweep.
    pub collected: usize,
}
