//! Chunked stack used for the root stack and the mark worklist.
//!
//! A growable stack of fixed-capacity segments. Segments never reallocate, so
//! references into live slots stay stable across pushes, and rewinding to a
//! snapshot is O(segments released) rather than O(elements). One emptied
//! segment is kept as a spare to avoid allocation churn when the stack
//! oscillates around a segment boundary.

use crate::fatal;

/// Elements per segment.
const SEGMENT_CAPACITY: usize = 256;

/// Opaque cursor identifying a stack height, returned by
/// [`ChunkedStack::preserve`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct StackMark(pub(crate) usize);

impl StackMark {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

pub(crate) struct ChunkedStack<T> {
    /// All segments except the last are full; the last is never empty.
    segments: Vec<Vec<T>>,
    /// One cached segment, capacity already allocated.
    spare: Option<Vec<T>>,
    len: usize,
}

impl<T> ChunkedStack<T> {
    pub(crate) fn new() -> Self {
        Self {
            segments: Vec::new(),
            spare: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push(&mut self, value: T) {
        let needs_segment = self
            .segments
            .last()
            .is_none_or(|seg| seg.len() == SEGMENT_CAPACITY);
        if needs_segment {
            let seg = self
                .spare
                .take()
                .unwrap_or_else(|| Vec::with_capacity(SEGMENT_CAPACITY));
            self.segments.push(seg);
        }
        match self.segments.last_mut() {
            Some(seg) => seg.push(value),
            None => fatal("chunked stack lost its segment during push"),
        }
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        let seg = self.segments.last_mut()?;
        let value = seg.pop()?;
        self.len -= 1;
        if seg.is_empty() {
            if let Some(freed) = self.segments.pop() {
                if self.spare.is_none() {
                    self.spare = Some(freed);
                }
            }
        }
        Some(value)
    }

    /// Snapshot the current top.
    pub(crate) fn preserve(&self) -> StackMark {
        StackMark(self.len)
    }

    /// Rewind to a snapshot, dropping everything pushed since. Segments
    /// allocated and emptied between `preserve` and `restore` do not matter:
    /// the cursor is a logical height, not a slot address.
    pub(crate) fn restore(&mut self, mark: StackMark) {
        let target = mark.0;
        if target > self.len {
            fatal("chunked stack restored past its top");
        }
        let keep_segments = target.div_ceil(SEGMENT_CAPACITY);
        while self.segments.len() > keep_segments {
            if let Some(mut freed) = self.segments.pop() {
                if self.spare.is_none() {
                    freed.clear();
                    self.spare = Some(freed);
                }
            }
        }
        if let Some(last) = self.segments.last_mut() {
            last.truncate(target - (keep_segments - 1) * SEGMENT_CAPACITY);
        }
        self.len = target;
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.segments
            .get(index / SEGMENT_CAPACITY)?
            .get(index % SEGMENT_CAPACITY)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        self.segments
            .get_mut(index / SEGMENT_CAPACITY)?
            .get_mut(index % SEGMENT_CAPACITY)
    }

    /// Lazy bottom-to-top visit of every slot; combine with `.rev()` for the
    /// top-to-bottom order root seeding wants. Does not consume.
    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.segments.iter().flat_map(|seg| seg.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_lifo() {
        let mut stk = ChunkedStack::new();
        for i in 0..10 {
            stk.push(i);
        }
        for i in (0..10).rev() {
            assert_eq!(stk.pop(), Some(i));
        }
        assert_eq!(stk.pop(), None);
    }

    #[test]
    fn preserve_restore_exact() {
        // Torture test: push 100k values, snapshot at 50k, restore, then pop
        // everything back in exact reverse order.
        let mut stk = ChunkedStack::new();
        let mut mark = stk.preserve();
        for i in 0..100_000 {
            if i == 50_000 {
                mark = stk.preserve();
            }
            stk.push(i);
        }
        assert_eq!(stk.pop(), Some(99_999));
        stk.restore(mark);
        assert_eq!(stk.len(), 50_000);
        for i in (0..50_000).rev() {
            assert_eq!(stk.pop(), Some(i));
        }
        assert_eq!(stk.pop(), None);
        assert_eq!(stk.pop(), None);
    }

    #[test]
    fn restore_after_segment_churn() {
        let mut stk = ChunkedStack::new();
        for i in 0..100 {
            stk.push(i);
        }
        let mark = stk.preserve();
        // Grow across several segment boundaries, shrink below the mark's
        // segment, grow again, then restore.
        for i in 0..2000 {
            stk.push(i);
        }
        for _ in 0..2000 {
            stk.pop();
        }
        for i in 0..500 {
            stk.push(i);
        }
        stk.restore(mark);
        assert_eq!(stk.len(), 100);
        assert_eq!(stk.pop(), Some(99));
    }

    #[test]
    fn restore_to_empty() {
        let mut stk = ChunkedStack::new();
        let mark = stk.preserve();
        for i in 0..1000 {
            stk.push(i);
        }
        stk.restore(mark);
        assert!(stk.is_empty());
        assert_eq!(stk.pop(), None);
        stk.push(7);
        assert_eq!(stk.pop(), Some(7));
    }

    #[test]
    fn indexed_access() {
        let mut stk = ChunkedStack::new();
        for i in 0..600 {
            stk.push(i);
        }
        assert_eq!(stk.get(0), Some(&0));
        assert_eq!(stk.get(599), Some(&599));
        assert_eq!(stk.get(600), None);
        if let Some(slot) = stk.get_mut(300) {
            *slot = -1;
        }
        assert_eq!(stk.get(300), Some(&-1));
    }

    #[test]
    fn iter_does_not_consume() {
        let mut stk = ChunkedStack::new();
        for i in 0..300 {
            stk.push(i);
        }
        let top_down: Vec<i32> = stk.iter().rev().copied().collect();
        assert_eq!(top_down.first(), Some(&299));
        assert_eq!(top_down.len(), 300);
        // A second pass sees the same contents.
        assert_eq!(stk.iter().count(), 300);
        assert_eq!(stk.len(), 300);
    }
}
