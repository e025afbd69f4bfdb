// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::mem;
use core::ptr::NonNull;
use spanprof_alloc::PagedArena;

/// Activations an [`ActivationStack`] holds inline before spilling into the
/// arena. Depth one is the overwhelmingly common case.
pub const INLINE_ACTIVATIONS: usize = 2;

/// Capacity of the first arena-backed buffer; growth is by half after that.
const FIRST_OVERFLOW_CAPACITY: u32 = 8;

/// The interval during which one span was current on one context. Trace and
/// span ids stay in the ASCII hex form the application handed in; they are
/// decoded to binary only once a sample actually matches.
///
/// The all-zero bit pattern is a valid (empty) value, which is what lets
/// these live in zero-initialized arena storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanActivation {
    pub trace_id: [u8; 32],
    pub span_id: [u8; 16],
    /// Monotonic ns at enter.
    pub start_time: i64,
    /// Monotonic ns at exit; meaningful once the activation is closed.
    pub end_time: i64,
}

impl SpanActivation {
    pub const EMPTY: SpanActivation = SpanActivation {
        trace_id: [0; 32],
        span_id: [0; 16],
        start_time: 0,
        end_time: 0,
    };

    pub fn new(trace_id: [u8; 32], span_id: [u8; 16], start_time: i64) -> Self {
        Self {
            trace_id,
            span_id,
            start_time,
            end_time: 0,
        }
    }
}

fn alloc_activations(arena: &mut PagedArena, capacity: u32) -> Option<NonNull<SpanActivation>> {
    let size = mem::size_of::<SpanActivation>().checked_mul(capacity as usize)?;
    // Arena blocks are 16-byte aligned, more than SpanActivation needs.
    Some(arena.alloc(size).ok()?.cast())
}

/// Per-context LIFO of in-progress activations. Pushes past the inline head
/// copy into an arena buffer; the buffer is abandoned wholesale when the
/// owning profiler resets, so there is nothing to free here.
pub struct ActivationStack {
    count: u32,
    capacity: u32,
    inline: [SpanActivation; INLINE_ACTIVATIONS],
    extra: Option<NonNull<SpanActivation>>,
}

impl ActivationStack {
    pub fn new() -> Self {
        Self {
            count: 0,
            capacity: INLINE_ACTIVATIONS as u32,
            inline: [SpanActivation::EMPTY; INLINE_ACTIVATIONS],
            extra: None,
        }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Pushes `activation`. Returns false, dropping the activation, when the
    /// arena cannot back the required buffer.
    pub fn push(&mut self, arena: &mut PagedArena, activation: SpanActivation) -> bool {
        if self.extra.is_none() {
            if self.len() < INLINE_ACTIVATIONS {
                self.inline[self.len()] = activation;
                self.count += 1;
                return true;
            }

            let Some(extra) = alloc_activations(arena, FIRST_OVERFLOW_CAPACITY) else {
                return false;
            };
            // SAFETY: the fresh buffer holds FIRST_OVERFLOW_CAPACITY entries
            // and count is at most INLINE_ACTIVATIONS.
            unsafe {
                core::ptr::copy_nonoverlapping(self.inline.as_ptr(), extra.as_ptr(), self.len());
            }
            self.extra = Some(extra);
            self.capacity = FIRST_OVERFLOW_CAPACITY;
        } else if self.count == self.capacity {
            let new_capacity = self.capacity + self.capacity / 2;
            let Some(grown) = alloc_activations(arena, new_capacity) else {
                return false;
            };
            if let Some(extra) = self.extra {
                // SAFETY: both buffers are live arena allocations of at
                // least `count` entries, and a fresh allocation never
                // overlaps a live one.
                unsafe {
                    core::ptr::copy_nonoverlapping(extra.as_ptr(), grown.as_ptr(), self.len());
                }
            }
            self.extra = Some(grown);
            self.capacity = new_capacity;
        }

        let Some(extra) = self.extra else {
            return false;
        };
        // SAFETY: count < capacity and `extra` points at `capacity` entries,
        // live until the owning profiler resets.
        unsafe { extra.as_ptr().add(self.len()).write(activation) };
        self.count += 1;
        true
    }

    /// Pops the innermost in-progress activation.
    pub fn pop(&mut self) -> Option<SpanActivation> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        let index = self.len();
        match self.extra {
            None => Some(self.inline[index]),
            // SAFETY: entries below the old count are initialized and the
            // buffer is live until the owning profiler resets.
            Some(extra) => Some(unsafe { extra.as_ptr().add(index).read() }),
        }
    }
}

impl Default for ActivationStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activation(marker: u8, start_time: i64) -> SpanActivation {
        SpanActivation::new([marker; 32], [marker; 16], start_time)
    }

    fn arena() -> PagedArena {
        PagedArena::new(64 * 1024).unwrap()
    }

    #[test]
    fn test_inline_push_pop() {
        let mut arena = arena();
        let mut stack = ActivationStack::new();

        assert!(stack.push(&mut arena, activation(1, 10)));
        assert!(stack.push(&mut arena, activation(2, 20)));
        assert_eq!(2, stack.len());
        // Inline depth needs no arena traffic.
        assert_eq!(0, arena.used_bytes());

        assert_eq!(Some(activation(2, 20)), stack.pop());
        assert_eq!(Some(activation(1, 10)), stack.pop());
        assert_eq!(None, stack.pop());
    }

    #[test]
    fn test_overflow_growth_keeps_order() {
        let mut arena = arena();
        let mut stack = ActivationStack::new();

        // Deep enough to force the 8-entry buffer and one 1.5x growth.
        for i in 0..10u8 {
            assert!(stack.push(&mut arena, activation(i, i64::from(i))));
        }
        assert!(arena.used_bytes() > 0);
        assert_eq!(10, stack.len());

        for i in (0..10u8).rev() {
            assert_eq!(Some(activation(i, i64::from(i))), stack.pop());
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn test_arena_exhaustion_drops_push() {
        // Page too small for the first overflow buffer.
        let mut arena = PagedArena::new(mem::size_of::<SpanActivation>() * 4).unwrap();
        let mut stack = ActivationStack::new();

        assert!(stack.push(&mut arena, activation(1, 1)));
        assert!(stack.push(&mut arena, activation(2, 2)));
        // Overflow needs 8 entries, the page holds 4.
        assert!(!stack.push(&mut arena, activation(3, 3)));
        assert_eq!(2, stack.len());

        // The stack stays usable.
        assert_eq!(Some(activation(2, 2)), stack.pop());
    }
}
