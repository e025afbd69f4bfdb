// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed storage of finished span activations. Activations are
//! grouped into chains of bins, each covering a small window, so a sample
//! timestamp is matched by scanning a single bin chain instead of the whole
//! profiling period or an interval tree. An activation is copied into every
//! bin its interval overlaps, which keeps lookup one-bin-local.

use core::mem;
use core::ptr::NonNull;
use spanprof_alloc::PagedArena;

use super::activation::SpanActivation;

/// Nanoseconds covered by each activation bin.
pub const BIN_WIDTH_NANOS: i64 = 100_000_000;

/// Activations per bin before overflow chaining.
pub const ACTIVATIONS_PER_BIN: usize = 64;

/// Bins per time slice; one slice covers 38.4 seconds.
pub const BINS_PER_SLICE: usize = 384;

/// Bucket of activations overlapping one 100 ms window, arrival-ordered.
/// Bins chain when a window collects more than [`ACTIVATIONS_PER_BIN`].
struct ActivationBin {
    activations: [SpanActivation; ACTIVATIONS_PER_BIN],
    count: u32,
    /// Position of this bin within its owning slice.
    index: u32,
    /// Owning slice; overflow bins inherit the back-reference.
    slice: Option<NonNull<TimeSlice>>,
    next: Option<NonNull<ActivationBin>>,
}

/// A fixed run of bins. Slices chain to cover unbounded cycles; slice `i`
/// owns bin indices `[i * BINS_PER_SLICE, (i + 1) * BINS_PER_SLICE)`.
struct TimeSlice {
    bins: [ActivationBin; BINS_PER_SLICE],
    next: Option<NonNull<TimeSlice>>,
}

fn new_slice(arena: &mut PagedArena) -> Option<NonNull<TimeSlice>> {
    let block = arena.alloc(mem::size_of::<TimeSlice>()).ok()?;
    let mut slice = block.cast::<TimeSlice>();
    // SAFETY: the arena returns zeroed 16-byte-aligned memory, and the
    // all-zero bit pattern is a valid TimeSlice: zero counts, empty
    // activations, and None pointers through the null niche.
    let slice_ref = unsafe { slice.as_mut() };
    for (index, bin) in slice_ref.bins.iter_mut().enumerate() {
        bin.index = index as u32;
        bin.slice = Some(slice);
    }
    Some(slice)
}

/// Appends `activation` to the terminal bin of `bin`'s chain, growing the
/// chain from the arena when the tail is full. Exhaustion drops the
/// activation silently.
fn bin_insert(arena: &mut PagedArena, mut bin: NonNull<ActivationBin>, activation: &SpanActivation) {
    // SAFETY: bin and chain pointers are live arena allocations owned by
    // this index; see new_slice.
    let mut tail = unsafe { bin.as_mut() };
    while let Some(mut next) = tail.next {
        // SAFETY: as above.
        tail = unsafe { next.as_mut() };
    }

    if tail.count as usize == ACTIVATIONS_PER_BIN {
        let Ok(block) = arena.alloc(mem::size_of::<ActivationBin>()) else {
            return;
        };
        let mut overflow = block.cast::<ActivationBin>();
        // SAFETY: zeroed memory is a valid ActivationBin.
        let overflow_ref = unsafe { overflow.as_mut() };
        overflow_ref.index = tail.index;
        overflow_ref.slice = tail.slice;
        tail.next = Some(overflow);
        tail = overflow_ref;
    }

    tail.activations[tail.count as usize] = *activation;
    tail.count += 1;
}

/// Index of finished activations, answering "which activation with
/// `start <= t <= end` has the greatest start" for sample timestamps.
///
/// All storage lives in the owning profiler's arena. The index must be
/// rebuilt (`new`) immediately after every arena reset; the old value holds
/// dangling pointers past that point and must not be used.
pub struct ActivationIndex {
    head: Option<NonNull<TimeSlice>>,
    /// Monotonic epoch of bin 0.
    start_time: i64,
}

impl ActivationIndex {
    /// Allocates the head slice eagerly. When the arena cannot back it,
    /// every operation on the returned index degrades to a no-op.
    pub fn new(arena: &mut PagedArena, start_time: i64) -> Self {
        Self {
            head: new_slice(arena),
            start_time,
        }
    }

    /// Whether the head slice allocation succeeded.
    pub fn is_backed(&self) -> bool {
        self.head.is_some()
    }

    /// Rebinds the epoch of bin 0. Only meaningful while the index is
    /// empty; callers reset before restarting a cycle.
    pub fn set_start_time(&mut self, start_time: i64) {
        self.start_time = start_time;
    }

    fn bin_index(&self, timestamp: i64) -> i64 {
        (timestamp - self.start_time) / BIN_WIDTH_NANOS
    }

    /// Walks, and lazily extends, the slice chain out to `bin_index`.
    fn bin(&mut self, arena: &mut PagedArena, bin_index: i64) -> Option<NonNull<ActivationBin>> {
        let slice_index = bin_index / BINS_PER_SLICE as i64;

        let mut slice = self.head?;
        for _ in 0..slice_index {
            // SAFETY: slice pointers originate from new_slice and stay live
            // until the arena resets, which also retires this index.
            let current = unsafe { slice.as_mut() };
            slice = match current.next {
                Some(next) => next,
                None => {
                    let next = new_slice(arena)?;
                    current.next = Some(next);
                    next
                }
            };
        }

        let offset = (bin_index - slice_index * BINS_PER_SLICE as i64) as usize;
        // SAFETY: as above; offset is within BINS_PER_SLICE.
        let bin = unsafe { &mut slice.as_mut().bins[offset] };
        Some(NonNull::from(bin))
    }

    /// Copies `activation` into every bin its interval overlaps, so a
    /// lookup in any overlapped window sees it. Timestamps before the
    /// profiling start clamp to the first bin.
    pub fn insert(&mut self, arena: &mut PagedArena, activation: &SpanActivation) {
        let start_bin = self.bin_index(activation.start_time).max(0);
        let end_bin = self.bin_index(activation.end_time).max(start_bin);
        for index in start_bin..=end_bin {
            let Some(bin) = self.bin(arena, index) else {
                return;
            };
            bin_insert(arena, bin, activation);
        }
    }

    /// Returns the activation containing `timestamp` with the greatest
    /// start time: the innermost span active at that instant.
    pub fn find_closest(
        &mut self,
        arena: &mut PagedArena,
        timestamp: i64,
    ) -> Option<SpanActivation> {
        let index = self.bin_index(timestamp);
        if index < 0 {
            return None;
        }

        let mut chain = self.bin(arena, index);
        let mut best: Option<SpanActivation> = None;
        while let Some(bin) = chain {
            // SAFETY: live arena allocation until the next reset.
            let bin_ref = unsafe { bin.as_ref() };
            for activation in &bin_ref.activations[..bin_ref.count as usize] {
                if activation.start_time <= timestamp && timestamp <= activation.end_time {
                    match &best {
                        Some(current) if activation.start_time <= current.start_time => {}
                        _ => best = Some(*activation),
                    }
                }
            }
            chain = bin_ref.next;
        }
        best
    }

    /// Visits every stored activation in slice and bin order. Activations
    /// spanning several windows are visited once per window.
    pub fn for_each(&self, mut visit: impl FnMut(&SpanActivation)) {
        let mut slice = self.head;
        while let Some(current) = slice {
            // SAFETY: live arena allocation until the next reset.
            let slice_ref = unsafe { current.as_ref() };
            for bin in &slice_ref.bins {
                let mut chain = Some(NonNull::from(bin));
                while let Some(link) = chain {
                    // SAFETY: as above.
                    let bin_ref = unsafe { link.as_ref() };
                    for activation in &bin_ref.activations[..bin_ref.count as usize] {
                        visit(activation);
                    }
                    chain = bin_ref.next;
                }
            }
            slice = slice_ref.next;
        }
    }
}
