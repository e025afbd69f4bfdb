// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use allocator_api2::alloc::{AllocError, Allocator, Global};
use core::alloc::Layout;
use core::ptr::{slice_from_raw_parts_mut, NonNull};

/// Alignment of every block handed out by [`PagedArena::alloc`]. Two pointer
/// widths, so 16 bytes on 64-bit targets.
pub const ARENA_ALIGNMENT: usize = 2 * core::mem::size_of::<*const ()>();

/// One backing allocation of the arena. The page metadata may move around
/// freely (it lives in the arena's page tables); the backing memory never
/// moves until the arena is dropped.
struct Page {
    mem: NonNull<[u8]>,
    used: usize,
}

impl Page {
    fn new(page_size: usize) -> Result<Self, AllocError> {
        let layout = page_layout(page_size)?;
        let mem = Global.allocate(layout)?;
        Ok(Self { mem, used: 0 })
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }

    /// Bump-allocates `size` zeroed bytes, or `None` when the page is full.
    fn alloc(&mut self, size: usize) -> Option<NonNull<[u8]>> {
        let offset = align_up(self.used, ARENA_ALIGNMENT)?;
        let end = offset.checked_add(size)?;
        if end > self.capacity() {
            return None;
        }

        // SAFETY: offset + size is in bounds of the backing allocation.
        let thin = unsafe { self.mem.as_ptr().cast::<u8>().add(offset) };

        // Recycled pages carry bytes from earlier cycles; the contract is
        // that every block comes back zeroed.
        // SAFETY: `thin` points at `size` writable bytes, checked above.
        unsafe { thin.write_bytes(0, size) };

        self.used = end;

        // SAFETY: derived from the page allocation, so inherently non-null.
        Some(unsafe { NonNull::new_unchecked(slice_from_raw_parts_mut(thin, size)) })
    }
}

fn page_layout(page_size: usize) -> Result<Layout, AllocError> {
    Layout::from_size_align(page_size, ARENA_ALIGNMENT).map_err(|_| AllocError)
}

fn align_up(offset: usize, align: usize) -> Option<usize> {
    Some(offset.checked_add(align - 1)? & !(align - 1))
}

/// A bump allocator over a chain of fixed-size pages. Blocks are aligned to
/// [`ARENA_ALIGNMENT`], zero-initialized, and never individually freed:
/// [`PagedArena::reset`] reclaims everything at once, parking spare pages on
/// a free list so steady-state cycles stop hitting the global allocator.
///
/// Resetting invalidates every outstanding block. Callers own that invariant;
/// the arena hands out raw [`NonNull`] blocks and cannot enforce it.
pub struct PagedArena {
    /// Live pages. The last entry is the page allocations are served from.
    pages: Vec<Page>,
    /// Pages parked by [`Self::reset`], reused before growing.
    free: Vec<Page>,
    page_size: usize,
}

// SAFETY: the arena exclusively owns its pages; nothing is shared.
unsafe impl Send for PagedArena {}

impl PagedArena {
    /// Creates an arena with one empty page of `page_size` bytes.
    pub fn new(page_size: usize) -> Result<Self, AllocError> {
        let pages = vec![Page::new(page_size)?];
        Ok(Self {
            pages,
            free: Vec::new(),
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns a zeroed block of `size` bytes aligned to [`ARENA_ALIGNMENT`].
    /// Allocations must fit a single page; `size > page_size` is an error.
    ///
    /// The block stays valid until [`Self::reset`] or drop.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size > self.page_size {
            return Err(AllocError);
        }

        if let Some(page) = self.pages.last_mut() {
            if let Some(block) = page.alloc(size) {
                return Ok(block);
            }
        }

        let mut page = match self.free.pop() {
            Some(page) => page,
            None => Page::new(self.page_size)?,
        };
        let block = page.alloc(size).ok_or(AllocError)?;
        self.pages.push(page);
        Ok(block)
    }

    /// Returns all but the current page to the free list and rewinds the
    /// retained page to offset zero. O(pages); every outstanding block is
    /// invalidated.
    pub fn reset(&mut self) {
        let Some(mut retained) = self.pages.pop() else {
            return;
        };
        retained.used = 0;
        for mut page in self.pages.drain(..) {
            page.used = 0;
            self.free.push(page);
        }
        self.pages.push(retained);
    }

    /// Sum of used bytes across live pages. Monotonic between resets.
    pub fn used_bytes(&self) -> usize {
        self.pages.iter().map(|page| page.used).sum()
    }

    /// Number of live pages plus parked free pages.
    pub fn page_count(&self) -> usize {
        self.pages.len() + self.free.len()
    }
}

impl Drop for PagedArena {
    fn drop(&mut self) {
        let Ok(layout) = page_layout(self.page_size) else {
            return;
        };
        for page in self.pages.drain(..).chain(self.free.drain(..)) {
            // SAFETY: the pointer came from Global with this layout, and no
            // block can outlive the arena per the alloc contract.
            unsafe { Global.deallocate(page.mem.cast(), layout) };
        }
    }
}

impl core::fmt::Debug for PagedArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PagedArena")
            .field("page_size", &self.page_size)
            .field("pages", &self.pages.len())
            .field("free", &self.free.len())
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}
