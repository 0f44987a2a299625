// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::bitset::PageBitset;
use crate::page::Page;
use crate::stats::MemoryStats;
use crate::utils::npot;
use allocator_api2::alloc::{AllocError, Allocator, Global};
use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;
use parking_lot::lock_api::{Mutex, RawMutex};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pages smaller than this are rejected.
pub const MIN_PAGE_SIZE: u64 = 512;

/// Movable handles are 32 bits wide, so the arena cannot be larger.
pub const MAX_TOTAL_MEMORY: u64 = u32::MAX as u64;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("page size {0} is below the minimum of 512 bytes")]
    InvalidPageSize(u64),
    #[error("page size {page_size} exceeds total memory {total_memory}")]
    PageSizeExceedsTotal { page_size: u64, total_memory: u64 },
    #[error("total memory {total_memory} leaves no data pages next to {maintenance_pages} maintenance pages")]
    InsufficientMemory {
        total_memory: u64,
        maintenance_pages: u32,
    },
    #[error("failed to reserve {0} bytes for the page arena")]
    ArenaReservation(u64),
}

/// Snapshot of the allocator's budget.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocatorStats {
    pub pages: MemoryStats,
    pub maintenance: MemoryStats,
    pub pages_high_watermark: u32,
}

struct PageTable {
    in_use: PageBitset,
    pages_used: u32,
    high_watermark: u32,
}

/// [PageAllocator] owns one zero-initialized arena of `total_memory` bytes
/// cut into pages of `page_size` bytes, and hands out blocks of contiguous
/// pages to page managers. The first pages of the arena are accounted as
/// maintenance pages for the allocator's own bookkeeping and are never handed
/// out, which keeps page id zero free for the null movable handle.
///
/// Only taking and returning pages goes through the lock. The lock type is a
/// parameter so the embedding runtime can supply its own primitive.
pub struct PageAllocator<R: RawMutex = parking_lot::RawMutex> {
    arena: NonNull<u8>,
    arena_layout: Layout,
    page_shift: u32,
    n_pages: u32,
    maintenance_pages: u32,
    table: Mutex<R, PageTable>,
}

// SAFETY: the arena is only reached through pages, which are handed out
// disjointly under the lock.
unsafe impl<R: RawMutex + Send + Sync> Send for PageAllocator<R> {}
// SAFETY: see above.
unsafe impl<R: RawMutex + Send + Sync> Sync for PageAllocator<R> {}

impl PageAllocator {
    /// Creates an allocator guarded by a [parking_lot::RawMutex].
    pub fn new(total_memory: u64, page_size: u64) -> Result<Arc<Self>, AllocatorError> {
        Self::with_lock(total_memory, page_size)
    }
}

impl<R: RawMutex> PageAllocator<R> {
    /// Creates an allocator for a budget of `total_memory` bytes. The page
    /// size is rounded up to the next power of two. A budget beyond
    /// [MAX_TOTAL_MEMORY] is clamped with a warning, and whatever does not
    /// fill a whole page is dropped.
    pub fn with_lock(total_memory: u64, page_size: u64) -> Result<Arc<Self>, AllocatorError> {
        let page_size = npot(page_size);
        if page_size < MIN_PAGE_SIZE {
            return Err(AllocatorError::InvalidPageSize(page_size));
        }
        if page_size > total_memory {
            return Err(AllocatorError::PageSizeExceedsTotal {
                page_size,
                total_memory,
            });
        }

        let total = clamp_total_memory(total_memory);

        let page_shift = page_size.trailing_zeros();
        let n_pages = u32::try_from(total >> page_shift).unwrap_or(u32::MAX);
        let maintenance_pages = Self::maintenance_pages_for(n_pages, page_size);
        if maintenance_pages >= n_pages {
            return Err(AllocatorError::InsufficientMemory {
                total_memory: total,
                maintenance_pages,
            });
        }

        let arena_bytes = u64::from(n_pages) << page_shift;
        let arena_layout = usize::try_from(arena_bytes)
            .ok()
            .and_then(|size| Layout::from_size_align(size, page_size as usize).ok())
            .ok_or(AllocatorError::ArenaReservation(arena_bytes))?;
        let arena = Global
            .allocate_zeroed(arena_layout)
            .map_err(|_| AllocatorError::ArenaReservation(arena_bytes))?;

        let mut in_use = PageBitset::new(n_pages as usize);
        in_use.set_range(0, maintenance_pages as usize);

        debug!(
            page_size,
            n_pages, maintenance_pages, "Created page allocator"
        );
        Ok(Arc::new(Self {
            arena: arena.cast(),
            arena_layout,
            page_shift,
            n_pages,
            maintenance_pages,
            table: Mutex::new(PageTable {
                in_use,
                pages_used: 0,
                high_watermark: 0,
            }),
        }))
    }

    /// The bookkeeping of `n_pages` pages: the usage bitset plus one page
    /// record per page, rounded up to whole pages.
    fn maintenance_pages_for(n_pages: u32, page_size: u64) -> u32 {
        let n = u64::from(n_pages);
        let bytes = n.div_ceil(8) + n * size_of::<Page>() as u64;
        u32::try_from(bytes.div_ceil(page_size).max(1)).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    #[inline]
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Number of pages in the arena, maintenance pages included.
    #[inline]
    pub fn n_pages(&self) -> u32 {
        self.n_pages
    }

    #[inline]
    pub fn maintenance_pages(&self) -> u32 {
        self.maintenance_pages
    }

    /// Bits of a movable handle that address a byte within a page.
    pub fn page_offset_bit_width(&self) -> u32 {
        self.page_shift
    }

    /// Bits of a movable handle that address a page.
    pub fn n_pages_bit_width(&self) -> u32 {
        u32::BITS - (self.n_pages - 1).leading_zeros()
    }

    /// Takes `order` contiguous pages from the budget.
    pub(crate) fn get_page(&self, order: u32) -> Result<Page, AllocError> {
        let order = order.max(1);
        let first = {
            let mut table = self.table.lock();
            let first = table
                .in_use
                .find_and_set_range(order as usize)
                .ok_or(AllocError)?;
            table.pages_used += order;
            table.high_watermark = table.high_watermark.max(table.pages_used);
            first
        };
        let offset = first << self.page_shift;
        let capacity = (order as usize) << self.page_shift;
        // SAFETY: the block lies inside the arena, which is initialized, and
        // the bitset guarantees nobody else holds it.
        let page = unsafe {
            let ptr = NonNull::new_unchecked(self.arena.as_ptr().add(offset));
            Page::new(first as u32, order, ptr, capacity)
        };
        Ok(page)
    }

    /// Returns the pages of `page` to the budget.
    pub(crate) fn put_page(&self, page: Page) {
        let mut table = self.table.lock();
        table
            .in_use
            .clear_range(page.physical_id as usize, page.order as usize);
        table.pages_used -= page.order;
    }

    /// Returns the statistics of data pages and maintenance pages.
    pub fn stats(&self) -> AllocatorStats {
        let page_size = self.page_size() as u64;
        let (pages_used, high_watermark) = {
            let table = self.table.lock();
            (table.pages_used, table.high_watermark)
        };
        let data_pages = u64::from(self.n_pages - self.maintenance_pages);
        let pages_used = u64::from(pages_used);
        let maintenance_pages = u64::from(self.maintenance_pages);
        let maintenance_used =
            u64::from(self.n_pages).div_ceil(8) + u64::from(self.n_pages) * size_of::<Page>() as u64;
        AllocatorStats {
            pages: MemoryStats {
                pages_allocated: data_pages,
                pages_used,
                memory_allocated: data_pages * page_size,
                memory_used: pages_used * page_size,
                memory_available: (data_pages - pages_used) * page_size,
                memory_alignment_loss: 0,
            },
            maintenance: MemoryStats {
                pages_allocated: maintenance_pages,
                pages_used: maintenance_pages,
                memory_allocated: maintenance_pages * page_size,
                memory_used: maintenance_used,
                memory_available: (maintenance_pages * page_size).saturating_sub(maintenance_used),
                memory_alignment_loss: 0,
            },
            pages_high_watermark: high_watermark,
        }
    }
}

/// Limits `total_memory` to [MAX_TOTAL_MEMORY], warning when it is larger.
pub fn clamp_total_memory(total_memory: u64) -> u64 {
    if total_memory > MAX_TOTAL_MEMORY {
        warn!(
            "Requested total memory of {total_memory} bytes exceeds the maximum of {MAX_TOTAL_MEMORY} bytes, clamping"
        );
        return MAX_TOTAL_MEMORY;
    }
    total_memory
}

/// The page size a request for `page_size` bytes ends up with: the next
/// power of two, and at least [MIN_PAGE_SIZE].
pub fn normalize_page_size(page_size: u64) -> u64 {
    npot(page_size.max(MIN_PAGE_SIZE))
}

impl<R: RawMutex> Drop for PageAllocator<R> {
    fn drop(&mut self) {
        // SAFETY: passing the original ptr back in, with the original layout.
        // Page managers hold an Arc to the allocator, so no page outlives it.
        unsafe { Global.deallocate(self.arena, self.arena_layout) };
    }
}
