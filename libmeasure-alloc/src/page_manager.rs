// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::allocator::PageAllocator;
use crate::movable::MovableMemory;
use crate::page::{Grab, Page};
use crate::stats::{MemoryStats, PageManagerCounters};
use allocator_api2::alloc::AllocError;
use core::ptr::{slice_from_raw_parts_mut, NonNull};
use parking_lot::lock_api::RawMutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::trace;

/// Default alignment of [PageManager::alloc] and of movable allocations.
pub const ALIGNMENT: usize = 8;

/// Id and number of used bytes of one block of a [PageManager].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageInfo {
    pub id: u32,
    pub usage: u32,
}

#[derive(Clone, Copy)]
struct LastAllocation {
    handle: MovableMemory,
    page: usize,
    grab: Grab,
    size: usize,
}

/// [PageManager] owns a growing sequence of page blocks taken from a
/// [PageAllocator], and serves bump allocations out of them. When none of
/// its blocks has room for a request, it takes a new block big enough for
/// it, so the only failure is the exhausted budget of the allocator.
///
/// Raw allocations hand out addresses which are valid as long as the block
/// stays with this manager. Movable allocations hand out a [MovableMemory]
/// which is resolved against a manager and stays valid when the blocks are
/// transferred to another manager with [PageManager::adopt] or mirrored into
/// one with [PageManager::alloc_moved_page].
pub struct PageManager<R: RawMutex = parking_lot::RawMutex> {
    allocator: Arc<PageAllocator<R>>,
    pages: Vec<Page>,
    /// Maps every logical page id covered by a block to its index in `pages`.
    slots: FxHashMap<u32, usize>,
    /// Moved managers hold blocks whose logical ids may collide with blocks
    /// from the allocator, so they take no new allocations.
    moved: bool,
    last_allocation: Option<LastAllocation>,
    counters: Arc<PageManagerCounters>,
}

impl<R: RawMutex> PageManager<R> {
    fn empty(allocator: &Arc<PageAllocator<R>>, moved: bool) -> Self {
        Self {
            allocator: allocator.clone(),
            pages: Vec::new(),
            slots: FxHashMap::default(),
            moved,
            last_allocation: None,
            counters: Arc::new(PageManagerCounters::default()),
        }
    }

    /// Creates a manager with one page from `allocator`. Fails if the budget
    /// has no page left.
    pub fn new(allocator: &Arc<PageAllocator<R>>) -> Result<Self, AllocError> {
        let mut manager = Self::empty(allocator, false);
        manager.add_page(1)?;
        Ok(manager)
    }

    /// Creates an empty manager which receives its pages from another
    /// manager, see [PageManager::alloc_moved_page] and [PageManager::adopt].
    pub fn new_moved(allocator: &Arc<PageAllocator<R>>) -> Self {
        Self::empty(allocator, true)
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<PageAllocator<R>> {
        &self.allocator
    }

    #[inline]
    pub fn is_moved(&self) -> bool {
        self.moved
    }

    /// The live counters of this manager. They stay readable, and keep
    /// reporting, for as long as the manager lives.
    pub fn counters(&self) -> &Arc<PageManagerCounters> {
        &self.counters
    }

    pub fn stats(&self) -> MemoryStats {
        self.counters.snapshot()
    }

    #[inline]
    fn page_shift(&self) -> u32 {
        self.allocator.page_shift()
    }

    fn order_for(&self, size: usize) -> Result<u32, AllocError> {
        let order = size.max(1).div_ceil(self.allocator.page_size());
        u32::try_from(order).map_err(|_| AllocError)
    }

    fn push_page(&mut self, page: Page) -> usize {
        let index = self.pages.len();
        for id in page.logical_id..page.logical_id.saturating_add(page.order) {
            self.slots.insert(id, index);
        }
        self.counters
            .page_added(u64::from(page.order), page.capacity() as u64);
        if page.used_bytes() > 0 {
            self.counters.page_touched(u64::from(page.order));
            self.counters.grabbed(
                (page.used_bytes() - page.alignment_loss()) as u64,
                page.alignment_loss() as u64,
            );
        }
        self.pages.push(page);
        index
    }

    #[cold]
    #[inline(never)]
    fn add_page(&mut self, order: u32) -> Result<usize, AllocError> {
        self.pages.try_reserve(1).map_err(|_| AllocError)?;
        let page = self.allocator.get_page(order)?;
        trace!(id = page.physical_id, order, "Page manager took a new page");
        Ok(self.push_page(page))
    }

    /// Bumps `size` bytes, at least one so that every allocation has an
    /// address inside its block.
    fn grab(&mut self, size: usize, align: usize) -> Result<(usize, Grab, usize), AllocError> {
        if self.moved || !align.is_power_of_two() || align > self.allocator.page_size() {
            return Err(AllocError);
        }
        self.last_allocation = None;
        let reserved = size.max(1);
        let found = self
            .pages
            .iter_mut()
            .enumerate()
            .find_map(|(index, page)| Some((index, page.grab(reserved, align)?)));
        let (index, grab) = match found {
            Some(found) => found,
            None => {
                let order = self.order_for(reserved)?;
                let index = self.add_page(order)?;
                let grab = self.pages[index].grab(reserved, align).ok_or(AllocError)?;
                (index, grab)
            }
        };
        if grab.offset == grab.padding {
            // Nothing was on this block before.
            self.counters
                .page_touched(u64::from(self.pages[index].order));
        }
        self.counters.grabbed(reserved as u64, grab.padding as u64);
        Ok((index, grab, reserved))
    }

    /// Allocates `size` bytes aligned to [ALIGNMENT].
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.aligned_alloc(ALIGNMENT, size)
    }

    /// Allocates `size` bytes aligned to `alignment`, which is raised to at
    /// least [ALIGNMENT] and must be a power of two no larger than a page.
    pub fn aligned_alloc(
        &mut self,
        alignment: usize,
        size: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let (index, grab, _) = self.grab(size, alignment.max(ALIGNMENT))?;
        let thin = self.pages[index].ptr_at(grab.offset).ok_or(AllocError)?;
        debug_assert_eq!(0, thin.as_ptr().align_offset(alignment));
        // SAFETY: derived from the page pointer, so it is not null.
        Ok(unsafe { NonNull::new_unchecked(slice_from_raw_parts_mut(thin.as_ptr(), size)) })
    }

    /// Allocates `size` bytes and returns a handle to them instead of an
    /// address.
    pub fn alloc_movable(&mut self, size: usize) -> Result<MovableMemory, AllocError> {
        let (index, grab, reserved) = self.grab(size, ALIGNMENT)?;
        let page = &self.pages[index];
        let raw = ((page.logical_id as usize) << self.page_shift()) + grab.offset;
        let handle = MovableMemory::from_raw(u32::try_from(raw).map_err(|_| AllocError)?);
        self.last_allocation = Some(LastAllocation {
            handle,
            page: index,
            grab,
            size: reserved,
        });
        Ok(handle)
    }

    /// Undoes the most recent [PageManager::alloc_movable] if `handle` is what
    /// it returned. Returns false, and changes nothing, otherwise.
    pub fn rollback_alloc_movable(&mut self, handle: MovableMemory) -> bool {
        match self.last_allocation {
            Some(last) if last.handle == handle => {
                let page = &mut self.pages[last.page];
                page.rewind(last.grab, last.size);
                if last.grab.offset == last.grab.padding {
                    self.counters.page_untouched(u64::from(page.order));
                }
                self.counters
                    .released(last.size as u64, last.grab.padding as u64);
                self.last_allocation = None;
                true
            }
            _ => false,
        }
    }

    /// Finds the index of the block `handle` points into and the offset
    /// inside that block.
    fn locate(&self, handle: MovableMemory) -> Option<(usize, usize)> {
        if handle.is_null() {
            return None;
        }
        let index = *self.slots.get(&handle.page_id(self.page_shift()))?;
        let base = (self.pages[index].logical_id as usize) << self.page_shift();
        Some((index, handle.into_raw() as usize - base))
    }

    /// Resolves `handle` to an address. Returns `None` for the null handle and
    /// for handles that do not belong to this manager's pages.
    pub fn address(&self, handle: MovableMemory) -> Option<NonNull<u8>> {
        let (index, offset) = self.locate(handle)?;
        self.pages[index].ptr_at(offset)
    }

    /// Resolves `len` bytes at `handle`.
    pub fn bytes(&self, handle: MovableMemory, len: usize) -> Option<&[u8]> {
        let (index, offset) = self.locate(handle)?;
        self.pages[index].bytes(offset, len)
    }

    pub fn bytes_mut(&mut self, handle: MovableMemory, len: usize) -> Option<&mut [u8]> {
        let (index, offset) = self.locate(handle)?;
        self.pages[index].bytes_mut(offset, len)
    }

    /// Attaches a block which mirrors the block `moved_page_id` of another
    /// manager, possibly of another process, holding `usage` bytes. Returns
    /// the bytes to fill with the content of the original block.
    pub fn alloc_moved_page(
        &mut self,
        moved_page_id: u32,
        usage: usize,
    ) -> Result<&mut [u8], AllocError> {
        if !self.moved {
            return Err(AllocError);
        }
        let order = self.order_for(usage)?;
        let end = moved_page_id.checked_add(order).ok_or(AllocError)?;
        if moved_page_id == 0 || (moved_page_id..end).any(|id| self.slots.contains_key(&id)) {
            return Err(AllocError);
        }
        self.pages.try_reserve(1).map_err(|_| AllocError)?;
        let mut page = self.allocator.get_page(order)?;
        page.logical_id = moved_page_id;
        page.set_used(usage);
        let index = self.push_page(page);
        self.pages[index].bytes_mut(0, usage).ok_or(AllocError)
    }

    /// Takes over every block of `source` without touching their content.
    /// Both managers must draw from the same allocator.
    pub fn adopt(&mut self, mut source: PageManager<R>) -> Result<(), AllocError> {
        if !Arc::ptr_eq(&self.allocator, &source.allocator) {
            return Err(AllocError);
        }
        let overlaps = source
            .slots
            .keys()
            .any(|id| self.slots.contains_key(id));
        if overlaps {
            return Err(AllocError);
        }
        self.pages.try_reserve(source.pages.len()).map_err(|_| AllocError)?;
        source.slots.clear();
        source.last_allocation = None;
        source.counters.reset();
        for page in source.pages.drain(..) {
            self.push_page(page);
        }
        self.moved = true;
        Ok(())
    }

    /// Returns all pages to the allocator. The manager stays usable.
    pub fn free(&mut self) {
        for page in self.pages.drain(..) {
            self.allocator.put_page(page);
        }
        self.slots.clear();
        self.last_allocation = None;
        self.counters.reset();
    }

    pub fn number_of_used_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.used_bytes() > 0).count()
    }

    /// Infos of the blocks that hold data, in the order they were taken.
    pub fn page_infos(&self) -> Vec<PageInfo> {
        self.used_pages()
            .map(|(id, bytes)| PageInfo {
                id,
                usage: bytes.len() as u32,
            })
            .collect()
    }

    /// The logical id and used bytes of every block that holds data.
    pub fn used_pages(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.pages.iter().filter_map(|page| {
            let bytes = page.bytes(0, page.used_bytes())?;
            (!bytes.is_empty()).then_some((page.logical_id, bytes))
        })
    }
}

impl<R: RawMutex> Drop for PageManager<R> {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fuzzer_inner_loop;
    use bolero::generator::TypeGenerator;
    use proptest::prelude::*;

    fn allocator(pages: u64) -> Arc<PageAllocator> {
        PageAllocator::new(pages * 512, 512).unwrap()
    }

    #[test]
    fn fuzz() {
        const MAX_SIZE: usize = 2048;

        let size = 0..=MAX_SIZE;
        let align_bits = 0..=10;
        let idx = 0..=MAX_SIZE;
        let val = u8::produce();
        let allocs = Vec::<(usize, u32, usize, u8)>::produce()
            .with()
            .values((size, align_bits, idx, val));
        bolero::check!()
            .with_generator(allocs)
            .for_each(|size_align_vec| {
                let allocator = allocator(64);
                let mut manager = PageManager::new(&allocator).unwrap();
                for (size, align_bits, idx, val) in size_align_vec {
                    fuzzer_inner_loop(&mut manager, *size, *align_bits, *idx, *val)
                }
            })
    }

    #[test]
    fn grows_until_the_budget_is_gone() {
        let allocator = allocator(8);
        let data_pages = allocator.n_pages() - allocator.maintenance_pages();
        let mut manager = PageManager::new(&allocator).unwrap();
        let mut count = 0;
        while manager.alloc(512).is_ok() {
            count += 1;
        }
        assert_eq!(count, data_pages);
        assert!(PageManager::new(&allocator).is_err());

        let stats = manager.stats();
        assert_eq!(stats.pages_allocated, u64::from(data_pages));
        assert_eq!(stats.pages_used, u64::from(data_pages));
        assert_eq!(stats.memory_available, 0);

        manager.free();
        assert_eq!(manager.stats(), MemoryStats::default());
        assert!(PageManager::new(&allocator).is_ok());
        // A freed manager takes pages again.
        assert!(manager.alloc(16).is_ok());
    }

    #[test]
    fn large_requests_take_multi_page_blocks() {
        let allocator = allocator(16);
        let mut manager = PageManager::new(&allocator).unwrap();
        let handle = manager.alloc_movable(1300).unwrap();
        manager.bytes_mut(handle, 1300).unwrap().fill(7);
        assert!(manager.bytes(handle, 1300).unwrap().iter().all(|b| *b == 7));
        assert_eq!(manager.stats().pages_allocated, 1 + 3);
        assert_eq!(manager.page_infos().len(), 1);
        assert_eq!(manager.page_infos()[0].usage, 1300);
    }

    #[test]
    fn alignment() {
        let allocator = allocator(8);
        let mut manager = PageManager::new(&allocator).unwrap();
        manager.alloc(3).unwrap();
        let aligned = manager.aligned_alloc(64, 8).unwrap();
        assert_eq!(aligned.cast::<u8>().as_ptr().align_offset(64), 0);
        assert_eq!(manager.stats().memory_alignment_loss, 64 - 3);
        assert!(manager.aligned_alloc(24, 8).is_err());
        assert!(manager.aligned_alloc(1024, 8).is_err());
    }

    #[test]
    fn rollback_only_undoes_the_last_allocation() {
        let allocator = allocator(8);
        let mut manager = PageManager::new(&allocator).unwrap();
        let first = manager.alloc_movable(10).unwrap();
        let second = manager.alloc_movable(10).unwrap();
        assert!(!manager.rollback_alloc_movable(first));
        assert!(manager.rollback_alloc_movable(second));
        assert!(!manager.rollback_alloc_movable(second));
        assert_eq!(manager.stats().memory_used, 10);
        assert_eq!(manager.alloc_movable(10).unwrap(), second);
        assert!(manager.bytes(first, 10).is_some());
    }

    #[test]
    fn rollback_of_a_fresh_page_untouches_it() {
        let allocator = allocator(8);
        let mut manager = PageManager::new(&allocator).unwrap();
        let handle = manager.alloc_movable(4).unwrap();
        assert_eq!(manager.number_of_used_pages(), 1);
        assert!(manager.rollback_alloc_movable(handle));
        assert_eq!(manager.number_of_used_pages(), 0);
        assert_eq!(manager.stats().pages_used, 0);
    }

    #[test]
    fn null_and_foreign_handles_do_not_resolve() {
        let allocator = allocator(8);
        let manager = PageManager::new(&allocator).unwrap();
        assert!(manager.address(MovableMemory::NULL).is_none());
        assert!(manager.bytes(MovableMemory::from_raw(u32::MAX), 1).is_none());
    }

    #[test]
    fn adopt_keeps_handles_valid() {
        let allocator = allocator(16);
        let mut source = PageManager::new(&allocator).unwrap();
        let handles: Vec<_> = (0..20u8)
            .map(|i| {
                let handle = source.alloc_movable(100).unwrap();
                source.bytes_mut(handle, 100).unwrap().fill(i);
                handle
            })
            .collect();
        let pages_before = allocator.stats().pages.pages_used;

        let mut destination = PageManager::new_moved(&allocator);
        destination.adopt(source).unwrap();
        assert!(destination.is_moved());
        assert_eq!(allocator.stats().pages.pages_used, pages_before);
        for (i, handle) in handles.iter().enumerate() {
            let bytes = destination.bytes(*handle, 100).unwrap();
            assert!(bytes.iter().all(|b| usize::from(*b) == i));
        }
        // Moved managers do not take new allocations.
        assert!(destination.alloc(8).is_err());
    }

    #[test]
    fn adopt_rejects_foreign_allocators() {
        let mine = allocator(8);
        let theirs = allocator(8);
        let mut destination = PageManager::new_moved(&mine);
        let source = PageManager::new(&theirs).unwrap();
        assert!(destination.adopt(source).is_err());
    }

    #[test]
    fn moved_pages_mirror_other_managers() {
        let theirs = allocator(32);
        let mut source = PageManager::new(&theirs).unwrap();
        // Push the source onto page ids the destination's allocator also uses.
        let _pad = source.alloc(600).unwrap();
        let handle = source.alloc_movable(300).unwrap();
        source.bytes_mut(handle, 3).unwrap().copy_from_slice(b"abc");

        let mine = allocator(32);
        let _other = PageManager::new(&mine).unwrap();
        let mut destination = PageManager::new_moved(&mine);
        for (id, bytes) in source.used_pages() {
            destination
                .alloc_moved_page(id, bytes.len())
                .unwrap()
                .copy_from_slice(bytes);
        }
        assert_eq!(destination.page_infos(), source.page_infos());
        assert_eq!(destination.bytes(handle, 3).unwrap(), b"abc");
        assert_eq!(destination.stats().memory_used, source.stats().memory_used);

        // The same id cannot be attached twice.
        let first = source.page_infos()[0].id;
        assert!(destination.alloc_moved_page(first, 1).is_err());
    }

    proptest! {
        #[test]
        fn relocation_preserves_content(sizes in proptest::collection::vec(1usize..700, 1..64)) {
            let allocator = allocator(256);
            let mut source = PageManager::new(&allocator).unwrap();
            let mut written = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                let handle = source.alloc_movable(*size).unwrap();
                let bytes = source.bytes_mut(handle, *size).unwrap();
                for (j, b) in bytes.iter_mut().enumerate() {
                    *b = (i + j) as u8;
                }
                written.push((handle, bytes.to_vec()));
            }

            let mut relocated = PageManager::new_moved(&allocator);
            relocated.adopt(source).unwrap();
            for (handle, content) in &written {
                prop_assert_eq!(relocated.bytes(*handle, content.len()).unwrap(), &content[..]);
            }

            let other = PageAllocator::new(256 * 512, 512).unwrap();
            let mut mirrored = PageManager::new_moved(&other);
            for (id, bytes) in relocated.used_pages() {
                mirrored.alloc_moved_page(id, bytes.len()).unwrap().copy_from_slice(bytes);
            }
            for (handle, content) in &written {
                prop_assert_eq!(mirrored.bytes(*handle, content.len()).unwrap(), &content[..]);
            }
        }
    }
}
