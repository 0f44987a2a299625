// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::utils::round_up;
use core::ptr::NonNull;

/// A block of `order` contiguous pages of the allocator's arena. Like a
/// linear allocator, it only ever bumps its `used` mark forward, with the
/// single exception of [Page::rewind] which undoes the latest bump.
///
/// The block base is aligned to the page size, so aligning an offset inside
/// the block also aligns the resulting address for any alignment up to the
/// page size.
pub(crate) struct Page {
    /// Index of the first arena page of this block. Only the allocator cares.
    pub(crate) physical_id: u32,
    /// The page id movable handles into this block carry. It equals the
    /// physical id unless the block mirrors a page of another manager.
    pub(crate) logical_id: u32,
    pub(crate) order: u32,
    ptr: NonNull<u8>,
    capacity: usize,
    used: usize,
    alignment_loss: usize,
}

// SAFETY: the block is exclusively owned by whoever holds the Page, and the
// arena it points into outlives it.
unsafe impl Send for Page {}

/// Result of a successful bump.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Grab {
    pub offset: usize,
    pub padding: usize,
}

impl Page {
    /// # Safety
    /// `ptr` must point to `capacity` initialized bytes that stay valid and
    /// unaliased for as long as the page lives.
    pub(crate) unsafe fn new(physical_id: u32, order: u32, ptr: NonNull<u8>, capacity: usize) -> Self {
        Self {
            physical_id,
            logical_id: physical_id,
            order,
            ptr,
            capacity,
            used: 0,
            alignment_loss: 0,
        }
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn alignment_loss(&self) -> usize {
        self.alignment_loss
    }

    /// Bumps the used mark for `size` bytes at `align`. Returns `None` if the
    /// block cannot hold the request.
    pub fn grab(&mut self, size: usize, align: usize) -> Option<Grab> {
        let offset = round_up(self.used, align)?;
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        let padding = offset - self.used;
        self.used = end;
        self.alignment_loss += padding;
        Some(Grab { offset, padding })
    }

    /// Undoes the latest [Page::grab].
    pub fn rewind(&mut self, grab: Grab, size: usize) {
        debug_assert_eq!(self.used, grab.offset + size);
        self.used = grab.offset - grab.padding;
        self.alignment_loss -= grab.padding;
    }

    /// Marks the first `usage` bytes as used without bumping, for blocks
    /// whose content is copied in from elsewhere.
    pub fn set_used(&mut self, usage: usize) {
        debug_assert!(usage <= self.capacity);
        self.used = usage.min(self.capacity);
    }

    #[inline]
    pub fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        if offset > self.capacity {
            return None;
        }
        // SAFETY: in range of the block, or the legal one-past-the-end.
        Some(unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) })
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset.checked_add(len)? > self.used {
            return None;
        }
        // SAFETY: the range lies inside the used part of the block, which is
        // initialized, and the shared borrow of self keeps writers out.
        Some(unsafe { core::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        if offset.checked_add(len)? > self.used {
            return None;
        }
        // SAFETY: see bytes, and the exclusive borrow of self.
        Some(unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(storage: &mut [u64]) -> Page {
        let capacity = core::mem::size_of_val(storage);
        let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { Page::new(1, 1, ptr, capacity) }
    }

    #[test]
    fn bumps_and_pads() {
        let mut storage = [0u64; 8];
        let mut page = page(&mut storage);

        let first = page.grab(3, 1).unwrap();
        assert_eq!(first.offset, 0);
        let second = page.grab(8, 8).unwrap();
        assert_eq!(second.offset, 8);
        assert_eq!(second.padding, 5);
        assert_eq!(page.alignment_loss(), 5);
        assert_eq!(page.used_bytes(), 16);

        assert!(page.grab(64, 1).is_none());
        assert!(page.grab(48, 16).is_some());
        assert_eq!(page.used_bytes(), page.capacity());
        assert!(page.grab(0, 1).is_some());
        assert!(page.grab(1, 1).is_none());
    }

    #[test]
    fn rewind_restores_marks() {
        let mut storage = [0u64; 8];
        let mut page = page(&mut storage);
        page.grab(1, 1).unwrap();
        let grab = page.grab(4, 4).unwrap();
        page.rewind(grab, 4);
        assert_eq!(page.used_bytes(), 1);
        assert_eq!(page.alignment_loss(), 0);
    }

    #[test]
    fn bytes_are_bounded_by_usage() {
        let mut storage = [0u64; 8];
        let mut page = page(&mut storage);
        let grab = page.grab(4, 1).unwrap();
        page.bytes_mut(grab.offset, 4).unwrap().copy_from_slice(b"abcd");
        assert_eq!(page.bytes(0, 4).unwrap(), b"abcd");
        assert!(page.bytes(0, 5).is_none());
        assert!(page.bytes(usize::MAX, 2).is_none());
    }
}
