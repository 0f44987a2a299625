// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// A manager-relative reference to memory allocated with
/// [`crate::PageManager::alloc_movable`]. It packs the page id and the offset
/// into that page as `page_id << page_shift | offset`, so it never stores an
/// address and survives a relocation of the pages it points into.
///
/// The value zero is the null handle. Page zero always belongs to the
/// allocator's maintenance pages, so no allocation can produce it.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MovableMemory(u32);

impl MovableMemory {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) const fn page_id(self, page_shift: u32) -> u32 {
        self.0 >> page_shift
    }
}

impl fmt::Debug for MovableMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("MovableMemory(null)")
        } else {
            write!(f, "MovableMemory({:#x})", self.0)
        }
    }
}
