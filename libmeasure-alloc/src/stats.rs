// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Usage counters of a page manager or of the allocator itself.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    pub pages_allocated: u64,
    pub pages_used: u64,
    pub memory_allocated: u64,
    pub memory_used: u64,
    pub memory_available: u64,
    pub memory_alignment_loss: u64,
}

impl MemoryStats {
    pub const FIELDS: [&'static str; 6] = [
        "pages allocated",
        "pages used",
        "memory allocated (bytes)",
        "memory used (bytes)",
        "memory available (bytes)",
        "memory alignment loss (bytes)",
    ];

    pub fn accumulate(&mut self, other: &MemoryStats) {
        self.pages_allocated += other.pages_allocated;
        self.pages_used += other.pages_used;
        self.memory_allocated += other.memory_allocated;
        self.memory_used += other.memory_used;
        self.memory_available += other.memory_available;
        self.memory_alignment_loss += other.memory_alignment_loss;
    }

    /// The counters in the order of [`MemoryStats::FIELDS`].
    pub fn to_array(&self) -> [u64; 6] {
        [
            self.pages_allocated,
            self.pages_used,
            self.memory_allocated,
            self.memory_used,
            self.memory_available,
            self.memory_alignment_loss,
        ]
    }
}

/// Live counters of one page manager. They are updated by the owning thread
/// and may be read from any thread, e.g. while dumping statistics after an
/// allocation failure, without locking the manager.
#[derive(Debug, Default)]
pub struct PageManagerCounters {
    pages_allocated: AtomicU64,
    pages_used: AtomicU64,
    memory_allocated: AtomicU64,
    memory_used: AtomicU64,
    alignment_loss: AtomicU64,
}

impl PageManagerCounters {
    pub fn snapshot(&self) -> MemoryStats {
        let memory_allocated = self.memory_allocated.load(Ordering::Relaxed);
        let memory_used = self.memory_used.load(Ordering::Relaxed);
        MemoryStats {
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_used: self.pages_used.load(Ordering::Relaxed),
            memory_allocated,
            memory_used,
            memory_available: memory_allocated.saturating_sub(memory_used),
            memory_alignment_loss: self.alignment_loss.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn page_added(&self, order: u64, capacity: u64) {
        self.pages_allocated.fetch_add(order, Ordering::Relaxed);
        self.memory_allocated.fetch_add(capacity, Ordering::Relaxed);
    }

    pub(crate) fn page_touched(&self, order: u64) {
        self.pages_used.fetch_add(order, Ordering::Relaxed);
    }

    pub(crate) fn page_untouched(&self, order: u64) {
        self.pages_used.fetch_sub(order, Ordering::Relaxed);
    }

    pub(crate) fn grabbed(&self, bytes: u64, padding: u64) {
        self.memory_used.fetch_add(bytes, Ordering::Relaxed);
        self.alignment_loss.fetch_add(padding, Ordering::Relaxed);
    }

    pub(crate) fn released(&self, bytes: u64, padding: u64) {
        self.memory_used.fetch_sub(bytes, Ordering::Relaxed);
        self.alignment_loss.fetch_sub(padding, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.pages_allocated.store(0, Ordering::Relaxed);
        self.pages_used.store(0, Ordering::Relaxed);
        self.memory_allocated.store(0, Ordering::Relaxed);
        self.memory_used.store(0, Ordering::Relaxed);
        self.alignment_loss.store(0, Ordering::Relaxed);
    }
}
