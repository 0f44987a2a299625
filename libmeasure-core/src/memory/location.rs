// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Memory, MemoryClass};
use core::ptr::NonNull;
use libmeasure_alloc::{MemoryStats, MovableMemory, PageManager, ALIGNMENT};
use libmeasure_common::Fatal;
use std::sync::Arc;

/// The page managers of one location, one per memory class. A location is
/// used by a single thread, so allocating needs no lock.
pub struct LocationMemory {
    memory: Arc<Memory>,
    misc: Option<PageManager>,
    definitions: Option<PageManager>,
    profiling: Option<PageManager>,
}

impl LocationMemory {
    pub(super) fn new(memory: Arc<Memory>) -> Self {
        Self {
            memory,
            misc: None,
            definitions: None,
            profiling: None,
        }
    }

    fn page_manager(&mut self, class: MemoryClass) -> Result<&mut PageManager, Fatal> {
        let slot = match class {
            MemoryClass::Misc => &mut self.misc,
            MemoryClass::Definitions => &mut self.definitions,
            MemoryClass::Profiling => &mut self.profiling,
            MemoryClass::TracingEvents => {
                return Err(Fatal::contract_violation(
                    "trace buffers are not location memory",
                ))
            }
        };
        if slot.is_none() {
            *slot = Some(self.memory.create_page_manager(class)?);
        }
        slot.as_mut()
            .ok_or_else(|| Fatal::contract_violation("location page manager vanished"))
    }

    fn alloc(&mut self, class: MemoryClass, size: usize) -> Result<NonNull<[u8]>, Fatal> {
        let memory = self.memory.clone();
        self.page_manager(class)?
            .alloc(size)
            .map_err(|_| memory.handle_out_of_memory())
    }

    pub fn alloc_for_misc(&mut self, size: usize) -> Result<NonNull<[u8]>, Fatal> {
        self.alloc(MemoryClass::Misc, size)
    }

    pub fn aligned_alloc_for_misc(
        &mut self,
        alignment: usize,
        size: usize,
    ) -> Result<NonNull<[u8]>, Fatal> {
        let page_size = self.memory.allocator().page_size();
        if !alignment.is_power_of_two() || alignment > page_size {
            return Err(Fatal::contract_violation(format!(
                "alignment {alignment} is not a power of two up to the page size {page_size}"
            )));
        }
        let memory = self.memory.clone();
        self.page_manager(MemoryClass::Misc)?
            .aligned_alloc(alignment.max(ALIGNMENT), size)
            .map_err(|_| memory.handle_out_of_memory())
    }

    pub fn alloc_for_profile(&mut self, size: usize) -> Result<NonNull<[u8]>, Fatal> {
        self.alloc(MemoryClass::Profiling, size)
    }

    pub fn alloc_for_definitions(&mut self, size: usize) -> Result<MovableMemory, Fatal> {
        let memory = self.memory.clone();
        self.page_manager(MemoryClass::Definitions)?
            .alloc_movable(size)
            .map_err(|_| memory.handle_out_of_memory())
    }

    /// The page manager `alloc_for_definitions` handles resolve against.
    pub fn definitions(&self) -> Option<&PageManager> {
        self.definitions.as_ref()
    }

    pub fn free_misc(&mut self) {
        if let Some(misc) = self.misc.as_mut() {
            misc.free();
        }
    }

    pub fn free_profile(&mut self) {
        if let Some(profiling) = self.profiling.as_mut() {
            profiling.free();
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        for page_manager in [&self.misc, &self.definitions, &self.profiling]
            .into_iter()
            .flatten()
        {
            stats.accumulate(&page_manager.stats());
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmeasure_common::{FatalKind, MemoryConfig};

    #[test]
    fn classes_are_created_on_demand() {
        let memory = Memory::new(MemoryConfig::new(64 * 1024, 1024)).unwrap();
        let mut location = memory.new_location_memory();
        assert_eq!(memory.number_of_locations(), 1);
        assert_eq!(location.stats(), MemoryStats::default());

        location.alloc_for_misc(24).unwrap();
        location.aligned_alloc_for_misc(64, 8).unwrap();
        let handle = location.alloc_for_definitions(16).unwrap();
        assert!(location.definitions().unwrap().address(handle).is_some());
        assert_eq!(location.stats().pages_allocated, 2);

        location.alloc_for_profile(100).unwrap();
        assert_eq!(location.stats().pages_allocated, 3);

        location.free_misc();
        location.free_profile();
        assert_eq!(location.stats().pages_allocated, 1);
        assert_eq!(memory.allocator().stats().pages.pages_used, 1);
    }

    #[test]
    fn bad_alignment_is_a_contract_violation() {
        let memory = Memory::new(MemoryConfig::new(64 * 1024, 1024)).unwrap();
        let mut location = memory.new_location_memory();
        let fatal = location.aligned_alloc_for_misc(3, 8).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::ContractViolation);
        let fatal = location.aligned_alloc_for_misc(4096, 8).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::ContractViolation);
    }

    #[test]
    fn oversized_requests_are_out_of_memory() {
        let memory = Memory::new(MemoryConfig::new(8 * 1024, 1024)).unwrap();
        let mut location = memory.new_location_memory();
        let fatal = location.alloc_for_profile(64 * 1024).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::OutOfMemory);
    }

    #[test]
    fn concurrent_exhaustion_is_reported_once() {
        let memory = Memory::new(MemoryConfig::new(8 * 512, 512)).unwrap();
        let fatals: Vec<Fatal> = (0..2)
            .map(|_| {
                let memory = memory.clone();
                std::thread::spawn(move || {
                    let mut location = memory.new_location_memory();
                    location.alloc_for_misc(64 * 512).unwrap_err()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert!(fatals
            .iter()
            .all(|fatal| fatal.kind() == FatalKind::OutOfMemory));
        assert_eq!(fatals.iter().filter(|fatal| !fatal.is_reported()).count(), 1);
        assert_eq!(memory.number_of_locations(), 2);
    }
}
