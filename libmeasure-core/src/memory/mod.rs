// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The memory budget of a measurement: one page allocator, the page managers
//! drawing from it, and what happens when it runs dry.

mod location;
mod stats;

pub use location::LocationMemory;
pub use stats::MemoryReport;

use crate::definitions::DefinitionManager;
use libmeasure_alloc::{AllocatorError, PageAllocator, PageManager, PageManagerCounters};
use libmeasure_common::config::ENV_TOTAL_MEMORY;
use libmeasure_common::{Fatal, MemoryConfig};
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// What the pages of a page manager are used for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemoryClass {
    Misc,
    Definitions,
    Profiling,
    TracingEvents,
}

impl MemoryClass {
    pub const ALL: [MemoryClass; 4] = [
        MemoryClass::Misc,
        MemoryClass::Definitions,
        MemoryClass::Profiling,
        MemoryClass::TracingEvents,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            MemoryClass::Misc => "misc",
            MemoryClass::Definitions => "definitions",
            MemoryClass::Profiling => "profiling",
            MemoryClass::TracingEvents => "tracing events",
        }
    }
}

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The memory subsystem of one process. Creating it reserves the whole
/// budget, dropping it releases the budget again once every page manager
/// created from it is gone.
pub struct Memory {
    config: MemoryConfig,
    allocator: Arc<PageAllocator>,
    registry: Mutex<Vec<(MemoryClass, Weak<PageManagerCounters>)>>,
    out_of_memory: AtomicBool,
    n_locations: AtomicU32,
}

impl Memory {
    pub fn new(config: MemoryConfig) -> Result<Arc<Self>, AllocatorError> {
        let config = config.normalized();
        let allocator = PageAllocator::new(config.total_memory, config.page_size)?;
        debug!(
            total_memory = config.total_memory,
            page_size = allocator.page_size(),
            n_pages = allocator.n_pages(),
            maintenance_pages = allocator.maintenance_pages(),
            "Memory initialized"
        );
        Ok(Arc::new(Self {
            config,
            allocator,
            registry: Mutex::new(Vec::new()),
            out_of_memory: AtomicBool::new(false),
            n_locations: AtomicU32::new(0),
        }))
    }

    /// Reads the configuration from the environment.
    pub fn from_env() -> anyhow::Result<Arc<Self>> {
        Ok(Self::new(MemoryConfig::from_env()?)?)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<PageAllocator> {
        &self.allocator
    }

    pub fn number_of_locations(&self) -> u32 {
        self.n_locations.load(Ordering::Relaxed)
    }

    fn register(&self, class: MemoryClass, page_manager: &PageManager) {
        let mut registry = self.registry.lock();
        registry.retain(|(_, counters)| counters.strong_count() > 0);
        registry.push((class, Arc::downgrade(page_manager.counters())));
    }

    /// Creates a page manager whose usage is reported under `class`.
    pub fn create_page_manager(&self, class: MemoryClass) -> Result<PageManager, Fatal> {
        let page_manager =
            PageManager::new(&self.allocator).map_err(|_| self.handle_out_of_memory())?;
        self.register(class, &page_manager);
        Ok(page_manager)
    }

    /// Creates a page manager for trace buffers. Only managers `for_events`
    /// show up in the statistics.
    pub fn create_tracing_page_manager(&self, for_events: bool) -> Result<PageManager, Fatal> {
        let page_manager =
            PageManager::new(&self.allocator).map_err(|_| self.handle_out_of_memory())?;
        if for_events {
            self.register(MemoryClass::TracingEvents, &page_manager);
        }
        Ok(page_manager)
    }

    pub fn delete_tracing_page_manager(&self, page_manager: PageManager) {
        let counters = Arc::downgrade(page_manager.counters());
        self.registry
            .lock()
            .retain(|(_, registered)| !registered.ptr_eq(&counters));
        drop(page_manager);
    }

    /// Creates an empty page manager receiving pages moved from elsewhere.
    pub fn create_moved_page_manager(&self) -> PageManager {
        PageManager::new_moved(&self.allocator)
    }

    /// Creates the memory of a new location. Its page managers are created
    /// on first use.
    pub fn new_location_memory(self: &Arc<Self>) -> LocationMemory {
        self.n_locations.fetch_add(1, Ordering::Relaxed);
        LocationMemory::new(self.clone())
    }

    /// Returns the pages of `definitions` to the budget. The registry stays
    /// usable for its statistics.
    pub fn free_definition_memory(&self, definitions: &mut DefinitionManager) {
        definitions.free_memory();
    }

    /// Reports an exhausted budget on stderr, see
    /// [Memory::handle_out_of_memory_to].
    #[cold]
    pub fn handle_out_of_memory(&self) -> Fatal {
        self.handle_out_of_memory_to(&mut std::io::stderr().lock())
    }

    /// The first caller writes the configuration and the memory statistics to
    /// `out`. Every caller gets the fatal error to terminate with, but only
    /// the first one has not reported it yet.
    #[cold]
    pub fn handle_out_of_memory_to(&self, out: &mut dyn Write) -> Fatal {
        if self
            .out_of_memory
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Fatal::out_of_memory("memory budget exhausted").reported();
        }
        error!(
            total_memory = self.config.total_memory,
            page_size = self.config.page_size,
            "Memory budget exhausted"
        );
        let report = self.collect_stats();
        let _ = writeln!(
            out,
            "[measure] Out of memory. Please increase {ENV_TOTAL_MEMORY} and try again."
        );
        let _ = writeln!(
            out,
            "[measure] Total memory: {} bytes, page size: {} bytes, {} locations",
            self.config.total_memory,
            self.allocator.page_size(),
            self.number_of_locations()
        );
        let _ = report.write_to(out);
        let _ = out.flush();
        Fatal::out_of_memory(format!(
            "memory budget of {} bytes exhausted",
            self.config.total_memory
        ))
    }
}
