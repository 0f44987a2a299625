// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::definitions::{DefinitionKind, DefinitionManager};
use crate::ipc::Ipc;
use crate::memory::{Memory, MemoryClass};
use crate::unify::{self, mpp, post, Subsystem, UnifyPhase};
use libmeasure_alloc::AllocError;
use libmeasure_common::{ensure_contract, Fatal};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// The definitions of one process of a measurement run, from recording to
/// the published unified set.
///
/// Recording may happen from any thread through [Measurement::define].
/// [Measurement::unify] is collective: every rank of the [Ipc] has to call it.
pub struct Measurement {
    memory: Arc<Memory>,
    ipc: Arc<dyn Ipc>,
    definitions: Mutex<DefinitionManager>,
    unified: Option<DefinitionManager>,
    subsystems: Vec<Box<dyn Subsystem>>,
    phase: UnifyPhase,
    comm_location_offset: Option<u32>,
}

impl Measurement {
    /// Sets up the local definitions. The empty string is always the first
    /// string defined.
    pub fn new(memory: Arc<Memory>, ipc: Arc<dyn Ipc>) -> Result<Self, Fatal> {
        let page_manager = memory.create_page_manager(MemoryClass::Definitions)?;
        let mut definitions = DefinitionManager::new(page_manager, false);
        definitions
            .new_string("")
            .map_err(|_| memory.handle_out_of_memory())?;
        debug!(rank = ipc.rank(), size = ipc.size(), "Measurement created");
        Ok(Self {
            memory,
            ipc,
            definitions: Mutex::new(definitions),
            unified: None,
            subsystems: Vec::new(),
            phase: UnifyPhase::Recording,
            comm_location_offset: None,
        })
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn ipc(&self) -> &dyn Ipc {
        &*self.ipc
    }

    pub fn phase(&self) -> UnifyPhase {
        self.phase
    }

    /// Runs `f` on the local definitions under the registry lock. Running out
    /// of memory in `f` is fatal.
    pub fn define<R>(
        &self,
        f: impl FnOnce(&mut DefinitionManager) -> Result<R, AllocError>,
    ) -> Result<R, Fatal> {
        ensure_contract!(
            self.phase == UnifyPhase::Recording,
            "definitions cannot be added once unification has started"
        );
        let mut definitions = self.definitions.lock();
        f(&mut definitions).map_err(|_| self.memory.handle_out_of_memory())
    }

    pub fn register_subsystem(&mut self, subsystem: Box<dyn Subsystem>) {
        self.subsystems.push(subsystem);
    }

    /// The local definitions. After unification they carry the mappings.
    pub fn local(&mut self) -> &DefinitionManager {
        self.definitions.get_mut()
    }

    /// The published definitions, once unified.
    pub fn unified(&self) -> Option<&DefinitionManager> {
        self.unified.as_ref()
    }

    /// Maps local sequence numbers of `kind` to global ones, once unified.
    pub fn mapping(&mut self, kind: DefinitionKind) -> Option<&[u32]> {
        self.definitions.get_mut().mapping(kind)
    }

    /// Maps local location sequence numbers to global location ids, once
    /// unified.
    pub fn location_mapping(&mut self) -> Option<&[u64]> {
        self.definitions.get_mut().location_mapping()
    }

    /// Where the locations of this process start in the group of all
    /// locations. Set by a multi-process unification.
    pub fn comm_location_offset(&self) -> Option<u32> {
        self.comm_location_offset
    }

    /// Unifies the definitions of all processes. Has to be called exactly
    /// once, by every rank.
    pub fn unify(&mut self) -> Result<(), Fatal> {
        ensure_contract!(
            self.phase == UnifyPhase::Recording,
            "definitions are unified already (phase {})",
            self.phase
        );
        let memory = self.memory.clone();
        let ipc = self.ipc.clone();
        let rank = ipc.rank();
        info!(rank, size = ipc.size(), "Unifying definitions");

        let mut unified =
            DefinitionManager::new(memory.create_page_manager(MemoryClass::Definitions)?, true);
        unified
            .new_string("")
            .map_err(|_| memory.handle_out_of_memory())?;

        let local = self.definitions.get_mut();
        self.phase = UnifyPhase::PreUnify;
        for subsystem in &mut self.subsystems {
            subsystem.pre_unify(local).map_err(|error| {
                Fatal::contract_violation(format!(
                    "{} failed before unification: {error:#}",
                    subsystem.name()
                ))
            })?;
        }

        self.phase = UnifyPhase::InterimResolution;
        unify::resolve_interim_definitions(&memory, local)?;

        self.phase = UnifyPhase::LocalDedup;
        unify::copy_definitions_to_unified(&memory, local, &mut unified)?;
        unify::create_location_mapping(local, rank);

        self.phase = UnifyPhase::CrossProcessMerge;
        let tree = mpp::merge_up(&memory, &*ipc, &mut unified)?;
        if ipc.is_multi_process() {
            self.comm_location_offset =
                Some(mpp::define_comm_locations(&memory, &*ipc, local, &mut unified)?);
        }

        self.phase = UnifyPhase::PostProcess;
        if rank == 0 {
            post::backfill_empty_names(&memory, &mut unified)?;
            post::create_region_groups(&mut unified)
                .map_err(|_| memory.handle_out_of_memory())?;
        }
        let unified = mpp::distribute(&memory, &*ipc, tree, local, unified)?;

        unify::create_definition_mappings(local);
        unify::assign_definition_mappings_from_unified(local, &unified)?;
        unify::create_interim_comm_mapping(local);

        for subsystem in &mut self.subsystems {
            subsystem.post_unify(&unified, local).map_err(|error| {
                Fatal::contract_violation(format!(
                    "{} failed after unification: {error:#}",
                    subsystem.name()
                ))
            })?;
        }
        info!(
            rank,
            strings = unified.counter(DefinitionKind::String),
            regions = unified.counter(DefinitionKind::Region),
            locations = unified.counter(DefinitionKind::Location),
            "Definitions unified"
        );
        self.unified = Some(unified);
        self.phase = UnifyPhase::Published;
        Ok(())
    }

    /// Writes the memory statistics as configured, collectively, and releases
    /// the definitions.
    pub fn finalize(mut self, message: &str) -> Result<(), Fatal> {
        let mode = self.memory.config().stats_mode;
        self.memory.dump_stats(
            message,
            mode,
            &*self.ipc,
            &mut std::io::stderr().lock(),
        )?;
        let definitions = self.definitions.get_mut();
        unify::destroy_definition_mappings(definitions);
        self.memory.free_definition_memory(definitions);
        if let Some(unified) = self.unified.as_mut() {
            self.memory.free_definition_memory(unified);
        }
        Ok(())
    }
}
