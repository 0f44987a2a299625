// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unification turns the definitions every process recorded on its own into
//! one deduplicated set with dense global sequence numbers, shared by all
//! processes, plus per-process mappings from local to global numbers.

pub mod local;
pub mod mpp;
pub mod post;

use crate::definitions::DefinitionManager;
use std::fmt;

pub use local::{
    assign_definition_mappings_from_unified, copy_definitions_to_unified,
    create_definition_mappings, create_interim_comm_mapping, create_location_mapping,
    destroy_definition_mappings, resolve_interim_definitions,
};

/// The steps of a measurement's definitions, in the order they happen.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum UnifyPhase {
    Recording,
    PreUnify,
    InterimResolution,
    LocalDedup,
    CrossProcessMerge,
    PostProcess,
    Published,
}

impl fmt::Display for UnifyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A part of the runtime which gets to see the definitions right before and
/// right after unification. An error from either hook ends the measurement.
pub trait Subsystem: Send {
    fn name(&self) -> &str;

    /// Last chance to add or complete local definitions.
    fn pre_unify(&mut self, definitions: &mut DefinitionManager) -> anyhow::Result<()> {
        let _ = definitions;
        Ok(())
    }

    /// Called with the published definitions. `local` carries the mappings.
    fn post_unify(
        &mut self,
        unified: &DefinitionManager,
        local: &DefinitionManager,
    ) -> anyhow::Result<()> {
        let _ = (unified, local);
        Ok(())
    }
}
