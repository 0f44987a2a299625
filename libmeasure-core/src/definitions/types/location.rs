// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{StringDef, SystemTreeNodeDef};
use crate::definitions::codec::{wire_enum, Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

wire_enum! {
    pub enum LocationGroupType {
        Process = 0,
        Accelerator = 1,
    }
}

wire_enum! {
    pub enum LocationType {
        CpuThread = 0,
        Gpu = 1,
        Metric = 2,
    }
}

/// A process, or an accelerator context, owning locations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LocationGroupDef {
    pub name: Handle<StringDef>,
    pub group_type: LocationGroupType,
    pub system_tree_parent: Handle<SystemTreeNodeDef>,
}

impl Definition for LocationGroupDef {
    const KIND: DefinitionKind = DefinitionKind::LocationGroup;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        self.group_type.encode(out);
        out.handle(self.system_tree_parent);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            group_type: LocationGroupType::decode(input)?,
            system_tree_parent: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.write(&self.group_type);
        state.reference(self.system_tree_parent);
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            system_tree_parent: translate(source, self.system_tree_parent)?,
            ..*self
        })
    }
}

/// A thread, GPU stream or metric source recording events. Its global id is
/// derived from its local sequence number and the rank, so two locations
/// never compare equal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LocationDef {
    pub name: Handle<StringDef>,
    pub location_type: LocationType,
    pub location_group: Handle<LocationGroupDef>,
    pub number_of_events: u64,
}

impl Definition for LocationDef {
    const KIND: DefinitionKind = DefinitionKind::Location;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        self.location_type.encode(out);
        out.handle(self.location_group);
        out.u64(self.number_of_events);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            location_type: LocationType::decode(input)?,
            location_group: input.handle()?,
            number_of_events: input.u64()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.write(&self.location_type);
        state.reference(self.location_group);
    }

    fn equals(&self, _other: &Self) -> bool {
        false
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            location_group: translate(source, self.location_group)?,
            ..*self
        })
    }
}

impl DefinitionManager {
    pub fn new_location_group(
        &mut self,
        name: Handle<StringDef>,
        group_type: LocationGroupType,
        system_tree_parent: Handle<SystemTreeNodeDef>,
    ) -> Result<Handle<LocationGroupDef>, AllocError> {
        self.add(LocationGroupDef {
            name,
            group_type,
            system_tree_parent,
        })
    }

    pub fn new_location(
        &mut self,
        name: Handle<StringDef>,
        location_type: LocationType,
        location_group: Handle<LocationGroupDef>,
    ) -> Result<Handle<LocationDef>, AllocError> {
        self.add(LocationDef {
            name,
            location_type,
            location_group,
            number_of_events: 0,
        })
    }
}
