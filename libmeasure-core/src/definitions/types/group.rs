// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Paradigm, StringDef};
use crate::definitions::codec::{wire_enum, Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

wire_enum! {
    pub enum GroupType {
        Unknown = 0,
        Locations = 1,
        Regions = 2,
        Metric = 3,
        CommLocations = 4,
        CommGroup = 5,
        CommSelf = 6,
    }
}

/// A named set of ids. What the members are ids of follows from the group
/// type: global location ids, region ids, or ranks of a communicator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupDef {
    pub name: Handle<StringDef>,
    pub group_type: GroupType,
    pub paradigm: Paradigm,
    pub flags: u32,
    pub members: Vec<u64>,
}

impl Definition for GroupDef {
    const KIND: DefinitionKind = DefinitionKind::Group;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        self.group_type.encode(out);
        self.paradigm.encode(out);
        out.u32(self.flags);
        out.u64_slice(&self.members);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            group_type: GroupType::decode(input)?,
            paradigm: Paradigm::decode(input)?,
            flags: input.u32()?,
            members: input.u64_vec()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.write(&self.group_type);
        state.write(&self.paradigm);
        state.write(&self.flags);
        state.write(self.members.as_slice());
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            ..self.clone()
        })
    }
}

impl DefinitionManager {
    pub fn new_group(
        &mut self,
        group_type: GroupType,
        name: Handle<StringDef>,
        paradigm: Paradigm,
        flags: u32,
        members: &[u64],
    ) -> Result<Handle<GroupDef>, AllocError> {
        self.add(GroupDef {
            name,
            group_type,
            paradigm,
            flags,
            members: members.to_vec(),
        })
    }
}
