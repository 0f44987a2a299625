// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Paradigm, SourceFileDef, StringDef};
use crate::definitions::codec::{wire_enum, Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
    RewriteError,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

wire_enum! {
    pub enum RegionType {
        Function = 0,
        Loop = 1,
        Code = 2,
        Phase = 3,
        Wrapper = 4,
        Barrier = 5,
        Parallel = 6,
        Task = 7,
    }
}

/// An instrumented code region.
///
/// Two regions are the same region when everything but `group_name` agrees.
/// The group is assigned after creation with
/// [DefinitionManager::set_region_group] and decides which synthesized
/// region group the region joins during unification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionDef {
    pub name: Handle<StringDef>,
    pub canonical_name: Handle<StringDef>,
    pub description: Handle<StringDef>,
    pub region_type: RegionType,
    pub paradigm: Paradigm,
    pub file_name: Handle<SourceFileDef>,
    pub begin_line: u32,
    pub end_line: u32,
    pub group_name: Handle<StringDef>,
}

/// The identifying fields of a new region.
#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    pub name: Handle<StringDef>,
    /// Defaults to `name` when null.
    pub canonical_name: Handle<StringDef>,
    pub description: Handle<StringDef>,
    pub region_type: RegionType,
    pub paradigm: Paradigm,
    pub file_name: Handle<SourceFileDef>,
    pub begin_line: u32,
    pub end_line: u32,
}

impl Default for RegionInfo {
    fn default() -> Self {
        Self {
            name: Handle::NULL,
            canonical_name: Handle::NULL,
            description: Handle::NULL,
            region_type: RegionType::Function,
            paradigm: Paradigm::User,
            file_name: Handle::NULL,
            begin_line: 0,
            end_line: 0,
        }
    }
}

impl Definition for RegionDef {
    const KIND: DefinitionKind = DefinitionKind::Region;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        out.handle(self.canonical_name);
        out.handle(self.description);
        self.region_type.encode(out);
        self.paradigm.encode(out);
        out.handle(self.file_name);
        out.u32(self.begin_line);
        out.u32(self.end_line);
        out.handle(self.group_name);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            canonical_name: input.handle()?,
            description: input.handle()?,
            region_type: RegionType::decode(input)?,
            paradigm: Paradigm::decode(input)?,
            file_name: input.handle()?,
            begin_line: input.u32()?,
            end_line: input.u32()?,
            group_name: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.reference(self.canonical_name);
        state.reference(self.description);
        state.write(&self.region_type);
        state.write(&self.paradigm);
        state.reference(self.file_name);
        state.write(&self.begin_line);
        state.write(&self.end_line);
    }

    fn equals(&self, other: &Self) -> bool {
        self.name == other.name
            && self.canonical_name == other.canonical_name
            && self.description == other.description
            && self.region_type == other.region_type
            && self.paradigm == other.paradigm
            && self.file_name == other.file_name
            && self.begin_line == other.begin_line
            && self.end_line == other.end_line
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            canonical_name: translate(source, self.canonical_name)?,
            description: translate(source, self.description)?,
            file_name: translate(source, self.file_name)?,
            group_name: translate(source, self.group_name)?,
            ..*self
        })
    }

    fn merge_duplicate(&self, existing: &mut Self) -> bool {
        if existing.group_name.is_null() && !self.group_name.is_null() {
            existing.group_name = self.group_name;
            return true;
        }
        false
    }
}

impl DefinitionManager {
    pub fn new_region(&mut self, info: RegionInfo) -> Result<Handle<RegionDef>, AllocError> {
        let canonical_name = if info.canonical_name.is_null() {
            info.name
        } else {
            info.canonical_name
        };
        self.add(RegionDef {
            name: info.name,
            canonical_name,
            description: info.description,
            region_type: info.region_type,
            paradigm: info.paradigm,
            file_name: info.file_name,
            begin_line: info.begin_line,
            end_line: info.end_line,
            group_name: Handle::NULL,
        })
    }

    /// Assigns the group `region` is clustered into during unification.
    pub fn set_region_group(
        &mut self,
        region: Handle<RegionDef>,
        group_name: Handle<StringDef>,
    ) -> Result<(), RewriteError> {
        self.rewrite(region, |region| region.group_name = group_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmeasure_alloc::{PageAllocator, PageManager};

    #[test]
    fn group_name_is_not_part_of_the_key() {
        let allocator = PageAllocator::new(1 << 20, 4096).unwrap();
        let mut defs = DefinitionManager::new(PageManager::new(&allocator).unwrap(), false);
        let name = defs.new_string("MPI_Send").unwrap();
        let group = defs.new_string("MPI").unwrap();
        let info = RegionInfo {
            name,
            paradigm: Paradigm::Mpi,
            ..RegionInfo::default()
        };
        let region = defs.new_region(info).unwrap();
        assert_eq!(defs.get(region).unwrap().canonical_name, name);

        defs.set_region_group(region, group).unwrap();
        assert_eq!(defs.new_region(info).unwrap(), region);
        assert_eq!(defs.get(region).unwrap().group_name, group);
        assert_eq!(defs.counter(DefinitionKind::Region), 1);
    }
}
