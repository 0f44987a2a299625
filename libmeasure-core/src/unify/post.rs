// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Completes the merged definitions at the root, before they are published.

use crate::definitions::*;
use crate::memory::Memory;
use indexmap::IndexMap;
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use tracing::debug;

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Records whose name may be left out while recording.
trait Named: Definition {
    fn name_mut(&mut self) -> &mut Handle<StringDef>;
}

impl Named for GroupDef {
    fn name_mut(&mut self) -> &mut Handle<StringDef> {
        &mut self.name
    }
}

impl Named for CommunicatorDef {
    fn name_mut(&mut self) -> &mut Handle<StringDef> {
        &mut self.name
    }
}

impl Named for RmaWindowDef {
    fn name_mut(&mut self) -> &mut Handle<StringDef> {
        &mut self.name
    }
}

/// Names every unnamed group, communicator and RMA window with the empty
/// string.
pub fn backfill_empty_names(
    memory: &Memory,
    unified: &mut DefinitionManager,
) -> Result<(), Fatal> {
    let empty = unified
        .handle_at::<StringDef>(0)
        .filter(|handle| unified.string(*handle).is_some_and(|value| value.is_empty()))
        .ok_or_else(|| Fatal::contract_violation("the first unified string is not empty"))?;
    backfill::<GroupDef>(memory, unified, empty)?;
    backfill::<CommunicatorDef>(memory, unified, empty)?;
    backfill::<RmaWindowDef>(memory, unified, empty)
}

fn backfill<T: Named>(
    memory: &Memory,
    unified: &mut DefinitionManager,
    empty: Handle<StringDef>,
) -> Result<(), Fatal> {
    let unnamed: Vec<Handle<T>> = unified
        .iter::<T>()
        .filter_map(|(handle, mut definition)| definition.name_mut().is_null().then_some(handle))
        .collect();
    // A backfilled record may now equal one which was named "" from the
    // start. Both stay in the table and keep their sequence numbers.
    for handle in &unnamed {
        unified
            .rewrite(*handle, |definition| *definition.name_mut() = empty)
            .map_err(|error| error.into_fatal(memory))?;
    }
    if !unnamed.is_empty() {
        debug!(kind = %T::KIND, count = unnamed.len(), "Named unnamed definitions");
    }
    Ok(())
}

/// Groups the regions by their group name and paradigm. Each group becomes
/// a [GroupType::Regions] group, named like the group and listing the
/// sequence numbers of its regions, in order of first appearance.
pub fn create_region_groups(unified: &mut DefinitionManager) -> Result<(), AllocError> {
    let mut groups: FxIndexMap<(Handle<StringDef>, Paradigm), Vec<u64>> = FxIndexMap::default();
    for (handle, region) in unified.iter::<RegionDef>() {
        if region.group_name.is_null() {
            continue;
        }
        groups
            .entry((region.group_name, region.paradigm))
            .or_default()
            .push(u64::from(unified.handle_to_id(handle)));
    }
    for ((name, paradigm), members) in &groups {
        unified.new_group(GroupType::Regions, *name, *paradigm, 0, members)?;
    }
    debug!(groups = groups.len(), "Created region groups");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Memory, MemoryClass};
    use libmeasure_common::MemoryConfig;

    fn unified() -> (std::sync::Arc<Memory>, DefinitionManager) {
        let memory = Memory::new(MemoryConfig::new(1 << 20, 4096)).unwrap();
        let page_manager = memory.create_page_manager(MemoryClass::Definitions).unwrap();
        let mut unified = DefinitionManager::new(page_manager, true);
        unified.new_string("").unwrap();
        (memory, unified)
    }

    #[test]
    fn unnamed_definitions_get_the_empty_name() {
        let (memory, mut unified) = unified();
        let name = unified.new_string("world").unwrap();
        let unnamed = unified
            .new_communicator(Handle::NULL, Handle::NULL, Handle::NULL, 0)
            .unwrap();
        let named = unified
            .new_communicator(name, Handle::NULL, Handle::NULL, 0)
            .unwrap();
        let window = unified
            .new_rma_window(Handle::NULL, CommRef::Resolved(named), 1, 0)
            .unwrap();

        backfill_empty_names(&memory, &mut unified).unwrap();
        let empty = unified.handle_at::<StringDef>(0).unwrap();
        assert_eq!(unified.get(unnamed).unwrap().name, empty);
        assert_eq!(unified.get(named).unwrap().name, name);
        assert_eq!(unified.get(window).unwrap().name, empty);
        // Still found after rehashing.
        let again = unified.new_communicator(empty, Handle::NULL, Handle::NULL, 0);
        assert_eq!(again.unwrap(), unnamed);
    }

    #[test]
    fn regions_are_grouped_by_name_and_paradigm() {
        let (_memory, mut unified) = unified();
        let mpi = unified.new_string("MPI").unwrap();
        let omp = unified.new_string("OMP").unwrap();
        let mut region = |name: &str, group: Handle<StringDef>, paradigm| {
            let name = unified.new_string(name).unwrap();
            let handle = unified
                .new_region(RegionInfo {
                    name,
                    paradigm,
                    ..Default::default()
                })
                .unwrap();
            if !group.is_null() {
                unified.set_region_group(handle, group).unwrap();
            }
        };
        region("MPI_Send", mpi, Paradigm::Mpi);
        region("!$omp parallel", omp, Paradigm::OpenMp);
        region("main", Handle::NULL, Paradigm::User);
        region("MPI_Recv", mpi, Paradigm::Mpi);

        create_region_groups(&mut unified).unwrap();
        let groups: Vec<GroupDef> = unified
            .iter::<GroupDef>()
            .map(|(_, group)| group)
            .filter(|group| group.group_type == GroupType::Regions)
            .collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, mpi);
        assert_eq!(groups[0].paradigm, Paradigm::Mpi);
        assert_eq!(groups[0].members, vec![0, 3]);
        assert_eq!(groups[1].name, omp);
        assert_eq!(groups[1].members, vec![1]);
    }
}
