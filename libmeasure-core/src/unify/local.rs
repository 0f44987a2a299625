// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The steps of unification which stay within one process.

use crate::definitions::*;
use crate::memory::Memory;
use libmeasure_alloc::MovableMemory;
use libmeasure_common::{ensure_contract, Fatal};
use tracing::debug;

type CopyFn = fn(&Memory, &mut DefinitionManager, &mut DefinitionManager) -> Result<(), Fatal>;

/// How to copy each kind, in [DefinitionKind::UNIFY_ORDER].
const COPIERS: [(DefinitionKind, CopyFn); DefinitionKind::UNIFY_ORDER.len()] = [
    (DefinitionKind::String, copy_all::<StringDef>),
    (DefinitionKind::SystemTreeNode, copy_all::<SystemTreeNodeDef>),
    (DefinitionKind::LocationGroup, copy_all::<LocationGroupDef>),
    (DefinitionKind::Location, copy_all::<LocationDef>),
    (DefinitionKind::SourceFile, copy_all::<SourceFileDef>),
    (DefinitionKind::Region, copy_all::<RegionDef>),
    (DefinitionKind::Group, copy_all::<GroupDef>),
    (DefinitionKind::Communicator, copy_all::<CommunicatorDef>),
    (DefinitionKind::RmaWindow, copy_all::<RmaWindowDef>),
    (DefinitionKind::Metric, copy_all::<MetricDef>),
    (DefinitionKind::Parameter, copy_all::<ParameterDef>),
    (DefinitionKind::Callpath, copy_all::<CallpathDef>),
    (DefinitionKind::CartesianTopology, copy_all::<CartesianTopologyDef>),
    (DefinitionKind::IoHandle, copy_all::<IoHandleDef>),
];

fn copy_all<T: Definition>(
    memory: &Memory,
    source: &mut DefinitionManager,
    unified: &mut DefinitionManager,
) -> Result<(), Fatal> {
    for sequence_number in 0..source.counter(T::KIND) {
        let Some(handle) = source.handle_at::<T>(sequence_number) else {
            break;
        };
        let Some(definition) = source.get(handle) else {
            return Err(Fatal::contract_violation(format!(
                "{} #{sequence_number} does not resolve",
                T::KIND
            )));
        };
        let translated = definition.unify(source)?;
        let target = unified
            .add(translated)
            .map_err(|_| memory.handle_out_of_memory())?;
        if !source.set_unified(handle, target) {
            return Err(Fatal::contract_violation(format!(
                "{} #{sequence_number} cannot record its unified counterpart",
                T::KIND
            )));
        }
    }
    Ok(())
}

/// Interns every definition of `source` into `unified`, kind by kind in
/// dependency order and within a kind in registration order, and points the
/// unified field of each source record to its counterpart.
pub fn copy_definitions_to_unified(
    memory: &Memory,
    source: &mut DefinitionManager,
    unified: &mut DefinitionManager,
) -> Result<(), Fatal> {
    for (kind, copy) in COPIERS {
        let before = unified.counter(kind);
        copy(memory, source, unified)?;
        debug!(
            %kind,
            source = source.counter(kind),
            added = unified.counter(kind) - before,
            "Copied definitions to unified"
        );
    }
    Ok(())
}

/// Allocates a mapping for every kind which has one, with every entry
/// [INVALID_ID] until assigned.
pub fn create_definition_mappings(definitions: &mut DefinitionManager) {
    for kind in DefinitionKind::ALL {
        if kind.has_mapping() {
            let counter = definitions.counter(kind) as usize;
            definitions.set_mapping(kind, Some(vec![INVALID_ID; counter]));
        }
    }
}

/// Fills the mappings from the unified fields: local sequence number `i`
/// maps to the sequence number, in `unified`, of the unified counterpart of
/// record `i`.
pub fn assign_definition_mappings_from_unified(
    definitions: &mut DefinitionManager,
    unified: &DefinitionManager,
) -> Result<(), Fatal> {
    for kind in DefinitionKind::ALL {
        if definitions.mapping(kind).is_none() {
            continue;
        }
        let mapping = definitions
            .entry(kind)
            .handles()
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                definitions
                    .unified_raw(*raw)
                    .and_then(|target| unified.sequence_number_of(target))
                    .ok_or_else(|| {
                        Fatal::contract_violation(format!("{kind} #{index} was not unified"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        definitions.set_mapping(kind, Some(mapping));
    }
    Ok(())
}

pub fn destroy_definition_mappings(definitions: &mut DefinitionManager) {
    for kind in DefinitionKind::ALL {
        definitions.set_mapping(kind, None);
    }
    definitions.set_location_mapping(None);
}

/// Global location ids carry the local sequence number in the upper and the
/// rank in the lower half, as two locations are never the same.
pub fn create_location_mapping(definitions: &mut DefinitionManager, rank: u32) {
    let counter = definitions.counter(DefinitionKind::Location);
    let mapping = (0..counter)
        .map(|sequence_number| (u64::from(sequence_number) << 32) | u64::from(rank))
        .collect();
    definitions.set_location_mapping(Some(mapping));
}

/// Replaces every interim communicator reference by the communicator the
/// interim communicator was resolved to, and rehashes the record.
pub fn resolve_interim_definitions(
    memory: &Memory,
    definitions: &mut DefinitionManager,
) -> Result<(), Fatal> {
    resolve_interim::<RmaWindowDef>(memory, definitions)?;
    resolve_interim::<CartesianTopologyDef>(memory, definitions)?;
    resolve_interim::<IoHandleDef>(memory, definitions)
}

fn resolve_interim<T: CommunicatorScoped>(
    memory: &Memory,
    definitions: &mut DefinitionManager,
) -> Result<(), Fatal> {
    ensure_contract!(
        !definitions.has_hash_table(T::KIND),
        "{} records were deduplicated before their communicators were known",
        T::KIND
    );
    let mut resolved = 0usize;
    for sequence_number in 0..definitions.counter(T::KIND) {
        let Some(handle) = definitions.handle_at::<T>(sequence_number) else {
            break;
        };
        let Some(mut definition) = definitions.get(handle) else {
            continue;
        };
        let CommRef::Interim(interim) = *definition.comm_ref() else {
            continue;
        };
        let Some(communicator) = definitions.resolved_communicator(interim) else {
            return Err(Fatal::contract_violation(format!(
                "{} #{sequence_number} references interim communicator {:?}, which was never resolved",
                T::KIND,
                interim.raw()
            )));
        };
        definitions
            .rewrite(handle, |definition| {
                *definition.comm_ref() = CommRef::Resolved(communicator)
            })
            .map_err(|error| error.into_fatal(memory))?;
        resolved += 1;
    }
    debug!(kind = %T::KIND, resolved, "Resolved interim communicators");
    Ok(())
}

/// Derives the mapping of interim communicators from the mapping of the
/// communicators they were resolved to. Unresolved ones map to
/// [INVALID_ID].
pub fn create_interim_comm_mapping(definitions: &mut DefinitionManager) {
    let Some(communicators) = definitions
        .mapping(DefinitionKind::Communicator)
        .map(<[u32]>::to_vec)
    else {
        return;
    };
    let mapping = definitions
        .entry(DefinitionKind::InterimCommunicator)
        .handles()
        .iter()
        .map(|raw| {
            definitions
                .resolved_communicator(Handle::from_raw(*raw))
                .and_then(|communicator| definitions.sequence_number_of(communicator.raw()))
                .and_then(|sequence_number| communicators.get(sequence_number as usize).copied())
                .unwrap_or(INVALID_ID)
        })
        .collect();
    definitions.set_mapping(DefinitionKind::InterimCommunicator, Some(mapping));
}

/// The sequence numbers in `unified` of the counterparts of every record of
/// `source`, per kind.
pub(crate) fn unified_sequence_numbers(
    source: &DefinitionManager,
    unified: &DefinitionManager,
) -> Result<Vec<Vec<u32>>, Fatal> {
    DefinitionKind::ALL
        .iter()
        .map(|kind| {
            source
                .entry(*kind)
                .handles()
                .iter()
                .map(|raw| {
                    source
                        .unified_raw(*raw)
                        .filter(|target: &MovableMemory| !target.is_null())
                        .and_then(|target| unified.sequence_number_of(target))
                        .ok_or_else(|| {
                            Fatal::contract_violation(format!("{kind} {raw:?} was not unified"))
                        })
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmeasure_common::{FatalKind, MemoryConfig};
    use std::sync::Arc;

    fn setup() -> (Arc<Memory>, DefinitionManager, DefinitionManager) {
        let memory = Memory::new(MemoryConfig::new(1 << 20, 4096)).unwrap();
        let page_manager = |memory: &Memory| {
            memory
                .create_page_manager(crate::memory::MemoryClass::Definitions)
                .unwrap()
        };
        let local = DefinitionManager::new(page_manager(&memory), false);
        let mut unified = DefinitionManager::new(page_manager(&memory), true);
        unified.new_string("").unwrap();
        (memory, local, unified)
    }

    #[test]
    fn duplicates_collapse_and_map() {
        let (memory, mut local, mut unified) = setup();
        let world = local.new_string("world").unwrap();
        let group = local
            .new_group(GroupType::CommGroup, world, Paradigm::Mpi, 0, &[0, 1])
            .unwrap();
        let a = local.new_communicator(world, group, Handle::NULL, 0).unwrap();
        let b = local.new_communicator(world, group, Handle::NULL, 0).unwrap();
        let process = local
            .new_location_group(world, LocationGroupType::Process, Handle::NULL)
            .unwrap();
        local
            .new_location(world, LocationType::CpuThread, process)
            .unwrap();
        local
            .new_location(world, LocationType::CpuThread, process)
            .unwrap();

        copy_definitions_to_unified(&memory, &mut local, &mut unified).unwrap();
        assert_eq!(local.unified_of(a), local.unified_of(b));
        assert_eq!(unified.counter(DefinitionKind::Communicator), 1);
        assert_eq!(unified.counter(DefinitionKind::Location), 2);

        create_definition_mappings(&mut local);
        assert_eq!(local.mapping(DefinitionKind::String), Some(&[INVALID_ID][..]));
        assign_definition_mappings_from_unified(&mut local, &unified).unwrap();
        assert_eq!(local.mapping(DefinitionKind::String), Some(&[1][..]));
        assert_eq!(local.mapping(DefinitionKind::Communicator), Some(&[0, 0][..]));
        assert_eq!(local.mapping(DefinitionKind::Location), None);

        create_location_mapping(&mut local, 3);
        assert_eq!(local.location_mapping(), Some(&[3, (1 << 32) | 3][..]));

        let unified_communicator = unified.get(local.unified_of(a).unwrap()).unwrap();
        assert_eq!(unified.string(unified_communicator.name).as_deref(), Some("world"));

        destroy_definition_mappings(&mut local);
        assert_eq!(local.mapping(DefinitionKind::String), None);
        assert_eq!(local.location_mapping(), None);
    }

    #[test]
    fn interim_references_are_resolved() {
        let (memory, mut local, mut unified) = setup();
        let name = local.new_string("win").unwrap();
        let interim = local
            .new_interim_communicator(name, Paradigm::Mpi, Handle::NULL)
            .unwrap();
        let unresolved = local
            .new_interim_communicator(name, Paradigm::Mpi, Handle::NULL)
            .unwrap();
        let window_a = local
            .new_rma_window(Handle::NULL, CommRef::Interim(interim), 7, 0)
            .unwrap();
        let communicator = local
            .new_communicator(name, Handle::NULL, Handle::NULL, 0)
            .unwrap();
        let window_b = local
            .new_rma_window(name, CommRef::Resolved(communicator), 7, 0)
            .unwrap();
        local.resolve_interim_communicator(interim, communicator).unwrap();
        assert_eq!(local.resolved_communicator(unresolved), None);

        let before = local.stored_hash(window_a.raw());
        resolve_interim_definitions(&memory, &mut local).unwrap();
        assert_ne!(local.stored_hash(window_a.raw()), before);
        assert_eq!(
            local.get(window_a).unwrap().comm,
            CommRef::Resolved(communicator)
        );

        copy_definitions_to_unified(&memory, &mut local, &mut unified).unwrap();
        let merged = local.unified_of(window_a).unwrap();
        assert_eq!(local.unified_of(window_b), Some(merged));
        assert_eq!(unified.counter(DefinitionKind::RmaWindow), 1);
        // The unnamed window came first, the name of the second one sticks.
        let window = unified.get(merged).unwrap();
        assert_eq!(unified.string(window.name).as_deref(), Some("win"));

        create_definition_mappings(&mut local);
        assign_definition_mappings_from_unified(&mut local, &unified).unwrap();
        create_interim_comm_mapping(&mut local);
        assert_eq!(
            local.mapping(DefinitionKind::InterimCommunicator),
            Some(&[0, INVALID_ID][..])
        );
    }

    #[test]
    fn unresolved_interim_references_are_fatal() {
        let (memory, mut local, _unified) = setup();
        let interim = local
            .new_interim_communicator(Handle::NULL, Paradigm::Mpi, Handle::NULL)
            .unwrap();
        local
            .new_cartesian_topology(Handle::NULL, CommRef::Interim(interim), &[])
            .unwrap();
        let fatal = resolve_interim_definitions(&memory, &mut local).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::ContractViolation);
    }

    #[test]
    fn unresolved_references_do_not_unify() {
        let (memory, mut local, mut unified) = setup();
        let interim = local
            .new_interim_communicator(Handle::NULL, Paradigm::Io, Handle::NULL)
            .unwrap();
        local
            .new_io_handle(
                Handle::NULL,
                Handle::NULL,
                Paradigm::Io,
                0,
                CommRef::Interim(interim),
                Handle::NULL,
            )
            .unwrap();
        let fatal = copy_definitions_to_unified(&memory, &mut local, &mut unified).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::ContractViolation);
    }
}
