// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unification across processes.
//!
//! The ranks form a binomial tree rooted at rank 0: the parent of a rank is
//! the rank with its lowest set bit cleared. Definitions flow up the tree,
//! each rank interning the definitions of its children into its own unified
//! set, so the root ends up with the union in a deterministic order. Maps
//! from each rank's unified sequence numbers to the root's then flow back
//! down, and the root broadcasts its set.
//!
//! Definition sets travel as the raw pages of their page manager plus the
//! handle lists, as handles stay valid when the pages keep their ids.

use super::local::{copy_definitions_to_unified, unified_sequence_numbers};
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{DefinitionKind, DefinitionManager, GroupType, Paradigm, StringDef};
use crate::ipc::{Ipc, IpcExt};
use crate::memory::Memory;
use libmeasure_alloc::MovableMemory;
use libmeasure_common::Fatal;
use tracing::debug;

/// Per kind, sequence numbers of one set in another.
pub(crate) type SequenceMaps = Vec<Vec<u32>>;

/// The parent of `rank` and its children, in the order they are merged.
pub(crate) fn comm_partners(rank: u32, size: u32) -> (Option<u32>, Vec<u32>) {
    let lowest_bit = if rank == 0 {
        u32::MAX
    } else {
        1 << rank.trailing_zeros()
    };
    let parent = (rank != 0).then_some(rank & !lowest_bit);
    let children = (0..u32::BITS)
        .map(|bit| 1u32 << bit)
        .take_while(|bit| *bit < lowest_bit)
        .filter_map(|bit| rank.checked_add(bit))
        .take_while(|child| *child < size)
        .collect();
    (parent, children)
}

/// What the upward pass leaves behind for the downward one.
pub struct MergeTree {
    parent: Option<u32>,
    children: Vec<(u32, SequenceMaps)>,
}

/// Receives the unified sets of the children, interns them into `unified`,
/// and sends the result to the parent.
pub fn merge_up(
    memory: &Memory,
    ipc: &dyn Ipc,
    unified: &mut DefinitionManager,
) -> Result<MergeTree, Fatal> {
    let (parent, partners) = comm_partners(ipc.rank(), ipc.size());
    let mut children = Vec::with_capacity(partners.len());
    for child in partners {
        let bytes = ipc.recv(child)?;
        let mut received = decode_definitions(memory, &bytes)?;
        copy_definitions_to_unified(memory, &mut received, unified)?;
        let maps = unified_sequence_numbers(&received, unified)?;
        debug!(
            rank = ipc.rank(),
            child,
            bytes = bytes.len(),
            "Merged definitions of child"
        );
        children.push((child, maps));
    }
    if let Some(parent) = parent {
        ipc.send(parent, &encode_definitions(unified))?;
    }
    Ok(MergeTree { parent, children })
}

/// Hands the sequence maps down the tree and distributes the root's set.
/// Returns the published set. On every rank but the root, the unified
/// fields of `local` are moved over to it.
pub fn distribute(
    memory: &Memory,
    ipc: &dyn Ipc,
    tree: MergeTree,
    local: &mut DefinitionManager,
    unified: DefinitionManager,
) -> Result<DefinitionManager, Fatal> {
    if !ipc.is_multi_process() {
        return Ok(unified);
    }
    let maps = match tree.parent {
        Some(parent) => decode_maps(&ipc.recv(parent)?)?,
        None => DefinitionKind::ALL
            .iter()
            .map(|kind| (0..unified.counter(*kind)).collect())
            .collect(),
    };
    for (child, child_maps) in tree.children.iter().rev() {
        let composed = compose(&maps, child_maps)?;
        ipc.send(*child, &encode_maps(&composed))?;
    }

    let bytes = if ipc.rank() == 0 {
        encode_definitions(&unified)
    } else {
        Vec::new()
    };
    let bytes = ipc.broadcast_bytes(bytes, 0)?;
    if ipc.rank() == 0 {
        return Ok(unified);
    }
    let published = decode_definitions(memory, &bytes)?;
    repoint(local, &unified, &published, &maps)?;
    Ok(published)
}

/// Collects the global ids of all locations at the root, which defines them
/// as one group. Returns the offset of this rank's first location in that
/// group.
pub fn define_comm_locations(
    memory: &Memory,
    ipc: &dyn Ipc,
    local: &DefinitionManager,
    unified: &mut DefinitionManager,
) -> Result<u32, Fatal> {
    let ids = local.location_mapping().unwrap_or_default();
    let offsets = match ipc.gatherv(ids, 0)? {
        Some(per_rank) => {
            let mut offsets = Vec::with_capacity(per_rank.len());
            let mut members = Vec::new();
            for ids in per_rank {
                offsets.push(u32::try_from(members.len()).map_err(|_| {
                    Fatal::contract_violation("too many locations for one group")
                })?);
                members.extend(ids);
            }
            let empty = unified.handle_at::<StringDef>(0).ok_or_else(|| {
                Fatal::contract_violation("the unified definitions lack the empty string")
            })?;
            unified
                .new_group(GroupType::CommLocations, empty, Paradigm::Mpi, 0, &members)
                .map_err(|_| memory.handle_out_of_memory())?;
            offsets
        }
        None => Vec::new(),
    };
    ipc.scatter(&offsets, 0)
}

fn compose(maps: &SequenceMaps, child_maps: &SequenceMaps) -> Result<SequenceMaps, Fatal> {
    maps.iter()
        .zip(child_maps)
        .map(|(map, child_map)| {
            child_map
                .iter()
                .map(|sequence_number| {
                    map.get(*sequence_number as usize).copied().ok_or_else(|| {
                        Fatal::distributed_inconsistency(format!(
                            "sequence number {sequence_number} is not in the merged definitions"
                        ))
                    })
                })
                .collect()
        })
        .collect()
}

/// Points the unified fields of `local` from `previous` to the records of
/// `published`, going through this rank's sequence maps.
fn repoint(
    local: &mut DefinitionManager,
    previous: &DefinitionManager,
    published: &DefinitionManager,
    maps: &SequenceMaps,
) -> Result<(), Fatal> {
    for kind in DefinitionKind::UNIFY_ORDER {
        let targets = published.entry(kind).handles();
        let Some(map) = maps.get(kind.index()) else {
            return Err(malformed("sequence maps"));
        };
        let handles = local.entry(kind).handles().to_vec();
        for raw in handles {
            let target = local
                .unified_raw(raw)
                .and_then(|unified| previous.sequence_number_of(unified))
                .and_then(|sequence_number| map.get(sequence_number as usize))
                .and_then(|global| targets.get(*global as usize))
                .copied()
                .ok_or_else(|| {
                    Fatal::distributed_inconsistency(format!(
                        "{kind} {raw:?} has no counterpart in the published definitions"
                    ))
                })?;
            if !local.set_unified_raw(raw, target) {
                return Err(Fatal::contract_violation(format!(
                    "{kind} {raw:?} cannot record its published counterpart"
                )));
            }
        }
    }
    Ok(())
}

fn malformed(what: &str) -> Fatal {
    Fatal::distributed_inconsistency(format!("received malformed {what}"))
}

pub(crate) fn encode_definitions(definitions: &DefinitionManager) -> Vec<u8> {
    let page_manager = definitions.page_manager();
    let mut bytes = Vec::new();
    let mut out = Encoder::new(&mut bytes);
    out.u32(page_manager.allocator().page_shift());
    out.u32(DefinitionKind::COUNT as u32);
    for kind in DefinitionKind::ALL {
        let handles = definitions.entry(kind).handles();
        out.u32(handles.len() as u32);
        for raw in handles {
            out.u32(raw.into_raw());
        }
    }
    let pages: Vec<(u32, &[u8])> = page_manager.used_pages().collect();
    out.u32(pages.len() as u32);
    for (id, page) in pages {
        out.u32(id);
        out.bytes(page);
    }
    bytes
}

/// Rebuilds a definition set from the pages of another process. The result
/// has no hash tables and cannot grow.
pub(crate) fn decode_definitions(
    memory: &Memory,
    bytes: &[u8],
) -> Result<DefinitionManager, Fatal> {
    let mut input = Decoder::new(bytes);
    let page_shift = input.u32().ok_or_else(|| malformed("definitions"))?;
    let own_shift = memory.allocator().page_shift();
    if page_shift != own_shift {
        return Err(Fatal::distributed_inconsistency(format!(
            "peer uses pages of 2^{page_shift} bytes, this process 2^{own_shift}"
        )));
    }
    if input.u32() != Some(DefinitionKind::COUNT as u32) {
        return Err(malformed("definition kinds"));
    }
    let lists = (0..DefinitionKind::COUNT)
        .map(|_| {
            let n = input.u32()?;
            (0..n)
                .map(|_| input.u32().map(MovableMemory::from_raw))
                .collect::<Option<Vec<_>>>()
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| malformed("definition lists"))?;

    let n_pages = input.u32().ok_or_else(|| malformed("definition pages"))?;
    let mut page_manager = memory.create_moved_page_manager();
    for _ in 0..n_pages {
        let (Some(id), Some(page)) = (input.u32(), input.bytes()) else {
            return Err(malformed("definition pages"));
        };
        if id == 0 {
            return Err(malformed("page id"));
        }
        page_manager
            .alloc_moved_page(id, page.len())
            .map_err(|_| memory.handle_out_of_memory())?
            .copy_from_slice(page);
    }
    if !input.is_empty() {
        return Err(malformed("definitions"));
    }
    DefinitionManager::from_parts(page_manager, lists)
}

fn encode_maps(maps: &SequenceMaps) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut out = Encoder::new(&mut bytes);
    out.u32(maps.len() as u32);
    for map in maps {
        out.u32(map.len() as u32);
        for sequence_number in map {
            out.u32(*sequence_number);
        }
    }
    bytes
}

fn decode_maps(bytes: &[u8]) -> Result<SequenceMaps, Fatal> {
    let mut input = Decoder::new(bytes);
    if input.u32() != Some(DefinitionKind::COUNT as u32) {
        return Err(malformed("sequence maps"));
    }
    let maps = (0..DefinitionKind::COUNT)
        .map(|_| {
            let n = input.u32()?;
            (0..n).map(|_| input.u32()).collect::<Option<Vec<_>>>()
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| malformed("sequence maps"))?;
    if !input.is_empty() {
        return Err(malformed("sequence maps"));
    }
    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClass;
    use libmeasure_common::{FatalKind, MemoryConfig};

    #[test]
    fn binomial_tree() {
        assert_eq!(comm_partners(0, 1), (None, vec![]));
        assert_eq!(comm_partners(0, 4), (None, vec![1, 2]));
        assert_eq!(comm_partners(1, 4), (Some(0), vec![]));
        assert_eq!(comm_partners(2, 4), (Some(0), vec![3]));
        assert_eq!(comm_partners(3, 4), (Some(2), vec![]));
        assert_eq!(comm_partners(0, 6), (None, vec![1, 2, 4]));
        assert_eq!(comm_partners(4, 6), (Some(0), vec![5]));
        assert_eq!(comm_partners(6, 8), (Some(4), vec![7]));
    }

    #[test]
    fn every_rank_but_the_root_has_one_parent() {
        for size in 1..40u32 {
            let mut seen = vec![0u32; size as usize];
            for rank in 0..size {
                let (parent, children) = comm_partners(rank, size);
                assert_eq!(parent.is_none(), rank == 0);
                for child in children {
                    assert_eq!(comm_partners(child, size).0, Some(rank));
                    seen[child as usize] += 1;
                }
            }
            assert_eq!(seen[0], 0);
            assert!(seen[1..].iter().all(|count| *count == 1));
        }
    }

    fn memory() -> std::sync::Arc<Memory> {
        Memory::new(MemoryConfig::new(1 << 20, 1024)).unwrap()
    }

    #[test]
    fn definitions_survive_the_wire() {
        let memory = memory();
        let page_manager = memory.create_page_manager(MemoryClass::Definitions).unwrap();
        let mut definitions = DefinitionManager::new(page_manager, true);
        let long = "x".repeat(3000);
        let name = definitions.new_string("main").unwrap();
        let big = definitions.new_string(&long).unwrap();
        let file = definitions.new_source_file("main.c").unwrap();
        let region = definitions
            .new_region(crate::definitions::RegionInfo {
                name,
                file_name: file,
                begin_line: 3,
                ..Default::default()
            })
            .unwrap();

        let bytes = encode_definitions(&definitions);
        let received = decode_definitions(&memory, &bytes).unwrap();
        // "main", the long one and "main.c".
        assert_eq!(received.counter(DefinitionKind::String), 3);
        assert_eq!(received.string(big).as_deref(), Some(long.as_str()));
        assert_eq!(received.get(region), definitions.get(region));
        assert_eq!(received.handle_to_id(region), 0);
        assert!(!received.has_hash_table(DefinitionKind::String));
    }

    #[test]
    fn truncated_definitions_are_inconsistent() {
        let memory = memory();
        let page_manager = memory.create_page_manager(MemoryClass::Definitions).unwrap();
        let mut definitions = DefinitionManager::new(page_manager, false);
        definitions.new_string("main").unwrap();
        let bytes = encode_definitions(&definitions);
        let fatal = decode_definitions(&memory, &bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::DistributedInconsistency);

        let other = Memory::new(MemoryConfig::new(1 << 20, 4096)).unwrap();
        let fatal = decode_definitions(&other, &bytes).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::DistributedInconsistency);
    }

    #[test]
    fn maps_compose() {
        let maps: SequenceMaps = vec![vec![5, 6, 7]; DefinitionKind::COUNT];
        let child: SequenceMaps = vec![vec![2, 0]; DefinitionKind::COUNT];
        let composed = compose(&maps, &child).unwrap();
        assert_eq!(composed[0], vec![7, 5]);
        assert_eq!(decode_maps(&encode_maps(&composed)).unwrap(), composed);

        let out_of_range: SequenceMaps = vec![vec![3]; DefinitionKind::COUNT];
        let fatal = compose(&maps, &out_of_range).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::DistributedInconsistency);
    }
}
