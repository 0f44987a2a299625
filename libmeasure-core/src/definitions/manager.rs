// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::codec::{Decoder, Encoder};
use super::{Definition, DefinitionEntry, DefinitionHasher, DefinitionKind, Handle};
use crate::memory::Memory;
use byteorder::{ByteOrder, LittleEndian};
use libmeasure_alloc::{AllocError, MovableMemory, PageManager};
use libmeasure_common::Fatal;
use std::fmt;
use tracing::debug;

/// The id reported for the null handle and for handles of a foreign type.
pub const INVALID_ID: u32 = u32::MAX;

// Record header: len | kind, 3 reserved | unified | hash | sequence number.
const HEADER_LEN: usize = 20;
const LEN_AT: usize = 0;
const KIND_AT: usize = 4;
const UNIFIED_AT: usize = 8;
const HASH_AT: usize = 12;
const SEQUENCE_AT: usize = 16;

#[derive(Clone, Copy, Debug)]
struct Header {
    len: u32,
    kind: u8,
    unified: u32,
    hash: u32,
    sequence_number: u32,
}

impl Header {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            len: LittleEndian::read_u32(&bytes[LEN_AT..]),
            kind: bytes[KIND_AT],
            unified: LittleEndian::read_u32(&bytes[UNIFIED_AT..]),
            hash: LittleEndian::read_u32(&bytes[HASH_AT..]),
            sequence_number: LittleEndian::read_u32(&bytes[SEQUENCE_AT..]),
        }
    }

    fn write(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(&mut bytes[LEN_AT..], self.len);
        bytes[KIND_AT] = self.kind;
        bytes[KIND_AT + 1..UNIFIED_AT].fill(0);
        LittleEndian::write_u32(&mut bytes[UNIFIED_AT..], self.unified);
        LittleEndian::write_u32(&mut bytes[HASH_AT..], self.hash);
        LittleEndian::write_u32(&mut bytes[SEQUENCE_AT..], self.sequence_number);
    }
}

fn read_header(page_manager: &PageManager, raw: MovableMemory) -> Option<Header> {
    let bytes = page_manager.bytes(raw, HEADER_LEN)?;
    Some(Header::parse(bytes))
}

/// Resolves the header and the body of the record at `raw`.
fn read_record(page_manager: &PageManager, raw: MovableMemory) -> Option<(Header, &[u8])> {
    let header = read_header(page_manager, raw)?;
    let record = page_manager.bytes(raw, header.len as usize)?;
    Some((header, record.get(HEADER_LEN..)?))
}

fn decode_at<T: Definition>(page_manager: &PageManager, raw: MovableMemory) -> Option<T> {
    let (header, body) = read_record(page_manager, raw)?;
    if header.kind != T::KIND as u8 {
        return None;
    }
    T::decode(&mut Decoder::new(body))
}

fn table_hash(page_manager: &PageManager, raw: MovableMemory) -> u64 {
    read_header(page_manager, raw).map_or(0, |header| u64::from(header.hash))
}

/// A registry of definitions: a page manager holding the records, and per
/// definition type the registration-order list, an optional deduplication
/// table and, after unification, the mapping to global sequence numbers.
pub struct DefinitionManager {
    page_manager: PageManager,
    entries: Vec<DefinitionEntry>,
    location_mapping: Option<Vec<u64>>,
}

impl fmt::Debug for DefinitionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefinitionManager")
            .field(
                "counters",
                &DefinitionKind::ALL
                    .iter()
                    .map(|kind| (*kind, self.counter(*kind)))
                    .filter(|(_, counter)| *counter > 0)
                    .collect::<Vec<_>>(),
            )
            .field("has_location_mapping", &self.location_mapping.is_some())
            .finish_non_exhaustive()
    }
}

/// Why [DefinitionManager::rewrite] failed.
#[derive(Debug)]
pub enum RewriteError {
    /// The table of the type has no room to re-index the record.
    OutOfMemory(AllocError),
    /// The handle does not resolve, or the update changes the record size.
    Fatal(Fatal),
}

impl RewriteError {
    /// Running out of memory goes through [Memory::handle_out_of_memory].
    pub fn into_fatal(self, memory: &Memory) -> Fatal {
        match self {
            RewriteError::OutOfMemory(_) => memory.handle_out_of_memory(),
            RewriteError::Fatal(fatal) => fatal,
        }
    }
}

impl From<AllocError> for RewriteError {
    fn from(error: AllocError) -> Self {
        RewriteError::OutOfMemory(error)
    }
}

impl From<Fatal> for RewriteError {
    fn from(fatal: Fatal) -> Self {
        RewriteError::Fatal(fatal)
    }
}

impl DefinitionManager {
    /// Creates an empty registry storing its records in `page_manager`. Types
    /// which are always deduplicated get a table, the others only if
    /// `alloc_hash_tables` is set, as for the unified registry.
    pub fn new(page_manager: PageManager, alloc_hash_tables: bool) -> Self {
        let entries = DefinitionKind::ALL
            .iter()
            .map(|kind| {
                DefinitionEntry::new(
                    kind.always_hashed() || (alloc_hash_tables && kind.hashed_when_unified()),
                )
            })
            .collect();
        Self {
            page_manager,
            entries,
            location_mapping: None,
        }
    }

    /// Rebuilds a registry from pages received from elsewhere and the
    /// registration-order lists of each type. The result has no tables, it
    /// is only read.
    pub(crate) fn from_parts(
        page_manager: PageManager,
        lists: Vec<Vec<MovableMemory>>,
    ) -> Result<Self, Fatal> {
        if lists.len() != DefinitionKind::COUNT {
            return Err(Fatal::distributed_inconsistency(format!(
                "received {} definition lists, expected {}",
                lists.len(),
                DefinitionKind::COUNT
            )));
        }
        for (kind, list) in DefinitionKind::ALL.iter().zip(&lists) {
            for (index, raw) in list.iter().enumerate() {
                let valid = read_record(&page_manager, *raw).is_some_and(|(header, _)| {
                    header.kind == *kind as u8 && header.sequence_number as usize == index
                });
                if !valid {
                    return Err(Fatal::distributed_inconsistency(format!(
                        "received {kind} {raw:?} does not resolve to definition #{index}"
                    )));
                }
            }
        }
        let entries = lists
            .into_iter()
            .map(|list| DefinitionEntry {
                hash_table: None,
                list,
                mapping: None,
            })
            .collect();
        Ok(Self {
            page_manager,
            entries,
            location_mapping: None,
        })
    }

    pub fn page_manager(&self) -> &PageManager {
        &self.page_manager
    }

    pub fn entry(&self, kind: DefinitionKind) -> &DefinitionEntry {
        &self.entries[kind.index()]
    }

    /// Number of records of `kind`, which is also the next sequence number.
    pub fn counter(&self, kind: DefinitionKind) -> u32 {
        self.entry(kind).counter()
    }

    pub fn has_hash_table(&self, kind: DefinitionKind) -> bool {
        self.entry(kind).has_hash_table()
    }

    pub(crate) fn hash_of<T: Definition>(&self, definition: &T) -> u32 {
        let mut hasher = DefinitionHasher::new(self);
        definition.hash(&mut hasher);
        hasher.finish()
    }

    /// Interns `definition`. If its type is deduplicated here and an equal
    /// record exists, returns the existing record instead of a new one.
    pub fn add<T: Definition>(&mut self, definition: T) -> Result<Handle<T>, AllocError> {
        let hash = self.hash_of(&definition);
        let index = T::KIND.index();
        let sequence_number = self.entries[index].counter();

        let mut record = vec![0u8; HEADER_LEN];
        definition.encode(&mut Encoder::new(&mut record));
        let len = u32::try_from(record.len()).map_err(|_| AllocError)?;
        Header {
            len,
            kind: T::KIND as u8,
            unified: 0,
            hash,
            sequence_number,
        }
        .write(&mut record);

        let entry = &mut self.entries[index];
        entry.list.try_reserve(1).map_err(|_| AllocError)?;
        if let Some(table) = entry.hash_table.as_mut() {
            let page_manager = &self.page_manager;
            table
                .try_reserve(1, |raw| table_hash(page_manager, *raw))
                .map_err(|_| AllocError)?;
        }

        let raw = self.page_manager.alloc_movable(record.len())?;
        self.page_manager
            .bytes_mut(raw, record.len())
            .ok_or(AllocError)?
            .copy_from_slice(&record);

        let page_manager = &self.page_manager;
        let entry = &mut self.entries[index];
        if let Some(table) = entry.hash_table.as_mut() {
            let existing = table
                .find(u64::from(hash), |candidate| {
                    decode_at::<T>(page_manager, *candidate)
                        .is_some_and(|existing| definition.equals(&existing))
                })
                .copied();
            if let Some(existing) = existing {
                self.page_manager.rollback_alloc_movable(raw);
                self.merge_into(&definition, existing)?;
                return Ok(Handle::from_raw(existing));
            }
            table.insert_unique(u64::from(hash), raw, |raw| table_hash(page_manager, *raw));
        }
        entry.list.push(raw);
        Ok(Handle::from_raw(raw))
    }

    fn merge_into<T: Definition>(
        &mut self,
        duplicate: &T,
        existing: MovableMemory,
    ) -> Result<(), AllocError> {
        let Some(mut merged) = decode_at::<T>(&self.page_manager, existing) else {
            return Ok(());
        };
        if !duplicate.merge_duplicate(&mut merged) {
            return Ok(());
        }
        let mut body = Vec::new();
        merged.encode(&mut Encoder::new(&mut body));
        let len = read_header(&self.page_manager, existing).ok_or(AllocError)?.len as usize;
        if body.len() + HEADER_LEN != len {
            debug!(kind = %T::KIND, "Merged duplicate changed its size, keeping the original");
            return Ok(());
        }
        self.page_manager
            .bytes_mut(existing, len)
            .ok_or(AllocError)?[HEADER_LEN..]
            .copy_from_slice(&body);
        Ok(())
    }

    /// Decodes the record behind `handle`. Returns `None` for the null handle
    /// and for handles which do not resolve here.
    pub fn get<T: Definition>(&self, handle: Handle<T>) -> Option<T> {
        decode_at(&self.page_manager, handle.raw())
    }

    /// The handle of the record with sequence number `sequence_number`.
    pub fn handle_at<T: Definition>(&self, sequence_number: u32) -> Option<Handle<T>> {
        let raw = *self.entry(T::KIND).list.get(sequence_number as usize)?;
        Some(Handle::from_raw(raw))
    }

    /// All records of type `T` in registration order.
    pub fn iter<T: Definition>(&self) -> impl Iterator<Item = (Handle<T>, T)> + '_ {
        self.entry(T::KIND).list.iter().filter_map(move |raw| {
            let handle = Handle::from_raw(*raw);
            Some((handle, self.get(handle)?))
        })
    }

    /// The sequence number of `handle`, or [INVALID_ID].
    pub fn handle_to_id<T: Definition>(&self, handle: Handle<T>) -> u32 {
        match read_header(&self.page_manager, handle.raw()) {
            Some(header) if header.kind == T::KIND as u8 => header.sequence_number,
            _ => INVALID_ID,
        }
    }

    pub(crate) fn sequence_number_of(&self, raw: MovableMemory) -> Option<u32> {
        read_header(&self.page_manager, raw).map(|header| header.sequence_number)
    }

    /// The hash stored with the record at `raw`.
    pub fn stored_hash(&self, raw: MovableMemory) -> Option<u32> {
        read_header(&self.page_manager, raw).map(|header| header.hash)
    }

    pub(crate) fn unified_raw(&self, raw: MovableMemory) -> Option<MovableMemory> {
        read_header(&self.page_manager, raw).map(|header| MovableMemory::from_raw(header.unified))
    }

    /// The unified counterpart of `handle`, null until it is unified.
    pub fn unified_of<T: Definition>(&self, handle: Handle<T>) -> Option<Handle<T>> {
        self.unified_raw(handle.raw()).map(Handle::from_raw)
    }

    pub(crate) fn set_unified_raw(&mut self, raw: MovableMemory, unified: MovableMemory) -> bool {
        match self.page_manager.bytes_mut(raw, HEADER_LEN) {
            Some(bytes) => {
                LittleEndian::write_u32(&mut bytes[UNIFIED_AT..], unified.into_raw());
                true
            }
            None => false,
        }
    }

    pub fn set_unified<T: Definition>(&mut self, handle: Handle<T>, unified: Handle<T>) -> bool {
        self.set_unified_raw(handle.raw(), unified.raw())
    }

    /// Changes the record behind `handle` in place. The update must not change
    /// the encoded size. The record is rehashed, and re-indexed if its type
    /// has a table.
    pub fn rewrite<T: Definition>(
        &mut self,
        handle: Handle<T>,
        update: impl FnOnce(&mut T),
    ) -> Result<(), RewriteError> {
        let raw = handle.raw();
        let (header, mut definition) = match (
            read_header(&self.page_manager, raw),
            decode_at::<T>(&self.page_manager, raw),
        ) {
            (Some(header), Some(definition)) => (header, definition),
            _ => {
                return Err(Fatal::contract_violation(format!(
                    "cannot rewrite {} {raw:?}, it does not resolve",
                    T::KIND
                ))
                .into())
            }
        };
        update(&mut definition);
        let hash = self.hash_of(&definition);

        let mut record = vec![0u8; HEADER_LEN];
        definition.encode(&mut Encoder::new(&mut record));
        if record.len() != header.len as usize {
            return Err(Fatal::contract_violation(format!(
                "rewriting {} {raw:?} changes its size",
                T::KIND
            ))
            .into());
        }
        Header { hash, ..header }.write(&mut record);

        let page_manager = &mut self.page_manager;
        let table = self.entries[T::KIND.index()].hash_table.as_mut();
        if let Some(table) = table {
            table
                .try_reserve(1, |raw| table_hash(page_manager, *raw))
                .map_err(|_| AllocError)?;
            if let Ok(found) = table.find_entry(u64::from(header.hash), |candidate| *candidate == raw)
            {
                let _ = found.remove();
            }
            write_record(page_manager, raw, &record)?;
            let page_manager = &self.page_manager;
            table.insert_unique(u64::from(hash), raw, |raw| table_hash(page_manager, *raw));
        } else {
            write_record(page_manager, raw, &record)?;
        }
        Ok(())
    }

    pub fn mapping(&self, kind: DefinitionKind) -> Option<&[u32]> {
        self.entry(kind).mapping()
    }

    pub(crate) fn set_mapping(&mut self, kind: DefinitionKind, mapping: Option<Vec<u32>>) {
        self.entries[kind.index()].mapping = mapping;
    }

    pub fn location_mapping(&self) -> Option<&[u64]> {
        self.location_mapping.as_deref()
    }

    pub(crate) fn set_location_mapping(&mut self, mapping: Option<Vec<u64>>) {
        self.location_mapping = mapping;
    }

    /// Drops all records and returns their pages to the allocator. The page
    /// manager stays, so its statistics remain available.
    pub fn free_memory(&mut self) {
        for entry in &mut self.entries {
            *entry = DefinitionEntry::new(entry.hash_table.is_some());
        }
        self.location_mapping = None;
        self.page_manager.free();
    }
}

fn write_record(
    page_manager: &mut PageManager,
    raw: MovableMemory,
    record: &[u8],
) -> Result<(), Fatal> {
    match page_manager.bytes_mut(raw, record.len()) {
        Some(bytes) => {
            bytes.copy_from_slice(record);
            Ok(())
        }
        None => Err(Fatal::contract_violation(format!(
            "record {raw:?} does not resolve"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{Paradigm, RegionDef, RegionInfo, StringDef};
    use libmeasure_alloc::PageAllocator;

    fn manager(alloc_hash_tables: bool) -> DefinitionManager {
        let allocator = PageAllocator::new(1 << 20, 4096).unwrap();
        DefinitionManager::new(PageManager::new(&allocator).unwrap(), alloc_hash_tables)
    }

    #[test]
    fn strings_are_interned() {
        let mut defs = manager(false);
        let foo = defs.new_string("foo").unwrap();
        let bar = defs.new_string("bar").unwrap();
        let used = defs.page_manager().stats().memory_used;
        assert_eq!(defs.new_string("foo").unwrap(), foo);
        assert_eq!(defs.page_manager().stats().memory_used, used);

        assert_ne!(foo, bar);
        assert_eq!(defs.counter(DefinitionKind::String), 2);
        assert_eq!(defs.handle_to_id(foo), 0);
        assert_eq!(defs.handle_to_id(bar), 1);
        assert_eq!(defs.handle_at::<StringDef>(1), Some(bar));
        assert_eq!(defs.get(bar).unwrap().value, "bar");
        assert_eq!(defs.handle_to_id(Handle::<StringDef>::NULL), INVALID_ID);
        assert!(defs.unified_of(foo).unwrap().is_null());
    }

    #[test]
    fn foreign_handles_do_not_decode() {
        let mut defs = manager(false);
        let foo = defs.new_string("foo").unwrap();
        let as_region = Handle::<RegionDef>::from_raw(foo.raw());
        assert_eq!(defs.get(as_region), None);
        assert_eq!(defs.handle_to_id(as_region), INVALID_ID);
    }

    #[test]
    fn hash_tables_follow_policy() {
        let local = manager(false);
        let unified = manager(true);
        for kind in DefinitionKind::ALL {
            assert_eq!(local.has_hash_table(kind), kind.always_hashed());
            assert_eq!(unified.has_hash_table(kind), kind.hashed_when_unified());
        }
    }

    #[test]
    fn unhashed_types_keep_every_record() {
        let mut defs = manager(false);
        let name = defs.new_string("world").unwrap();
        let a = defs.new_communicator(name, Handle::NULL, Handle::NULL, 0).unwrap();
        let b = defs.new_communicator(name, Handle::NULL, Handle::NULL, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(defs.counter(DefinitionKind::Communicator), 2);
        assert_eq!(
            defs.iter::<crate::definitions::CommunicatorDef>()
                .map(|(handle, _)| handle)
                .collect::<Vec<_>>(),
            vec![a, b]
        );
    }

    #[test]
    fn rewrite_reindexes() {
        let mut defs = manager(false);
        let main = defs.new_string("main").unwrap();
        let info = RegionInfo {
            name: main,
            paradigm: Paradigm::User,
            ..RegionInfo::default()
        };
        let region = defs.new_region(info).unwrap();
        let before = defs.stored_hash(region.raw()).unwrap();

        let file = defs.new_source_file("main.c").unwrap();
        defs.rewrite(region, |region| region.file_name = file).unwrap();
        assert_ne!(defs.stored_hash(region.raw()).unwrap(), before);
        assert_eq!(defs.get(region).unwrap().file_name, file);

        let again = defs
            .new_region(RegionInfo {
                file_name: file,
                ..info
            })
            .unwrap();
        assert_eq!(again, region);
        assert_eq!(defs.counter(DefinitionKind::Region), 1);
    }

    #[test]
    fn rewrite_refuses_to_resize() {
        let mut defs = manager(false);
        let foo = defs.new_string("foo").unwrap();
        let error = defs
            .rewrite(foo, |s| s.value.push_str("bar"))
            .unwrap_err();
        assert!(matches!(
            error,
            RewriteError::Fatal(ref fatal) if fatal.kind() == libmeasure_common::FatalKind::ContractViolation
        ));
        assert_eq!(defs.get(foo).unwrap().value, "foo");
    }

    #[test]
    fn from_parts_validates_lists() {
        let mut defs = manager(false);
        let foo = defs.new_string("foo").unwrap();
        let allocator = defs.page_manager().allocator().clone();
        let DefinitionManager { page_manager, .. } = defs;
        let mut moved = PageManager::new_moved(&allocator);
        moved.adopt(page_manager).unwrap();

        let mut lists = vec![Vec::new(); DefinitionKind::COUNT];
        lists[DefinitionKind::Region.index()].push(foo.raw());
        let fatal = DefinitionManager::from_parts(
            PageManager::new_moved(&allocator),
            lists.clone(),
        )
        .err()
        .unwrap();
        assert_eq!(fatal.kind(), libmeasure_common::FatalKind::DistributedInconsistency);

        lists.swap(DefinitionKind::Region.index(), DefinitionKind::String.index());
        let rebuilt = DefinitionManager::from_parts(moved, lists).unwrap();
        assert_eq!(rebuilt.get(foo).unwrap().value, "foo");
        assert!(!rebuilt.has_hash_table(DefinitionKind::String));
    }

    #[test]
    fn rewrite_errors_become_fatal() {
        let memory = Memory::new(libmeasure_common::MemoryConfig::new(1 << 20, 4096)).unwrap();
        let fatal = RewriteError::from(AllocError).into_fatal(&memory);
        assert_eq!(fatal.kind(), libmeasure_common::FatalKind::OutOfMemory);

        let mut defs = manager(true);
        let foo = defs.new_string("foo").unwrap();
        let as_region = Handle::<RegionDef>::from_raw(foo.raw());
        let fatal = defs
            .rewrite(as_region, |region| region.begin_line = 1)
            .unwrap_err()
            .into_fatal(&memory);
        assert_eq!(fatal.kind(), libmeasure_common::FatalKind::ContractViolation);
    }

    #[test]
    fn unresolved_handles_cannot_be_unified() {
        let mut defs = manager(false);
        let foo = defs.new_string("foo").unwrap();
        assert!(defs.set_unified(foo, foo));
        assert!(!defs.set_unified(Handle::<StringDef>::NULL, foo));
        assert!(!defs.set_unified_raw(MovableMemory::from_raw(u32::MAX), foo.raw()));
    }

    #[test]
    fn debug_lists_the_counters() {
        let mut defs = manager(false);
        defs.new_string("foo").unwrap();
        let debug = format!("{defs:?}");
        assert!(debug.starts_with("DefinitionManager"));
        assert!(debug.contains("(String, 1)"));
        assert!(!debug.contains("Region"));
    }
}
