// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hashbrown::HashTable;
use libmeasure_alloc::MovableMemory;

/// The records of one definition type in a [super::DefinitionManager].
///
/// `list` holds every record in registration order, so the sequence number
/// of a record is its index there. When `hash_table` is present it holds
/// the same records keyed by their stored hash.
#[derive(Default)]
pub struct DefinitionEntry {
    pub(crate) hash_table: Option<HashTable<MovableMemory>>,
    pub(crate) list: Vec<MovableMemory>,
    pub(crate) mapping: Option<Vec<u32>>,
}

impl DefinitionEntry {
    pub(crate) fn new(hashed: bool) -> Self {
        Self {
            hash_table: hashed.then(HashTable::new),
            list: Vec::new(),
            mapping: None,
        }
    }

    /// The sequence number the next record gets.
    #[inline]
    pub fn counter(&self) -> u32 {
        self.list.len() as u32
    }

    pub fn handles(&self) -> &[MovableMemory] {
        &self.list
    }

    pub fn has_hash_table(&self) -> bool {
        self.hash_table.is_some()
    }

    pub fn mapping(&self) -> Option<&[u32]> {
        self.mapping.as_deref()
    }
}
