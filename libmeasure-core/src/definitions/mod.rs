// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed definition records living in page memory, and the registry which
//! interns them.
//!
//! Every record is addressed by a [Handle], a typed [MovableMemory], so that
//! references between records stay valid when the pages holding them move to
//! another page manager or another process.

pub mod codec;
mod entry;
mod kind;
mod manager;
pub mod types;

pub use entry::DefinitionEntry;
pub use kind::DefinitionKind;
pub use manager::{DefinitionManager, RewriteError, INVALID_ID};
pub use types::*;

use codec::{Decoder, Encoder};
use libmeasure_alloc::MovableMemory;
use libmeasure_common::Fatal;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// A reference to a record of type `T`, valid in the manager which created
/// it and in every manager its pages are moved to.
pub struct Handle<T> {
    raw: MovableMemory,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub const NULL: Self = Self::from_raw(MovableMemory::NULL);

    pub const fn from_raw(raw: MovableMemory) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn raw(self) -> MovableMemory {
        self.raw
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.raw.is_null()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state)
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.raw).finish()
    }
}

/// The behavior shared by all definition types.
///
/// Two records of the same type are duplicates when `equals` says so, and
/// duplicates must hash alike. References to other records take part in both
/// through the referenced record's identity: within one manager a referenced
/// type is either deduplicated already, or every record of it is distinct.
pub trait Definition: Sized {
    const KIND: DefinitionKind;

    fn encode(&self, out: &mut Encoder<'_>);

    fn decode(input: &mut Decoder<'_>) -> Option<Self>;

    fn hash(&self, state: &mut DefinitionHasher<'_>);

    fn equals(&self, other: &Self) -> bool;

    /// Returns this record with every reference translated to the unified
    /// counterpart of the referenced record in `source`.
    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal>;

    /// Called when this record turned out to duplicate `existing`. Returns
    /// true if it updated `existing`, which then gets written back.
    fn merge_duplicate(&self, existing: &mut Self) -> bool {
        let _ = existing;
        false
    }
}

/// Hashes the key of a record. References contribute the hash stored in the
/// referenced record, so equal content hashes equally in every manager.
pub struct DefinitionHasher<'a> {
    state: FxHasher,
    manager: &'a DefinitionManager,
}

impl<'a> DefinitionHasher<'a> {
    pub(crate) fn new(manager: &'a DefinitionManager) -> Self {
        Self {
            state: FxHasher::default(),
            manager,
        }
    }

    pub fn write<V: Hash + ?Sized>(&mut self, value: &V) {
        value.hash(&mut self.state);
    }

    pub fn reference<T>(&mut self, handle: Handle<T>) {
        let hash = self.manager.stored_hash(handle.raw()).unwrap_or(0);
        self.state.write_u32(hash);
    }

    pub(crate) fn finish(self) -> u32 {
        let hash = self.state.finish();
        (hash ^ (hash >> 32)) as u32
    }
}

/// Translates `handle` of `source` to its unified counterpart. The null
/// handle stays null.
pub fn translate<T: Definition>(
    source: &DefinitionManager,
    handle: Handle<T>,
) -> Result<Handle<T>, Fatal> {
    if handle.is_null() {
        return Ok(Handle::NULL);
    }
    match source.unified_of(handle) {
        Some(unified) if !unified.is_null() => Ok(unified),
        _ => Err(Fatal::contract_violation(format!(
            "{} {:?} is referenced before it was unified",
            T::KIND,
            handle.raw()
        ))),
    }
}
