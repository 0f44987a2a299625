// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CommRef, CommunicatorScoped, StringDef};
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

/// A one-sided communication window. Windows are identified by their
/// communicator and creation id; the name is only a label.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RmaWindowDef {
    pub name: Handle<StringDef>,
    pub comm: CommRef,
    pub creation_id: u32,
    pub flags: u32,
}

impl Definition for RmaWindowDef {
    const KIND: DefinitionKind = DefinitionKind::RmaWindow;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        self.comm.encode(out);
        out.u32(self.creation_id);
        out.u32(self.flags);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            comm: CommRef::decode(input)?,
            creation_id: input.u32()?,
            flags: input.u32()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        self.comm.hash(state);
        state.write(&self.creation_id);
    }

    fn equals(&self, other: &Self) -> bool {
        self.comm == other.comm && self.creation_id == other.creation_id
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            comm: self.comm.unify(source)?,
            ..*self
        })
    }

    /// A window is usually named by only some of the processes sharing it.
    /// The first name seen wins over no name.
    fn merge_duplicate(&self, existing: &mut Self) -> bool {
        if existing.name.is_null() && !self.name.is_null() {
            existing.name = self.name;
            return true;
        }
        false
    }
}

impl CommunicatorScoped for RmaWindowDef {
    fn comm_ref(&mut self) -> &mut CommRef {
        &mut self.comm
    }
}

impl DefinitionManager {
    pub fn new_rma_window(
        &mut self,
        name: Handle<StringDef>,
        comm: CommRef,
        creation_id: u32,
        flags: u32,
    ) -> Result<Handle<RmaWindowDef>, AllocError> {
        self.add(RmaWindowDef {
            name,
            comm,
            creation_id,
            flags,
        })
    }
}
