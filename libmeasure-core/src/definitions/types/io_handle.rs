// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CommRef, CommunicatorScoped, Paradigm, StringDef};
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

/// An open file, stream or descriptor of an I/O paradigm, possibly shared by
/// the ranks of `scope`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoHandleDef {
    pub name: Handle<StringDef>,
    pub file: Handle<StringDef>,
    pub io_paradigm: Paradigm,
    pub flags: u32,
    pub scope: CommRef,
    pub parent: Handle<IoHandleDef>,
}

impl Definition for IoHandleDef {
    const KIND: DefinitionKind = DefinitionKind::IoHandle;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        out.handle(self.file);
        self.io_paradigm.encode(out);
        out.u32(self.flags);
        self.scope.encode(out);
        out.handle(self.parent);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            file: input.handle()?,
            io_paradigm: Paradigm::decode(input)?,
            flags: input.u32()?,
            scope: CommRef::decode(input)?,
            parent: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.reference(self.file);
        state.write(&self.io_paradigm);
        state.write(&self.flags);
        self.scope.hash(state);
        state.reference(self.parent);
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            file: translate(source, self.file)?,
            scope: self.scope.unify(source)?,
            parent: translate(source, self.parent)?,
            ..*self
        })
    }
}

impl CommunicatorScoped for IoHandleDef {
    fn comm_ref(&mut self) -> &mut CommRef {
        &mut self.scope
    }
}

impl DefinitionManager {
    pub fn new_io_handle(
        &mut self,
        name: Handle<StringDef>,
        file: Handle<StringDef>,
        io_paradigm: Paradigm,
        flags: u32,
        scope: CommRef,
        parent: Handle<IoHandleDef>,
    ) -> Result<Handle<IoHandleDef>, AllocError> {
        self.add(IoHandleDef {
            name,
            file,
            io_paradigm,
            flags,
            scope,
            parent,
        })
    }
}
