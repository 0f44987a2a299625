// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{GroupDef, Paradigm, StringDef};
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

/// A communicator as seen while recording, before its global identity is
/// known. It is resolved to a [CommunicatorDef] before unification and is
/// never unified itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterimCommunicatorDef {
    pub name: Handle<StringDef>,
    pub paradigm: Paradigm,
    pub parent: Handle<InterimCommunicatorDef>,
}

impl Definition for InterimCommunicatorDef {
    const KIND: DefinitionKind = DefinitionKind::InterimCommunicator;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        self.paradigm.encode(out);
        out.handle(self.parent);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            paradigm: Paradigm::decode(input)?,
            parent: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.write(&self.paradigm);
        state.reference(self.parent);
    }

    fn equals(&self, _other: &Self) -> bool {
        false
    }

    fn unify(&self, _source: &DefinitionManager) -> Result<Self, Fatal> {
        Err(Fatal::contract_violation(
            "interim communicators are resolved, never unified",
        ))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommunicatorDef {
    pub name: Handle<StringDef>,
    pub group: Handle<GroupDef>,
    pub parent: Handle<CommunicatorDef>,
    pub flags: u32,
}

impl Definition for CommunicatorDef {
    const KIND: DefinitionKind = DefinitionKind::Communicator;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        out.handle(self.group);
        out.handle(self.parent);
        out.u32(self.flags);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            group: input.handle()?,
            parent: input.handle()?,
            flags: input.u32()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.reference(self.group);
        state.reference(self.parent);
        state.write(&self.flags);
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            group: translate(source, self.group)?,
            parent: translate(source, self.parent)?,
            flags: self.flags,
        })
    }
}

/// The communicator a record is scoped to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CommRef {
    #[default]
    None,
    Interim(Handle<InterimCommunicatorDef>),
    Resolved(Handle<CommunicatorDef>),
}

impl CommRef {
    pub fn encode(self, out: &mut Encoder<'_>) {
        let (tag, raw) = match self {
            CommRef::None => (0, 0),
            CommRef::Interim(handle) => (1, handle.raw().into_raw()),
            CommRef::Resolved(handle) => (2, handle.raw().into_raw()),
        };
        out.u8(tag);
        out.u32(raw);
    }

    pub fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        let tag = input.u8()?;
        Some(match tag {
            0 => {
                input.u32()?;
                CommRef::None
            }
            1 => CommRef::Interim(input.handle()?),
            2 => CommRef::Resolved(input.handle()?),
            _ => return None,
        })
    }

    pub fn hash(self, state: &mut DefinitionHasher<'_>) {
        match self {
            CommRef::None => state.write(&0u8),
            CommRef::Interim(handle) => {
                state.write(&1u8);
                state.reference(handle);
            }
            CommRef::Resolved(handle) => {
                state.write(&2u8);
                state.reference(handle);
            }
        }
    }

    /// Translates a resolved reference. An interim reference left at this
    /// point is a bug in the caller.
    pub fn unify(self, source: &DefinitionManager) -> Result<Self, Fatal> {
        match self {
            CommRef::None => Ok(CommRef::None),
            CommRef::Resolved(handle) => Ok(CommRef::Resolved(translate(source, handle)?)),
            CommRef::Interim(handle) => Err(Fatal::contract_violation(format!(
                "interim communicator {:?} was not resolved before unification",
                handle.raw()
            ))),
        }
    }
}

/// Types with a communicator reference which is interim while recording.
pub trait CommunicatorScoped: Definition {
    fn comm_ref(&mut self) -> &mut CommRef;
}

impl DefinitionManager {
    pub fn new_interim_communicator(
        &mut self,
        name: Handle<StringDef>,
        paradigm: Paradigm,
        parent: Handle<InterimCommunicatorDef>,
    ) -> Result<Handle<InterimCommunicatorDef>, AllocError> {
        self.add(InterimCommunicatorDef {
            name,
            paradigm,
            parent,
        })
    }

    pub fn new_communicator(
        &mut self,
        name: Handle<StringDef>,
        group: Handle<GroupDef>,
        parent: Handle<CommunicatorDef>,
        flags: u32,
    ) -> Result<Handle<CommunicatorDef>, AllocError> {
        self.add(CommunicatorDef {
            name,
            group,
            parent,
            flags,
        })
    }

    /// Records that `interim` is the communicator `communicator`. The
    /// link is stored in the unified field of the interim record.
    pub fn resolve_interim_communicator(
        &mut self,
        interim: Handle<InterimCommunicatorDef>,
        communicator: Handle<CommunicatorDef>,
    ) -> Result<(), Fatal> {
        let valid = self.get(interim).is_some() && self.get(communicator).is_some();
        if !valid || !self.set_unified_raw(interim.raw(), communicator.raw()) {
            return Err(Fatal::contract_violation(format!(
                "cannot resolve interim communicator {:?} to {:?}",
                interim.raw(),
                communicator.raw()
            )));
        }
        Ok(())
    }

    /// The communicator `interim` was resolved to, if it was.
    pub fn resolved_communicator(
        &self,
        interim: Handle<InterimCommunicatorDef>,
    ) -> Option<Handle<CommunicatorDef>> {
        let raw = self.unified_raw(interim.raw())?;
        (!raw.is_null()).then_some(Handle::from_raw(raw))
    }
}
