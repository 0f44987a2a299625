// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::RegionDef;
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

/// A node of the call tree: `region` called from `parent`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallpathDef {
    pub parent: Handle<CallpathDef>,
    pub region: Handle<RegionDef>,
}

impl Definition for CallpathDef {
    const KIND: DefinitionKind = DefinitionKind::Callpath;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.parent);
        out.handle(self.region);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            parent: input.handle()?,
            region: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.parent);
        state.reference(self.region);
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            parent: translate(source, self.parent)?,
            region: translate(source, self.region)?,
        })
    }
}

impl DefinitionManager {
    pub fn new_callpath(
        &mut self,
        parent: Handle<CallpathDef>,
        region: Handle<RegionDef>,
    ) -> Result<Handle<CallpathDef>, AllocError> {
        self.add(CallpathDef { parent, region })
    }
}
