// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::StringDef;
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SourceFileDef {
    pub name: Handle<StringDef>,
}

impl Definition for SourceFileDef {
    const KIND: DefinitionKind = DefinitionKind::SourceFile;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
    }

    fn equals(&self, other: &Self) -> bool {
        self.name == other.name
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
        })
    }
}

impl DefinitionManager {
    pub fn new_source_file(&mut self, name: &str) -> Result<Handle<SourceFileDef>, AllocError> {
        let name = self.new_string(name)?;
        self.add(SourceFileDef { name })
    }
}
