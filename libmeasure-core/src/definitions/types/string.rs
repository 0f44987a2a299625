// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringDef {
    pub value: String,
}

impl Definition for StringDef {
    const KIND: DefinitionKind = DefinitionKind::String;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.bytes(self.value.as_bytes());
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            value: input.string()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.write(self.value.as_str());
    }

    fn equals(&self, other: &Self) -> bool {
        self.value == other.value
    }

    fn unify(&self, _source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(self.clone())
    }
}

impl DefinitionManager {
    pub fn new_string(&mut self, value: &str) -> Result<Handle<StringDef>, AllocError> {
        self.add(StringDef {
            value: value.to_owned(),
        })
    }

    /// The text of `handle`, if it resolves.
    pub fn string(&self, handle: Handle<StringDef>) -> Option<String> {
        self.get(handle).map(|s| s.value)
    }
}
