// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::StringDef;
use crate::definitions::codec::{wire_enum, Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

wire_enum! {
    pub enum ParameterType {
        Int64 = 0,
        Uint64 = 1,
        String = 2,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParameterDef {
    pub name: Handle<StringDef>,
    pub parameter_type: ParameterType,
}

impl Definition for ParameterDef {
    const KIND: DefinitionKind = DefinitionKind::Parameter;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        self.parameter_type.encode(out);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            parameter_type: ParameterType::decode(input)?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.write(&self.parameter_type);
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            parameter_type: self.parameter_type,
        })
    }
}

impl DefinitionManager {
    pub fn new_parameter(
        &mut self,
        name: &str,
        parameter_type: ParameterType,
    ) -> Result<Handle<ParameterDef>, AllocError> {
        let name = self.new_string(name)?;
        self.add(ParameterDef {
            name,
            parameter_type,
        })
    }
}
