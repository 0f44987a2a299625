// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::StringDef;
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

/// A node of the machine hierarchy: machine, node, socket and so on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SystemTreeNodeDef {
    pub parent: Handle<SystemTreeNodeDef>,
    pub name: Handle<StringDef>,
    pub class_name: Handle<StringDef>,
}

impl Definition for SystemTreeNodeDef {
    const KIND: DefinitionKind = DefinitionKind::SystemTreeNode;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.parent);
        out.handle(self.name);
        out.handle(self.class_name);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            parent: input.handle()?,
            name: input.handle()?,
            class_name: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.parent);
        state.reference(self.name);
        state.reference(self.class_name);
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            parent: translate(source, self.parent)?,
            name: translate(source, self.name)?,
            class_name: translate(source, self.class_name)?,
        })
    }
}

impl DefinitionManager {
    pub fn new_system_tree_node(
        &mut self,
        parent: Handle<SystemTreeNodeDef>,
        name: Handle<StringDef>,
        class_name: Handle<StringDef>,
    ) -> Result<Handle<SystemTreeNodeDef>, AllocError> {
        self.add(SystemTreeNodeDef {
            parent,
            name,
            class_name,
        })
    }
}
