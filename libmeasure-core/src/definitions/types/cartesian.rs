// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CommRef, CommunicatorScoped, StringDef};
use crate::definitions::codec::{Decoder, Encoder};
use crate::definitions::{
    translate, Definition, DefinitionHasher, DefinitionKind, DefinitionManager, Handle,
};
use libmeasure_alloc::AllocError;
use libmeasure_common::Fatal;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CartesianDimension {
    pub name: Handle<StringDef>,
    pub size: u32,
    pub periodic: bool,
}

/// A process grid laid over the ranks of a communicator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CartesianTopologyDef {
    pub name: Handle<StringDef>,
    pub comm: CommRef,
    pub dimensions: Vec<CartesianDimension>,
}

impl Definition for CartesianTopologyDef {
    const KIND: DefinitionKind = DefinitionKind::CartesianTopology;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        self.comm.encode(out);
        out.u32(self.dimensions.len() as u32);
        for dimension in &self.dimensions {
            out.handle(dimension.name);
            out.u32(dimension.size);
            out.bool(dimension.periodic);
        }
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        let name = input.handle()?;
        let comm = CommRef::decode(input)?;
        let count = input.u32()?;
        let dimensions = (0..count)
            .map(|_| {
                Some(CartesianDimension {
                    name: input.handle()?,
                    size: input.u32()?,
                    periodic: input.bool()?,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            name,
            comm,
            dimensions,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        self.comm.hash(state);
        for dimension in &self.dimensions {
            state.reference(dimension.name);
            state.write(&dimension.size);
            state.write(&dimension.periodic);
        }
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        let dimensions = self
            .dimensions
            .iter()
            .map(|dimension| {
                Ok(CartesianDimension {
                    name: translate(source, dimension.name)?,
                    ..*dimension
                })
            })
            .collect::<Result<Vec<_>, Fatal>>()?;
        Ok(Self {
            name: translate(source, self.name)?,
            comm: self.comm.unify(source)?,
            dimensions,
        })
    }
}

impl CommunicatorScoped for CartesianTopologyDef {
    fn comm_ref(&mut self) -> &mut CommRef {
        &mut self.comm
    }
}

impl DefinitionManager {
    pub fn new_cartesian_topology(
        &mut self,
        name: Handle<StringDef>,
        comm: CommRef,
        dimensions: &[CartesianDimension],
    ) -> Result<Handle<CartesianTopologyDef>, AllocError> {
        self.add(CartesianTopologyDef {
            name,
            comm,
            dimensions: dimensions.to_vec(),
        })
    }
}
