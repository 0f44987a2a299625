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
    pub enum MetricSourceType {
        Papi = 0,
        Rusage = 1,
        User = 2,
        Other = 3,
        Task = 4,
        Plugin = 5,
    }
}

wire_enum! {
    pub enum MetricMode {
        AccumulatedStart = 0,
        AccumulatedPoint = 1,
        AccumulatedLast = 2,
        AbsolutePoint = 3,
        AbsoluteLast = 4,
        RelativePoint = 5,
        RelativeLast = 6,
    }
}

wire_enum! {
    pub enum MetricValueType {
        Int64 = 0,
        Uint64 = 1,
        Double = 2,
    }
}

wire_enum! {
    pub enum MetricBase {
        Binary = 0,
        Decimal = 1,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MetricDef {
    pub name: Handle<StringDef>,
    pub description: Handle<StringDef>,
    pub source_type: MetricSourceType,
    pub mode: MetricMode,
    pub value_type: MetricValueType,
    pub base: MetricBase,
    pub exponent: i64,
    pub unit: Handle<StringDef>,
}

impl Definition for MetricDef {
    const KIND: DefinitionKind = DefinitionKind::Metric;

    fn encode(&self, out: &mut Encoder<'_>) {
        out.handle(self.name);
        out.handle(self.description);
        self.source_type.encode(out);
        self.mode.encode(out);
        self.value_type.encode(out);
        self.base.encode(out);
        out.i64(self.exponent);
        out.handle(self.unit);
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        Some(Self {
            name: input.handle()?,
            description: input.handle()?,
            source_type: MetricSourceType::decode(input)?,
            mode: MetricMode::decode(input)?,
            value_type: MetricValueType::decode(input)?,
            base: MetricBase::decode(input)?,
            exponent: input.i64()?,
            unit: input.handle()?,
        })
    }

    fn hash(&self, state: &mut DefinitionHasher<'_>) {
        state.reference(self.name);
        state.reference(self.description);
        state.write(&self.source_type);
        state.write(&self.mode);
        state.write(&self.value_type);
        state.write(&self.base);
        state.write(&self.exponent);
        state.reference(self.unit);
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn unify(&self, source: &DefinitionManager) -> Result<Self, Fatal> {
        Ok(Self {
            name: translate(source, self.name)?,
            description: translate(source, self.description)?,
            unit: translate(source, self.unit)?,
            ..*self
        })
    }
}

impl DefinitionManager {
    pub fn new_metric(&mut self, metric: MetricDef) -> Result<Handle<MetricDef>, AllocError> {
        self.add(metric)
    }
}
