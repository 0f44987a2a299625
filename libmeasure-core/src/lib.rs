// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod definitions;
pub mod ipc;
mod measurement;
pub mod memory;
pub mod unify;

pub use measurement::*;

pub use libmeasure_alloc as alloc;
pub use libmeasure_common::log;
pub use libmeasure_common::{Fatal, FatalKind, MemoryConfig, StatsMode};
