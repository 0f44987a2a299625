// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One record type per definition kind. Each file also adds the matching
//! `new_*` constructor to [super::DefinitionManager].

mod callpath;
mod cartesian;
mod communicator;
mod group;
mod io_handle;
mod location;
mod metric;
mod parameter;
mod region;
mod rma_window;
mod source_file;
mod string;
mod system_tree;

pub use callpath::*;
pub use cartesian::*;
pub use communicator::*;
pub use group::*;
pub use io_handle::*;
pub use location::*;
pub use metric::*;
pub use parameter::*;
pub use region::*;
pub use rma_window::*;
pub use source_file::*;
pub use string::*;
pub use system_tree::*;

use super::codec::wire_enum;

wire_enum! {
    /// The programming model a definition belongs to.
    pub enum Paradigm {
        User = 0,
        Compiler = 1,
        Sampling = 2,
        Mpi = 3,
        OpenMp = 4,
        Pthread = 5,
        Cuda = 6,
        Io = 7,
        Shmem = 8,
        Measurement = 9,
    }
}

impl Default for Paradigm {
    fn default() -> Self {
        Self::User
    }
}
