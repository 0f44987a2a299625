// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod allocator;
mod bitset;
mod movable;
mod page;
mod page_manager;
mod stats;
mod utils;

pub use allocator::*;
pub use movable::*;
pub use page_manager::*;
pub use stats::*;
pub use utils::npot;

// Expose the error type of allocator_api2 for our users.
pub use allocator_api2::alloc::AllocError;
