// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Ipc;
use libmeasure_common::Fatal;

/// The single rank of a run which is not distributed. Collective operations
/// complete locally and point-to-point messages have nobody to go to.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialIpc;

impl Ipc for SerialIpc {
    fn rank(&self) -> u32 {
        0
    }

    fn size(&self) -> u32 {
        1
    }

    fn send(&self, dest: u32, _bytes: &[u8]) -> Result<(), Fatal> {
        Err(Fatal::contract_violation(format!(
            "cannot send to rank {dest} in a single process run"
        )))
    }

    fn recv(&self, source: u32) -> Result<Vec<u8>, Fatal> {
        Err(Fatal::contract_violation(format!(
            "cannot receive from rank {source} in a single process run"
        )))
    }
}
