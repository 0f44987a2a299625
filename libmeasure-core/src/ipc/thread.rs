// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Ipc;
use crossbeam_channel::{Receiver, Sender};
use libmeasure_common::Fatal;
use tracing::trace;

/// One rank of a run whose ranks are threads of this process, connected by
/// a channel per ordered pair of ranks. Dropping a rank disconnects it, and
/// its peers see a distributed inconsistency when they talk to it.
pub struct ThreadIpc {
    rank: u32,
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Vec<Receiver<Vec<u8>>>,
}

impl ThreadIpc {
    /// Creates the `size` connected ranks of a run, indexed by rank.
    pub fn group(size: u32) -> Vec<ThreadIpc> {
        let size = size.max(1) as usize;
        // channels[source][dest]
        let mut channels: Vec<Vec<_>> = (0..size)
            .map(|_| (0..size).map(|_| crossbeam_channel::unbounded()).collect())
            .collect();
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> = vec![Vec::with_capacity(size); size];
        let mut receivers: Vec<Vec<Receiver<Vec<u8>>>> = vec![Vec::with_capacity(size); size];
        for (source, row) in channels.iter_mut().enumerate() {
            for (dest, (sender, receiver)) in row.drain(..).enumerate() {
                senders[source].push(sender);
                receivers[dest].push(receiver);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ThreadIpc {
                rank: rank as u32,
                senders,
                receivers,
            })
            .collect()
    }

    fn peer<'a, T>(&self, peers: &'a [T], peer: u32) -> Result<&'a T, Fatal> {
        if peer == self.rank {
            return Err(Fatal::contract_violation(format!(
                "rank {peer} cannot message itself"
            )));
        }
        peers.get(peer as usize).ok_or_else(|| {
            Fatal::contract_violation(format!("rank {peer} is not part of this run"))
        })
    }
}

impl Ipc for ThreadIpc {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.senders.len() as u32
    }

    fn send(&self, dest: u32, bytes: &[u8]) -> Result<(), Fatal> {
        trace!(source = self.rank, dest, len = bytes.len(), "Sending message");
        self.peer(&self.senders, dest)?
            .send(bytes.to_vec())
            .map_err(|_| {
                Fatal::distributed_inconsistency(format!(
                    "rank {dest} left the run before rank {} could send to it",
                    self.rank
                ))
            })
    }

    fn recv(&self, source: u32) -> Result<Vec<u8>, Fatal> {
        self.peer(&self.receivers, source)?.recv().map_err(|_| {
            Fatal::distributed_inconsistency(format!(
                "rank {source} left the run while rank {} waited for it",
                self.rank
            ))
        })
    }
}
