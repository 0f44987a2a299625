// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The collective communication the unification relies on.
//!
//! An implementation only provides blocking point-to-point byte messages
//! between ranks. Barrier, broadcast, gather, scatter and reductions are
//! built on top of them here. Every rank has to take part in every
//! collective operation, in the same order.

mod serial;
mod thread;

pub use serial::SerialIpc;
pub use thread::ThreadIpc;

use byteorder::{ByteOrder, LittleEndian};
use libmeasure_common::Fatal;

/// Point-to-point messaging between the ranks of a run.
pub trait Ipc: Send + Sync {
    fn rank(&self) -> u32;

    fn size(&self) -> u32;

    /// Sends one message to `dest`, which must not be this rank.
    fn send(&self, dest: u32, bytes: &[u8]) -> Result<(), Fatal>;

    /// Blocks until the next message from `source` arrives. Fails with a
    /// distributed inconsistency if `source` is gone.
    fn recv(&self, source: u32) -> Result<Vec<u8>, Fatal>;

    fn is_multi_process(&self) -> bool {
        self.size() > 1
    }

    fn barrier(&self) -> Result<(), Fatal> {
        self.gatherv_bytes(&[], 0)?;
        self.broadcast_bytes(Vec::new(), 0)?;
        Ok(())
    }

    /// Returns the bytes of `root`. Only the root's `bytes` are used.
    fn broadcast_bytes(&self, bytes: Vec<u8>, root: u32) -> Result<Vec<u8>, Fatal> {
        if self.rank() != root {
            return self.recv(root);
        }
        for dest in (0..self.size()).filter(|dest| *dest != root) {
            self.send(dest, &bytes)?;
        }
        Ok(bytes)
    }

    /// Collects the bytes of every rank at `root`, indexed by rank. Other
    /// ranks get `None`.
    fn gatherv_bytes(&self, bytes: &[u8], root: u32) -> Result<Option<Vec<Vec<u8>>>, Fatal> {
        if self.rank() != root {
            self.send(root, bytes)?;
            return Ok(None);
        }
        (0..self.size())
            .map(|source| {
                if source == root {
                    Ok(bytes.to_vec())
                } else {
                    self.recv(source)
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Hands `parts[rank]` to every rank. Only the root's `parts` are used,
    /// and it must hold one part per rank.
    fn scatterv_bytes(&self, parts: Vec<Vec<u8>>, root: u32) -> Result<Vec<u8>, Fatal> {
        if self.rank() != root {
            return self.recv(root);
        }
        if parts.len() != self.size() as usize {
            return Err(Fatal::contract_violation(format!(
                "scatter needs {} parts, got {}",
                self.size(),
                parts.len()
            )));
        }
        let mut own = Vec::new();
        for (dest, part) in parts.into_iter().enumerate() {
            if dest as u32 == root {
                own = part;
            } else {
                self.send(dest as u32, &part)?;
            }
        }
        Ok(own)
    }
}

/// The fixed-width element types of collective operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Datatype {
    U8 = 1,
    I32 = 2,
    U32 = 3,
    U64 = 4,
    F64 = 5,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

pub trait Element: Copy + Send + 'static {
    const DATATYPE: Datatype;
    const WIDTH: usize;

    fn write(self, out: &mut [u8]);

    fn read(bytes: &[u8]) -> Self;

    fn combine(self, other: Self, op: ReduceOp) -> Self;
}

impl Element for u8 {
    const DATATYPE: Datatype = Datatype::U8;
    const WIDTH: usize = 1;

    fn write(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Min => self.min(other),
            ReduceOp::Max => self.max(other),
            ReduceOp::Sum => self.wrapping_add(other),
        }
    }
}

macro_rules! integer_element {
    ($ty:ty, $datatype:ident, $write:path, $read:path) => {
        impl Element for $ty {
            const DATATYPE: Datatype = Datatype::$datatype;
            const WIDTH: usize = core::mem::size_of::<$ty>();

            fn write(self, out: &mut [u8]) {
                $write(out, self)
            }

            fn read(bytes: &[u8]) -> Self {
                $read(bytes)
            }

            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Min => self.min(other),
                    ReduceOp::Max => self.max(other),
                    ReduceOp::Sum => self.wrapping_add(other),
                }
            }
        }
    };
}

integer_element!(i32, I32, LittleEndian::write_i32, LittleEndian::read_i32);
integer_element!(u32, U32, LittleEndian::write_u32, LittleEndian::read_u32);
integer_element!(u64, U64, LittleEndian::write_u64, LittleEndian::read_u64);

impl Element for f64 {
    const DATATYPE: Datatype = Datatype::F64;
    const WIDTH: usize = 8;

    fn write(self, out: &mut [u8]) {
        LittleEndian::write_f64(out, self)
    }

    fn read(bytes: &[u8]) -> Self {
        LittleEndian::read_f64(bytes)
    }

    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Min => self.min(other),
            ReduceOp::Max => self.max(other),
            ReduceOp::Sum => self + other,
        }
    }
}

fn encode<E: Element>(values: &[E]) -> Vec<u8> {
    let mut bytes = vec![0u8; 1 + values.len() * E::WIDTH];
    bytes[0] = E::DATATYPE as u8;
    for (value, out) in values.iter().copied().zip(bytes[1..].chunks_exact_mut(E::WIDTH)) {
        value.write(out);
    }
    bytes
}

fn decode<E: Element>(bytes: &[u8]) -> Result<Vec<E>, Fatal> {
    match bytes.split_first() {
        Some((datatype, body)) if *datatype == E::DATATYPE as u8 && body.len() % E::WIDTH == 0 => {
            Ok(body.chunks_exact(E::WIDTH).map(E::read).collect())
        }
        _ => Err(Fatal::distributed_inconsistency(format!(
            "received a malformed {:?} message of {} bytes",
            E::DATATYPE,
            bytes.len()
        ))),
    }
}

fn count_mismatch(what: &str, expected: usize, got: usize) -> Fatal {
    Fatal::distributed_inconsistency(format!(
        "{what}: expected {expected} elements, received {got}"
    ))
}

/// Typed collective operations over any [Ipc].
pub trait IpcExt: Ipc {
    /// Overwrites `values` with the values of `root`. All ranks pass the same
    /// number of values.
    fn broadcast<E: Element>(&self, values: &mut [E], root: u32) -> Result<(), Fatal> {
        let received = decode::<E>(&self.broadcast_bytes(encode(values), root)?)?;
        if received.len() != values.len() {
            return Err(count_mismatch("broadcast", values.len(), received.len()));
        }
        values.copy_from_slice(&received);
        Ok(())
    }

    /// Concatenates the values of all ranks at `root`, in rank order.
    fn gather<E: Element>(&self, values: &[E], root: u32) -> Result<Option<Vec<E>>, Fatal> {
        let Some(parts) = self.gatherv(values, root)? else {
            return Ok(None);
        };
        let mut gathered = Vec::with_capacity(values.len() * parts.len());
        for part in parts {
            if part.len() != values.len() {
                return Err(count_mismatch("gather", values.len(), part.len()));
            }
            gathered.extend(part);
        }
        Ok(Some(gathered))
    }

    /// Collects a differently sized slice from every rank at `root`.
    fn gatherv<E: Element>(&self, values: &[E], root: u32) -> Result<Option<Vec<Vec<E>>>, Fatal> {
        match self.gatherv_bytes(&encode(values), root)? {
            Some(parts) => parts
                .iter()
                .map(|part| decode(part))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            None => Ok(None),
        }
    }

    fn allgather<E: Element>(&self, values: &[E]) -> Result<Vec<E>, Fatal> {
        let gathered = self.gather(values, 0)?.unwrap_or_default();
        let all = decode::<E>(&self.broadcast_bytes(encode(&gathered), 0)?)?;
        let expected = values.len() * self.size() as usize;
        if all.len() != expected {
            return Err(count_mismatch("allgather", expected, all.len()));
        }
        Ok(all)
    }

    /// Hands `values[rank]` to every rank. Only the root's `values` are used.
    fn scatter<E: Element>(&self, values: &[E], root: u32) -> Result<E, Fatal> {
        let parts = if self.rank() == root {
            if values.len() != self.size() as usize {
                return Err(Fatal::contract_violation(format!(
                    "scatter needs {} values, got {}",
                    self.size(),
                    values.len()
                )));
            }
            values.iter().map(|value| encode(&[*value])).collect()
        } else {
            Vec::new()
        };
        let received = decode::<E>(&self.scatterv_bytes(parts, root)?)?;
        match received.as_slice() {
            [value] => Ok(*value),
            _ => Err(count_mismatch("scatter", 1, received.len())),
        }
    }

    /// Combines the values of all ranks element-wise at `root`.
    fn reduce<E: Element>(
        &self,
        values: &[E],
        op: ReduceOp,
        root: u32,
    ) -> Result<Option<Vec<E>>, Fatal> {
        let Some(parts) = self.gatherv(values, root)? else {
            return Ok(None);
        };
        let mut reduced = values.to_vec();
        for (rank, part) in parts.into_iter().enumerate() {
            if rank as u32 == root {
                continue;
            }
            if part.len() != reduced.len() {
                return Err(count_mismatch("reduce", reduced.len(), part.len()));
            }
            for (acc, value) in reduced.iter_mut().zip(part) {
                *acc = acc.combine(value, op);
            }
        }
        Ok(Some(reduced))
    }

    fn allreduce<E: Element>(&self, values: &[E], op: ReduceOp) -> Result<Vec<E>, Fatal> {
        let mut reduced = self.reduce(values, op, 0)?.unwrap_or_else(|| values.to_vec());
        self.broadcast(&mut reduced, 0)?;
        Ok(reduced)
    }
}

impl<T: Ipc + ?Sized> IpcExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run<R: Send + 'static>(
        size: u32,
        f: impl Fn(ThreadIpc) -> R + Send + Sync + Clone + 'static,
    ) -> Vec<R> {
        ThreadIpc::group(size)
            .into_iter()
            .map(|ipc| {
                let f = f.clone();
                thread::spawn(move || f(ipc))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    }

    #[test]
    fn serial_collectives_are_local() {
        let ipc = SerialIpc;
        assert!(!ipc.is_multi_process());
        ipc.barrier().unwrap();
        let mut values = [1u32, 2];
        ipc.broadcast(&mut values, 0).unwrap();
        assert_eq!(values, [1, 2]);
        assert_eq!(ipc.gather(&[7u64], 0).unwrap(), Some(vec![7]));
        assert_eq!(ipc.allreduce(&[3.5f64], ReduceOp::Sum).unwrap(), vec![3.5]);
        assert_eq!(ipc.scatter(&[9i32], 0).unwrap(), 9);
        assert_eq!(ipc.allgather(&[5u8]).unwrap(), vec![5]);
    }

    #[test]
    fn collectives_over_threads() {
        let results = run(4, |ipc| {
            let rank = ipc.rank();
            ipc.barrier().unwrap();

            let mut value = [if rank == 2 { 42u64 } else { 0 }];
            ipc.broadcast(&mut value, 2).unwrap();

            let gathered = ipc.gatherv(&vec![rank; rank as usize], 0).unwrap();
            let sums = ipc
                .allreduce(&[rank as i32, -(rank as i32)], ReduceOp::Sum)
                .unwrap();
            let max = ipc.reduce(&[rank as f64], ReduceOp::Max, 3).unwrap();
            let all = ipc.allgather(&[rank * 10]).unwrap();
            let scattered = ipc.scatter(&[100u32, 101, 102, 103], 1).unwrap();
            (rank, value[0], gathered, sums, max, all, scattered)
        });

        for (rank, value, gathered, sums, max, all, scattered) in results {
            assert_eq!(value, 42);
            assert_eq!(sums, vec![6, -6]);
            assert_eq!(all, vec![0, 10, 20, 30]);
            assert_eq!(scattered, 100 + rank);
            if rank == 0 {
                assert_eq!(
                    gathered,
                    Some(vec![vec![], vec![1], vec![2, 2], vec![3, 3, 3]])
                );
            } else {
                assert_eq!(gathered, None);
            }
            assert_eq!(max, (rank == 3).then_some(vec![3.0]));
        }
    }

    #[test]
    fn mismatched_collectives_are_inconsistent() {
        let results = run(2, |ipc| {
            let mut values = vec![0u32; ipc.rank() as usize + 1];
            ipc.broadcast(&mut values, 0).map_err(|fatal| fatal.kind())
        });
        assert!(results[0].is_ok());
        assert_eq!(
            results[1],
            Err(libmeasure_common::FatalKind::DistributedInconsistency)
        );

        let results = run(2, |ipc| {
            if ipc.rank() == 0 {
                ipc.send(1, &encode(&[1u64])).unwrap();
                Ok(0)
            } else {
                ipc.gather(&[0u32], 1)
                    .map(|_| 1)
                    .map_err(|fatal| fatal.kind())
            }
        });
        assert_eq!(
            results[1],
            Err(libmeasure_common::FatalKind::DistributedInconsistency)
        );
    }
}
