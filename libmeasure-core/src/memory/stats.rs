// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Memory, MemoryClass};
use crate::ipc::{Ipc, IpcExt, ReduceOp};
use libmeasure_alloc::{AllocatorStats, MemoryStats};
use libmeasure_common::{Fatal, StatsMode};
use std::io::{self, Write};

const FIELD_COUNT: usize = MemoryStats::FIELDS.len();

/// Memory usage of one process: the allocator's budget, and the usage of
/// the live page managers summed per memory class.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryReport {
    pub allocator: AllocatorStats,
    pub classes: [MemoryStats; MemoryClass::ALL.len()],
    pub page_managers: u64,
}

impl MemoryReport {
    pub fn class(&self, class: MemoryClass) -> MemoryStats {
        self.classes[class as usize]
    }

    fn rows(&self) -> Vec<(String, [u64; FIELD_COUNT])> {
        let mut rows = vec![
            ("pages".to_owned(), self.allocator.pages.to_array()),
            ("maintenance".to_owned(), self.allocator.maintenance.to_array()),
        ];
        rows.extend(
            MemoryClass::ALL
                .iter()
                .map(|class| (class.to_string(), self.class(*class).to_array())),
        );
        rows
    }

    /// Flattens the counters for collective reductions.
    fn to_values(&self) -> Vec<u64> {
        let mut values: Vec<u64> = self.rows().iter().flat_map(|(_, row)| *row).collect();
        values.push(u64::from(self.allocator.pages_high_watermark));
        values.push(self.page_managers);
        values
    }

    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        write_header(out, &["value"])?;
        for (name, row) in self.rows() {
            for (field, value) in MemoryStats::FIELDS.iter().zip(row) {
                writeln!(out, "  {name:<16}{field:<32}{value:>16}")?;
            }
        }
        writeln!(
            out,
            "  {:<48}{:>16}",
            "pages high watermark", self.allocator.pages_high_watermark
        )?;
        writeln!(out, "  {:<48}{:>16}", "page managers", self.page_managers)
    }
}

fn write_header(out: &mut dyn Write, columns: &[&str]) -> io::Result<()> {
    write!(out, "  {:<48}", "")?;
    for column in columns {
        write!(out, "{column:>16}")?;
    }
    writeln!(out)
}

impl Memory {
    /// Snapshots the counters of the allocator and of every live page
    /// manager. No page manager is locked for this.
    pub fn collect_stats(&self) -> MemoryReport {
        let mut report = MemoryReport {
            allocator: self.allocator.stats(),
            ..MemoryReport::default()
        };
        let registry = self.registry.lock();
        for (class, counters) in registry.iter() {
            if let Some(counters) = counters.upgrade() {
                report.classes[*class as usize].accumulate(&counters.snapshot());
                report.page_managers += 1;
            }
        }
        report
    }

    /// Writes the memory statistics of all processes at rank 0. Aggregated
    /// mode reduces them to minimum, mean and maximum, full mode lists every
    /// process. Every rank has to call this.
    pub fn dump_stats(
        &self,
        message: &str,
        mode: StatsMode,
        ipc: &dyn Ipc,
        out: &mut dyn Write,
    ) -> Result<(), Fatal> {
        let report = self.collect_stats();
        let values = report.to_values();
        let labels = labels(&report);
        let written = match mode {
            StatsMode::Off => return Ok(()),
            StatsMode::Aggregated => {
                let min = ipc.reduce(&values, ReduceOp::Min, 0)?;
                let max = ipc.reduce(&values, ReduceOp::Max, 0)?;
                let sum = ipc.reduce(&values, ReduceOp::Sum, 0)?;
                match (min, max, sum) {
                    (Some(min), Some(max), Some(sum)) => {
                        let size = u64::from(ipc.size().max(1));
                        write_aggregated(out, message, &labels, &min, &max, &sum, size)
                    }
                    _ => Ok(()),
                }
            }
            StatsMode::Full => match ipc.gatherv(&values, 0)? {
                Some(per_rank) => write_full(out, message, &labels, &per_rank),
                None => Ok(()),
            },
        };
        written.map_err(|e| {
            Fatal::contract_violation(format!("cannot write memory statistics: {e}"))
        })
    }
}

fn labels(report: &MemoryReport) -> Vec<String> {
    let mut labels: Vec<String> = report
        .rows()
        .into_iter()
        .flat_map(|(name, _)| {
            MemoryStats::FIELDS
                .iter()
                .map(move |field| format!("{name:<16}{field:<32}"))
        })
        .collect();
    labels.push(format!("{:<48}", "pages high watermark"));
    labels.push(format!("{:<48}", "page managers"));
    labels
}

fn write_aggregated(
    out: &mut dyn Write,
    message: &str,
    labels: &[String],
    min: &[u64],
    max: &[u64],
    sum: &[u64],
    size: u64,
) -> io::Result<()> {
    writeln!(out, "[measure] Memory statistics {message} (over {size} processes)")?;
    write_header(out, &["min", "mean", "max"])?;
    for (index, label) in labels.iter().enumerate() {
        writeln!(
            out,
            "  {label}{:>16}{:>16}{:>16}",
            min[index],
            sum[index] / size,
            max[index]
        )?;
    }
    out.flush()
}

fn write_full(
    out: &mut dyn Write,
    message: &str,
    labels: &[String],
    per_rank: &[Vec<u64>],
) -> io::Result<()> {
    writeln!(out, "[measure] Memory statistics {message}")?;
    let ranks: Vec<String> = (0..per_rank.len()).map(|rank| format!("rank {rank}")).collect();
    let columns: Vec<&str> = ranks.iter().map(String::as_str).collect();
    write_header(out, &columns)?;
    for (index, label) in labels.iter().enumerate() {
        write!(out, "  {label}")?;
        for values in per_rank {
            write!(out, "{:>16}", values.get(index).copied().unwrap_or_default())?;
        }
        writeln!(out)?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{SerialIpc, ThreadIpc};
    use libmeasure_common::MemoryConfig;
    use std::thread;

    #[test]
    fn classes_are_summed() {
        let memory = Memory::new(MemoryConfig::new(64 * 1024, 1024)).unwrap();
        let mut a = memory.create_page_manager(MemoryClass::Misc).unwrap();
        let mut b = memory.create_page_manager(MemoryClass::Misc).unwrap();
        a.alloc(100).unwrap();
        b.alloc(28).unwrap();
        let _profiling = memory.create_page_manager(MemoryClass::Profiling).unwrap();

        let report = memory.collect_stats();
        let misc = report.class(MemoryClass::Misc);
        assert_eq!(misc.pages_allocated, 2);
        assert_eq!(misc.pages_used, 2);
        assert_eq!(misc.memory_used, 128);
        assert_eq!(report.class(MemoryClass::Profiling).pages_used, 0);
        assert_eq!(report.page_managers, 3);
        assert_eq!(report.allocator.pages.pages_used, 3);
        assert_eq!(labels(&report).len(), report.to_values().len());
    }

    #[test]
    fn serial_dumps() {
        let memory = Memory::new(MemoryConfig::new(64 * 1024, 1024)).unwrap();
        let mut out = Vec::new();
        memory
            .dump_stats("at exit", StatsMode::Off, &SerialIpc, &mut out)
            .unwrap();
        assert!(out.is_empty());

        memory
            .dump_stats("at exit", StatsMode::Aggregated, &SerialIpc, &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Memory statistics at exit (over 1 processes)"));
        assert!(text.contains("mean"));
    }

    #[test]
    fn full_dump_lists_every_rank() {
        let dumps: Vec<Vec<u8>> = ThreadIpc::group(3)
            .into_iter()
            .map(|ipc| {
                thread::spawn(move || {
                    let memory = Memory::new(MemoryConfig::new(64 * 1024, 1024)).unwrap();
                    let _misc = memory.create_page_manager(MemoryClass::Misc).unwrap();
                    let mut out = Vec::new();
                    memory
                        .dump_stats("at exit", StatsMode::Full, &ipc, &mut out)
                        .unwrap();
                    out
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let root = String::from_utf8(dumps[0].clone()).unwrap();
        assert!(root.contains("rank 2"));
        assert!(dumps[1].is_empty());
        assert!(dumps[2].is_empty());
    }
}
