// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;
use std::fmt;

/// The categories of unrecoverable failures.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FatalKind {
    /// The memory budget, or memory for bookkeeping, is exhausted.
    OutOfMemory,
    /// An operation was called with one of its preconditions broken.
    ContractViolation,
    /// A participant of a collective operation is gone or sent garbage.
    DistributedInconsistency,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FatalKind::OutOfMemory => "out of memory",
            FatalKind::ContractViolation => "contract violation",
            FatalKind::DistributedInconsistency => "distributed inconsistency",
        })
    }
}

/// An unrecoverable failure. Code that detects one returns it up to the
/// top level of the measurement, which calls [Fatal::terminate]. Nothing in
/// between handles it. It does not implement [std::error::Error] and does
/// not convert into recoverable error types.
#[must_use = "a Fatal must reach the top level and terminate the process"]
#[derive(Debug)]
pub struct Fatal {
    kind: FatalKind,
    message: Cow<'static, str>,
    reported: bool,
}

impl Fatal {
    #[cold]
    pub fn new(kind: FatalKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            reported: false,
        }
    }

    #[cold]
    pub fn out_of_memory(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(FatalKind::OutOfMemory, message)
    }

    #[cold]
    pub fn contract_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(FatalKind::ContractViolation, message)
    }

    #[cold]
    pub fn distributed_inconsistency(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(FatalKind::DistributedInconsistency, message)
    }

    /// Marks the diagnostics of this failure as already printed, so that
    /// [Fatal::terminate] does not print them again.
    pub fn reported(mut self) -> Self {
        self.reported = true;
        self
    }

    pub fn kind(&self) -> FatalKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }

    /// Prints the diagnostic unless it was printed before, and aborts.
    #[cold]
    pub fn terminate(self) -> ! {
        if !self.reported {
            tracing::error!(kind = %self.kind, "{}", self.message);
            eprintln!("[measure] Fatal {}: {}", self.kind, self.message);
        }
        std::process::abort()
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Returns a contract violation from the enclosing function unless the
/// condition holds.
#[macro_export]
macro_rules! ensure_contract {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Fatal::contract_violation(format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(value: u32) -> Result<u32, Fatal> {
        ensure_contract!(value < 10, "value {value} is out of range");
        Ok(value)
    }

    #[test]
    fn ensure_contract() {
        assert_eq!(checked(3).unwrap(), 3);
        let fatal = checked(12).unwrap_err();
        assert_eq!(fatal.kind(), FatalKind::ContractViolation);
        assert_eq!(fatal.message(), "value 12 is out of range");
        assert_eq!(fatal.to_string(), "contract violation: value 12 is out of range");
    }

    #[test]
    fn reported() {
        let fatal = Fatal::out_of_memory("budget exhausted");
        assert!(!fatal.is_reported());
        let fatal = fatal.reported();
        assert!(fatal.is_reported());
        assert_eq!(fatal.kind(), FatalKind::OutOfMemory);
    }
}
