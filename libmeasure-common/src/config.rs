// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

pub const ENV_TOTAL_MEMORY: &str = "MEASURE_TOTAL_MEMORY";
pub const ENV_PAGE_SIZE: &str = "MEASURE_PAGE_SIZE";
pub const ENV_MEMORY_STATS: &str = "MEASURE_DEVELOPMENT_MEMORY_STATS";
pub const ENV_LOG: &str = "MEASURE_LOG";

pub const DEFAULT_TOTAL_MEMORY: u64 = 16_000 * 1024;
pub const DEFAULT_PAGE_SIZE: u64 = 8 * 1024;
pub use libmeasure_alloc::{MAX_TOTAL_MEMORY, MIN_PAGE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid size {value:?} in {name}")]
    InvalidSize { name: &'static str, value: String },
    #[error("invalid memory statistics mode {0:?}, expected one of: none, aggregated, full")]
    InvalidStatsMode(String),
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("a global subscriber is already installed")]
    LoggerAlreadySet,
}

pub mod parse_env {
    use std::{env, str::FromStr};

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.trim().is_empty())
    }

    /// A byte count with an optional `k`, `m` or `g` suffix, e.g. `16000k`.
    pub fn size(name: &str) -> Option<Option<u64>> {
        str_not_empty(name).map(|value| super::parse_size(&value))
    }
}

/// Parses a byte count such as `512`, `8k`, `16000K`, `2M` or `1gb`.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, shift) = match value.char_indices().last()? {
        (i, 'k') => (&value[..i], 10),
        (i, 'm') => (&value[..i], 20),
        (i, 'g') => (&value[..i], 30),
        _ => (value, 0),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(1 << shift)
}

/// What to print about memory usage when the measurement ends.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StatsMode {
    #[default]
    Off,
    /// Minimum, mean and maximum over all processes, printed by rank zero.
    Aggregated,
    /// Every process's numbers, printed by rank zero.
    Full,
}

impl FromStr for StatsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "no" | "off" | "false" | "0" => Ok(StatsMode::Off),
            "aggregated" | "yes" | "true" | "1" => Ok(StatsMode::Aggregated),
            "full" => Ok(StatsMode::Full),
            _ => Err(ConfigError::InvalidStatsMode(s.to_owned())),
        }
    }
}

impl fmt::Display for StatsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatsMode::Off => "none",
            StatsMode::Aggregated => "aggregated",
            StatsMode::Full => "full",
        })
    }
}

/// Memory budget of one process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryConfig {
    pub total_memory: u64,
    pub page_size: u64,
    pub stats_mode: StatsMode,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_memory: DEFAULT_TOTAL_MEMORY,
            page_size: DEFAULT_PAGE_SIZE,
            stats_mode: StatsMode::Off,
        }
    }
}

impl MemoryConfig {
    pub fn new(total_memory: u64, page_size: u64) -> Self {
        Self {
            total_memory,
            page_size,
            stats_mode: StatsMode::Off,
        }
        .normalized()
    }

    /// Reads the configuration from the environment. Unset variables take
    /// their defaults, malformed ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(total) = parse_env::size(ENV_TOTAL_MEMORY) {
            config.total_memory = total.ok_or_else(|| invalid_size(ENV_TOTAL_MEMORY))?;
        }
        if let Some(page_size) = parse_env::size(ENV_PAGE_SIZE) {
            config.page_size = page_size.ok_or_else(|| invalid_size(ENV_PAGE_SIZE))?;
        }
        if let Some(mode) = parse_env::str_not_empty(ENV_MEMORY_STATS) {
            config.stats_mode = mode.parse()?;
        }
        Ok(config.normalized())
    }

    /// Rounds the page size up to a power of two of at least
    /// [MIN_PAGE_SIZE] bytes, and clamps the total memory to
    /// [MAX_TOTAL_MEMORY].
    pub fn normalized(mut self) -> Self {
        self.page_size = libmeasure_alloc::normalize_page_size(self.page_size);
        self.total_memory = libmeasure_alloc::clamp_total_memory(self.total_memory);
        self
    }
}

fn invalid_size(name: &'static str) -> ConfigError {
    ConfigError::InvalidSize {
        name,
        value: parse_env::str_not_empty(name).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("8k"), Some(8 * 1024));
        assert_eq!(parse_size("16000K"), Some(16_000 * 1024));
        assert_eq!(parse_size(" 2M "), Some(2 << 20));
        assert_eq!(parse_size("1gb"), Some(1 << 30));
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size("ten"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("99999999999999999999g"), None);
    }

    #[test]
    fn stats_modes() {
        assert_eq!("".parse::<StatsMode>().unwrap(), StatsMode::Off);
        assert_eq!("Aggregated".parse::<StatsMode>().unwrap(), StatsMode::Aggregated);
        assert_eq!("full".parse::<StatsMode>().unwrap(), StatsMode::Full);
        assert!("sometimes".parse::<StatsMode>().is_err());
    }

    #[test]
    fn normalization() {
        let config = MemoryConfig::new(u64::MAX, 600);
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.total_memory, MAX_TOTAL_MEMORY);

        let config = MemoryConfig::new(1 << 20, 1);
        assert_eq!(config.page_size, MIN_PAGE_SIZE);
        assert_eq!(config.total_memory, 1 << 20);
    }

    #[test]
    fn from_env() {
        // The only test touching these variables, so there is no race.
        std::env::set_var(ENV_TOTAL_MEMORY, "1M");
        std::env::set_var(ENV_PAGE_SIZE, "3000");
        std::env::set_var(ENV_MEMORY_STATS, "full");
        let config = MemoryConfig::from_env().unwrap();
        assert_eq!(config.total_memory, 1 << 20);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.stats_mode, StatsMode::Full);

        std::env::set_var(ENV_PAGE_SIZE, "lots");
        assert!(matches!(
            MemoryConfig::from_env(),
            Err(ConfigError::InvalidSize { name: ENV_PAGE_SIZE, .. })
        ));

        std::env::remove_var(ENV_TOTAL_MEMORY);
        std::env::remove_var(ENV_PAGE_SIZE);
        std::env::remove_var(ENV_MEMORY_STATS);
        assert_eq!(MemoryConfig::from_env().unwrap(), MemoryConfig::default());
    }
}
