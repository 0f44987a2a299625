// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::{parse_env, ConfigError, ENV_LOG};
use std::sync::{Mutex, PoisonError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when neither the caller nor the environment provides one.
pub const DEFAULT_FILTER: &str = "warn";

static INSTALLED: Mutex<bool> = Mutex::new(false);

fn env_filter(filter: Option<&str>) -> Result<EnvFilter, ConfigError> {
    let directives = match filter {
        Some(filter) => filter.to_owned(),
        None => parse_env::str_not_empty(ENV_LOG).unwrap_or_else(|| DEFAULT_FILTER.to_owned()),
    };
    EnvFilter::try_new(&directives).map_err(|e| ConfigError::InvalidLogFilter(e.to_string()))
}

/// Installs the global subscriber writing to stderr, filtered by `filter` or
/// else by the `MEASURE_LOG` environment variable. Calling it again after a
/// successful installation does nothing. Fails if the filter is malformed or
/// if something else installed a global subscriber already.
pub fn init(filter: Option<&str>) -> Result<(), ConfigError> {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if *installed {
        return Ok(());
    }
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(filter)?)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        );
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| ConfigError::LoggerAlreadySet)?;
    *installed = true;
    Ok(())
}
