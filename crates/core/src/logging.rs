//! Log filter selection and the rolling log file.
//!
//! The subscriber itself is assembled by the binary; this module only decides
//! which directives each sink gets and opens the file sink.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::config::logs_dir;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
/// Per-batch detail kept in the log file when the user did not pick a filter.
pub const FILE_DETAIL_FILTER: &str = "tileup_core::executor=debug";

const LOG_FILE_PREFIX: &str = "tileup";
const LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    /// `--log-filter`
    Flag,
    /// `-v` / `-vv`
    Verbosity,
    /// `RUST_LOG`
    Environment,
    Default,
}

impl FilterSource {
    /// The user asked for these exact directives on the command line.
    pub fn is_explicit(self) -> bool {
        matches!(self, Self::Flag | Self::Verbosity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub source: FilterSource,
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` beats `-v`, which beats a non-empty `RUST_LOG`.
    ///
    /// Unless the choice came from the command line, the file sink also
    /// records executor batch detail so a failed run can be diagnosed after
    /// the fact without re-running it verbosely.
    pub fn select(cli_filter: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        let (source, console) = match (cli_filter, verbose, rust_log) {
            (Some(filter), _, _) => (FilterSource::Flag, filter.to_string()),
            (None, 1, _) => (FilterSource::Verbosity, "debug".to_string()),
            (None, 2.., _) => (FilterSource::Verbosity, "trace".to_string()),
            (None, 0, Some(env)) if !env.trim().is_empty() => {
                (FilterSource::Environment, env.trim().to_string())
            }
            _ => (FilterSource::Default, DEFAULT_LOG_FILTER.to_string()),
        };

        let file = if source.is_explicit() {
            console.clone()
        } else {
            format!("{console},{FILE_DETAIL_FILTER}")
        };

        Self {
            source,
            console,
            file,
        }
    }
}

/// Daily-rolling `tileup.*.log` under `<data_dir>/logs`, keeping at most
/// `retention_files` files.
pub fn open_log_file(data_dir: &Path, retention_files: usize) -> Result<RollingFileAppender> {
    let dir = logs_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_files.max(1))
        .build(&dir)
        .with_context(|| format!("failed to open rolling log file in {}", dir.display()))
}
