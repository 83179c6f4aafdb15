//! Command configuration resolved from CLI flags and the environment.
//!
//! Everything the subcommands need is settled once in [`CliConfig::from_args`]
//! before any source is read.

use anyhow::{Context, Result};
use capsule_lower::{GenerationBaseline, LowerOptions, MergePolicy};
use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};

/// Environment variable consulted when `--log` is absent.
pub const LOG_ENV: &str = "CAPSULE_LOG";

/// Log filter used when neither `--log` nor `CAPSULE_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Maximum source file size in bytes (1MB)
pub const MAX_SOURCE_SIZE: usize = 1_000_000;

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Pretty,
    Json,
}

/// Flags shared by `lower` and `run`.
#[derive(Args, Debug, Clone, Default)]
pub struct LowerFlags {
    /// Fold block environments into their enclosing environment when safe
    #[arg(long)]
    pub merge: bool,

    /// Add the generation-expansion field to value-type environments
    #[arg(long)]
    pub incremental: bool,

    /// Prior generation baseline (JSON) to reconcile layouts against
    #[arg(long)]
    pub baseline: Option<PathBuf>,

    /// Write the baseline for the next generation to this file
    #[arg(long)]
    pub emit_baseline: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    /// `tracing_subscriber::EnvFilter` directive.
    pub log_filter: String,
    pub options: LowerOptions,
    pub baseline: Option<PathBuf>,
    pub emit_baseline: Option<PathBuf>,
}

impl CliConfig {
    pub fn from_args(log: Option<&str>, flags: &LowerFlags) -> Self {
        let env = std::env::var(LOG_ENV).ok();
        let merge = if flags.merge {
            MergePolicy::Contained
        } else {
            MergePolicy::Never
        };
        Self {
            log_filter: resolve_log_filter(log, env.as_deref()),
            options: LowerOptions::new()
                .merge(merge)
                .incremental(flags.incremental),
            baseline: flags.baseline.clone(),
            emit_baseline: flags.emit_baseline.clone(),
        }
    }

    /// Read the `--baseline` file, if one was given.
    pub fn load_baseline(&self) -> Result<Option<GenerationBaseline>> {
        let Some(path) = &self.baseline else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read baseline '{}'", path.display()))?;
        let baseline = GenerationBaseline::from_json(&text)
            .with_context(|| format!("invalid baseline '{}'", path.display()))?;
        Ok(Some(baseline))
    }
}

/// `--log` wins over the environment; blank values count as unset.
pub fn resolve_log_filter(flag: Option<&str>, env: Option<&str>) -> String {
    flag.or(env)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

/// Read a source file, refusing anything over [`MAX_SOURCE_SIZE`].
pub fn read_source(path: &Path) -> Result<String> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    if src.len() > MAX_SOURCE_SIZE {
        anyhow::bail!(
            "source file exceeds {}MB limit ({} bytes)",
            MAX_SOURCE_SIZE / 1_000_000,
            src.len()
        );
    }
    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_flag_overrides_environment() {
        assert_eq!(resolve_log_filter(Some("debug"), Some("trace")), "debug");
        assert_eq!(resolve_log_filter(None, Some("trace")), "trace");
    }

    #[test]
    fn blank_log_values_fall_back_to_default() {
        assert_eq!(resolve_log_filter(None, None), DEFAULT_LOG_FILTER);
        assert_eq!(resolve_log_filter(Some("  "), None), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn merge_flag_selects_contained_policy() {
        let flags = LowerFlags {
            merge: true,
            incremental: true,
            ..LowerFlags::default()
        };
        let config = CliConfig::from_args(Some("warn"), &flags);
        assert_eq!(config.options.merge, MergePolicy::Contained);
        assert!(config.options.incremental);
        assert!(config.baseline.is_none());
    }

    #[test]
    fn oversized_source_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.cap");
        std::fs::write(&path, "x".repeat(MAX_SOURCE_SIZE + 1)).expect("write");
        let err = read_source(&path).unwrap_err();
        assert!(err.to_string().contains("1MB limit"));
    }
}
