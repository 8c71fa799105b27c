//! Run configuration.
//!
//! Options arrive either programmatically or from a TOML file. Every
//! field has a default, so a config file only states what it changes.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generators carrying this tag talk to external systems; their rows are
/// never deduplicated against the repeats ledger.
pub const IO_TAG: &str = "io";

/// Generators carrying this tag fan their transform stage out over the
/// worker pool; everything else runs its transforms on the engine thread.
pub const PARALLEL_TAG: &str = "parallel";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// What to do with a generator that can do no work: a query matching no
/// rows, or a generator declaring no loads at all. An `io`-tagged
/// generator without loads is exempt; its side effects are its work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyGeneratorPolicy {
    /// Treat it as a failure; usually a sign of a broken predicate.
    #[default]
    Reject,
    /// Record it as successful with zero rows.
    Allow,
}

/// One run's worth of knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Reprocess rows already recorded in the repeats ledger.
    pub retry: bool,
    /// Run every generator on the caller's thread.
    pub force_serial: bool,
    /// Skip the COUNT(*) pass used to size batches.
    pub skip_count: bool,
    /// Fixed batch size, overriding per-generator settings.
    pub batch_size: Option<usize>,
    /// Run only these generators (empty = all).
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
    /// Run only generators carrying one of these tags (empty = all).
    pub include_tags: BTreeSet<String>,
    pub exclude_tags: BTreeSet<String>,
    /// Skip everything scheduled before this generator.
    pub start_at: Option<String>,
    /// Stop when this generator is reached (exclusive).
    pub stop_before: Option<String>,
    /// Drop and recreate the warehouse schema before running.
    pub reset_schema: bool,
    pub empty_generators: EmptyGeneratorPolicy,
    /// Worker thread count; defaults to the machine's CPU count minus one.
    pub workers: Option<usize>,
    /// Seed for anything stochastic a transform wants to derive.
    pub seed: Option<u64>,
}

impl RunOptions {
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Whether the name/tag filters select a generator. Positional
    /// filters (start_at, stop_before) are applied by the engine against
    /// the schedule, not here.
    pub fn selects(&self, name: &str, tags: &BTreeSet<String>) -> bool {
        if !self.include.is_empty() && !self.include.contains(name) {
            return false;
        }
        if self.exclude.contains(name) {
            return false;
        }
        if !self.include_tags.is_empty() && self.include_tags.is_disjoint(tags) {
            return false;
        }
        if !self.exclude_tags.is_disjoint(tags) {
            return false;
        }
        true
    }

    /// Every generator name the filters mention; the engine verifies
    /// these against the actual generator set.
    pub fn named_generators(&self) -> impl Iterator<Item = &str> {
        self.include
            .iter()
            .chain(self.exclude.iter())
            .map(|s| s.as_str())
            .chain(self.start_at.as_deref())
            .chain(self.stop_before.as_deref())
    }
}
