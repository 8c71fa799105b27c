//! The path/join algebra: Path -> Join -> From.
//!
//! A [`Path`] describes a traversal over the schema relation graph. It
//! compiles into [`Join`] nodes held in an arena keyed by structural hash,
//! so that two structurally identical joins collapse to one aliased FROM
//! entry, and into a [`FromClause`] that renders deterministic SQL.

mod from;
mod join;
mod path;
mod search;

pub use from::FromClause;
pub use join::{Condition, Join, JoinKey};
pub use path::Path;
pub use search::{cartesian_product, find_branched, find_paths, BranchSpec};

use thiserror::Error;

use crate::model::ModelError;

/// Result type for algebra operations.
pub type AlgebraResult<T> = Result<T, AlgebraError>;

/// Errors raised while building paths or compiling joins.
#[derive(Debug, Error)]
pub enum AlgebraError {
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Concatenation/difference/branch attachment with misaligned endpoints.
    #[error("path endpoints do not align: expected '{expected}', found '{found}'")]
    EndpointMismatch { expected: String, found: String },

    /// Difference where the subtrahend is not a terminal-side segment.
    #[error("path difference: '{0}' is not a trailing segment")]
    NotASuffix(String),

    /// Linear operation applied to a branching path.
    #[error("operation requires a linear path")]
    NotLinear,

    /// Path used as a column reference without a terminating attribute.
    #[error("path into '{0}' has no terminating attribute")]
    MissingAttr(String),

    /// Two joins reference each other; a programming error in path
    /// construction.
    #[error("cycle in join graph involving aliases: {0:?}")]
    JoinCycle(Vec<String>),

    /// Path search exhausted the graph without satisfying its constraints.
    #[error("no path from '{from}' to '{to}' satisfying constraints")]
    NoPath { from: String, to: String },

    /// Structural hashing failed (non-serializable path content).
    #[error("failed to hash join structure: {0}")]
    Hash(#[from] serde_json::Error),
}
