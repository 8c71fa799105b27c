//! The query compiler: selected expressions + predicates -> one SELECT.

mod compile;
mod expr;

pub use compile::{CompiledQuery, Query, IDENTITY_SUFFIX, KEY_SUFFIX};
pub use expr::{col, count, lit, max, sum, AggFunc, BinaryOp, Expr, UnaryOp};

use thiserror::Error;

use crate::algebra::AlgebraError;
use crate::model::ModelError;

/// Result type for query compilation.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors raised while compiling a query. All of these are compile-time
/// configuration errors, raised before any SQL runs.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Algebra(#[from] AlgebraError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// No basis was given and the selected attributes span more than one
    /// entity, so the query's cardinality cannot be inferred.
    #[error("ambiguous query basis; selected paths end at: {0:?}")]
    AmbiguousBasis(Vec<String>),

    /// The query references no entity at all.
    #[error("query has no basis and no attribute paths")]
    NoBasis,

    #[error("failed to hash query structure: {0}")]
    Hash(#[from] serde_json::Error),
}
