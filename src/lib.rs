//! # Weir
//!
//! A declarative pipeline for populating a relational warehouse.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           Model (entities, attrs, relations)             │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [algebra + query compiler]
//! ┌─────────────────────────────────────────────────────────┐
//! │        Compiled SELECT per generator (one query)         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [scheduler - footprint overlap]
//! ┌─────────────────────────────────────────────────────────┐
//! │              Deterministic generator order               │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [engine - batch, dedup, transform]
//! ┌─────────────────────────────────────────────────────────┐
//! │        Loader (staged batches, idempotent merges)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Generators declare what they read (a query over the model) and what
//! they write (loads); the scheduler orders them by footprint overlap,
//! and the engine executes each one in batches with row-level dedup
//! against a persistent ledger.

pub mod algebra;
pub mod config;
pub mod db;
pub mod dep;
pub mod engine;
pub mod generator;
pub mod hash;
pub mod load;
pub mod loader;
pub mod model;
pub mod query;
pub mod schedule;
pub mod value;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::{EmptyGeneratorPolicy, RunOptions};
    pub use crate::db::{Database, MetaStore, SqliteDb};
    pub use crate::engine::{Engine, GeneratorStatus, RunReport};
    pub use crate::generator::{Generator, Transform, TransformOutcome};
    pub use crate::load::{Load, RelSource, ValueSource};
    pub use crate::model::{Attr, AttrType, Entity, OnDelete, Rel, Schema};
    pub use crate::query::{col, count, lit, max, sum, Expr, Query};
    pub use crate::value::Value;
}
