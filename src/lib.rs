//! Ingests ICO and token contract events from a live chain endpoint into a
//! document store, one record per log, deduplicated by natural key.

pub mod config;
pub mod db;
pub mod indexer;
pub mod models;
pub mod normalizer;
pub mod parser;
pub mod rpc;
pub mod sink;
pub mod stats;

pub use indexer::{Coordinator, CoordinatorSettings, CoordinatorState, RunSummary, StartupError};
pub use models::{CanonicalRecord, ChainEvent, EventKind, RawLog};
pub use sink::{PersistResult, PersistenceSink, SinkSettings};
