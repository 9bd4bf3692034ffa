//! # pg-subset-dump
//!
//! Extracts a consistent, referentially-closed subset of a PostgreSQL
//! database starting from one or more seed records, and emits a replayable
//! stream of insert statements that loads into a target database without
//! violating foreign-key constraints.
//!
//! The pipeline: seeds feed the [`graph::Traverser`], which walks outgoing
//! and incoming foreign-key edges breadth-first with batched fetches and
//! identifier-level deduplication; the collected records are ordered by
//! [`dump::topo_sort`], optionally remap-planned, and rendered by
//! [`dump::SqlGenerator`] (with an optional [`dump::DdlGenerator`] prelude)
//! into a single transactional script.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_subset_dump::{
//!     CacheConfig, ConnectionConfig, DumpService, OutputTarget, ReadOnlyPosture, RunConfig,
//!     SeedSpec, TraversalMode,
//! };
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pg_subset_dump::DumpError> {
//!     let config = RunConfig {
//!         connection: ConnectionConfig::from_env(),
//!         seed: SeedSpec::Pks {
//!             table: "users".to_string(),
//!             pks: vec!["3".to_string()],
//!         },
//!         mode: TraversalMode::Strict,
//!         filters: vec![],
//!         keep_pks: false,
//!         create_schema: false,
//!         max_depth: None,
//!         strict_references: false,
//!         read_only: ReadOnlyPosture::Advisory,
//!         cache: CacheConfig::default(),
//!         output: OutputTarget::Stdout,
//!     };
//!     let (_cancel_tx, cancel_rx) = watch::channel(false);
//!     let mut service = DumpService::connect(config).await?;
//!     let result = service.run(cancel_rx).await?;
//!     eprintln!("{} records dumped", result.record_count);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dump;
pub mod error;
pub mod graph;
pub mod ident;
pub mod orchestrator;
pub mod schema;
pub mod source;

// Re-exports for convenient access
pub use config::{
    parse_pk_list, parse_timeframe, CacheConfig, ConnectionConfig, OutputTarget, ReadOnlyPosture,
    RunConfig, SeedSpec, TimeframeFilter, TraversalMode,
};
pub use error::{DumpError, Result};
pub use orchestrator::{clear_schema_cache, DumpResult, DumpService};
