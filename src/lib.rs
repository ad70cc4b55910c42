//! # geomerge
//!
//! A **balanced parallel chunk-merge pipeline** for cadastral survey data.
//! Tens of thousands of shapefiles, split into two territorial categories
//! (Rústico and Urbano), are consolidated into one container holding a record
//! set per `{category}_{recordType}` pair, stamped with the municipal code of
//! the file they came from and enriched with reference metadata.
//!
//! ## Stages
//!
//! 1. **Ingest** ([`ingest`]): unpack nested download archives and sort the
//!    folders into category directories
//! 2. **Plan** ([`planner`]): discover source files and bin-pack them by size
//!    into a fixed number of work units per category
//! 3. **Process** ([`worker`], [`pool`]): build one isolated intermediate
//!    container per unit, in parallel
//! 4. **Reduce** ([`merge`]): copy or union-merge each target record set from
//!    every successful intermediate container into the final one, then compact
//! 5. **Tables** ([`tables`], optional): import the standalone `.dbf`
//!    attribute tables and union them per table type
//! 6. **Clean up** ([`janitor`]): remove the working area, retrying around
//!    files still held by the store
//!
//! All store access goes through the [`FeatureStore`](store::FeatureStore)
//! trait; [`LocalStore`](store::local::LocalStore) is the filesystem-backed
//! implementation shipped with the crate.
//!
//! ## Quick Start
//!
//! ```no_run
//! use geomerge::config::PipelineConfig;
//! use geomerge::pipeline::Pipeline;
//! use geomerge::store::local::LocalStore;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = PipelineConfig::from_file("config.json")?;
//! let summary = Pipeline::new(config, Arc::new(LocalStore::new())).run()?;
//! println!(
//!     "{} record sets written from {} files",
//!     summary.merge.written(),
//!     summary.files
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `zip-extract` (default): archive extraction in the ingest stage

pub mod catalog;
pub mod config;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod janitor;
pub mod merge;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod store;
pub mod tables;
pub mod testing;
pub mod worker;
pub mod workspace;

pub use catalog::{Category, RecordType};
pub use config::{ParallelismPolicy, PipelineConfig};
pub use error::PipelineError;
pub use pipeline::{Pipeline, RunSummary};
pub use store::FeatureStore;
pub use store::local::LocalStore;
pub use workspace::{WorkspaceHandle, WorkspaceScope};
