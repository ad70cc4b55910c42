//! Ingest stage: turns downloaded archives into per-category input directories.
//!
//! - [`extract::ArchiveExtractor`] unpacks the downloaded (nested) archives
//!   into `output/` (requires the `zip-extract` feature)
//! - [`organize::FileOrganizer`] classifies the unpacked folders into
//!   `output/Rústico` and `output/Urbano` and prefixes their files with the
//!   municipality code

#[cfg(feature = "zip-extract")]
pub mod extract;
pub mod organize;

#[cfg(feature = "zip-extract")]
pub use extract::{ArchiveExtractor, ExtractReport};
pub use organize::{FileOrganizer, OrganizeReport};
