//! Test support for pipelines built on this crate.
//!
//! - **Fixtures**: [`ShapefileWriter`] writes real `.shp`/`.dbf` pairs and
//!   [`TestWorkspace`] lays out input, output and container paths in a
//!   temporary directory
//! - **Fault injection**: [`FaultyStore`] wraps any [`FeatureStore`] and fails
//!   chosen operations; [`StubbornRemover`] refuses to delete chosen files for
//!   a number of attempts
//!
//! ```
//! use geomerge::store::{GeometryKind, Value};
//! use geomerge::testing::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let ws = TestWorkspace::new()?;
//! let shp = ws.rustico_dir().join("35001").join("35001_PARCELA.shp");
//! ShapefileWriter::new(GeometryKind::Point)
//!     .long_field("ID")
//!     .point(1.0, 2.0, vec![Value::Int(1)])
//!     .write(&shp)?;
//! assert!(shp.with_extension("dbf").is_file());
//! # Ok(())
//! # }
//! ```
//!
//! [`FeatureStore`]: crate::store::FeatureStore

pub mod faults;
pub mod fixtures;

pub use faults::*;
pub use fixtures::*;
