//! File-backed catalog and pointer state for Switchyard
//!
//! - [`FileCatalog`]: channels, endpoints, credentials and channel groups
//!   loaded from one YAML or TOML document
//! - [`JsonPointerStore`]: scheduler and group pointers kept in a JSON state
//!   file across restarts

pub mod catalog;
pub mod pointer_file;

pub use catalog::{CatalogDocument, CatalogSummary, FileCatalog};
pub use pointer_file::JsonPointerStore;
