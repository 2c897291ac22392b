//! Convert multi-regional input-output worksheet dumps into sparse LCA
//! coefficient matrices, published as versioned calculation packages.
//!
//! The pipeline streams the (mostly zero) cell data table by table: offsets
//! are detected or configured per worksheet ([`layout`]), non-zero triples
//! are extracted lazily ([`grid`]), row/column labels become entities with
//! stable ids ([`entities`]), and the assembler ([`assemble`]) merges
//! triples, ids and the disaggregation rules ([`migrate`]) into two record
//! streams consumed by the package writer ([`package`]). [`importer`] wires
//! it all together behind the three external boundaries.

pub mod assemble;
pub mod entities;
pub mod error;
pub mod grid;
pub mod importer;
pub mod layout;
pub mod migrate;
pub mod package;
pub mod schema;
pub mod store;

pub use assemble::{CoefficientRecord, DisaggregationStats};
pub use error::{ImportError, Result};
pub use importer::{ImportConfig, ImportOutcome, Importer};
pub use layout::{LayoutRegistry, SemanticRole, TableLayout};
pub use migrate::{Disaggregation, FlowSplit, RuleSet, SourceFlow};
pub use package::{FsPackageWriter, PackageWriter};
pub use store::{EntityStore, MemoryStore};
