//! FDS Placement - cluster maps and local token placement
//!
//! The OM computes the DLT (SM token -> node group) and DMT (volume ->
//! DM group); this crate only consumes them. Each new version replaces the
//! previous snapshot wholesale and diffs between versions drive migration.
//!
//! Locally, `SmTokenPlacement` spreads SM tokens over the disks of each
//! tier and records the result in the `ObjectLocationTable`.

pub mod dlt;
pub mod dmt;
pub mod olt;
pub mod table;

pub use dlt::{Dlt, DltManager};
pub use dmt::{Dmt, DmtManager};
pub use olt::{ObjectLocationTable, SmTokenPlacement};
pub use table::{TableHolder, Versioned};
