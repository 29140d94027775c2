/// Usage history: hourly snapshots and warning dedup state

pub mod snapshots;
pub mod warnings;

pub use snapshots::{PanelUsage, SnapshotStore};
pub use warnings::{WarningKind, WarningLog};
