/// Dual-panel VPN usage bot
///
/// Aggregates Hiddify and Marzban accounts into one view, records hourly
/// usage snapshots and drives scheduled warnings and nightly reports.

pub mod account;
pub mod api;
pub mod backup;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod panel;
pub mod report;
pub mod resolver;
pub mod server;
pub mod usage;

#[cfg(test)]
pub(crate) mod testing;

pub use context::AppContext;
pub use error::{BotError, BotResult};
