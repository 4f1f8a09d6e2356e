pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod rate_governor;
pub mod remote;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::Error;

/// Numeric identifier of a synchronized entity (rider, club, event).
pub type EntityId = i64;

/// Wall-clock milliseconds since the Unix epoch, for persisted and reported timestamps.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
