//! I/O boundaries for the gatekeeper: config, processes, oracle, persistence.

pub mod audit;
pub mod config;
pub mod dry_run;
pub mod environment;
pub mod executor;
pub mod memory;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod reply;
pub mod store;
