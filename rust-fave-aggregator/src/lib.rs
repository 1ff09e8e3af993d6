//! Aggregator for FaVe (Fast Verification) model synchronization
//!
//! Producers send device models and incremental commands over a Unix or TCP
//! socket. The aggregator queues them, translates every message into the
//! minimal set of edits on a NetPlumber instance and keeps the global table,
//! port and rule IDs it handed out.

pub mod config;
pub mod engine;
pub mod service;
pub mod state;
pub mod sync;
mod topology;
pub mod translate;

pub use config::AggregatorConfig;
pub use engine::MeteredEngine;
pub use service::AggregatorService;
pub use state::{AggregatorState, SourceEntry};
pub use sync::{Aggregator, Outcome};

/// Name of the state file written by a `dump` message
pub const DUMP_FILE_NAME: &str = "fave.json";
