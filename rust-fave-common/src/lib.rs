//! Common types and utilities for FaVe model synchronization.
//!
//! This crate provides the packet-header algebra (field mapping, ternary
//! vectors, header spaces), the device model with its structural diff, and
//! the message registry shared by the aggregator, the engine client and the
//! producer tools.

pub mod error;
pub mod field;
pub mod frame;
pub mod mapping;
pub mod message;
pub mod metrics;
pub mod model;
pub mod rule;
pub mod types;
pub mod vector;

/// Reexport of common types
pub use error::Error;
pub use mapping::FieldMapping;
pub use message::{Message, ModelRegistry};
pub use model::DeviceModel;
pub use rule::{Action, Match, Rule, RuleField};
pub use vector::{HeaderSpace, Vector};

pub type Result<T> = std::result::Result<T, Error>;
