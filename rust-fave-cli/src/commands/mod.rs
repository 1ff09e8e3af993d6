//! Command implementations for the FaVe CLI

pub mod dump;
pub mod send;
