//! Identifier types allocated by the aggregator.
//!
//! Table, port and rule identifiers are global to one aggregator instance and
//! are distinct from the lexicographic indices a model assigns to its own
//! names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of low bits of a port ID that hold the table-local port index.
pub const PORT_INDEX_BITS: u32 = 16;

/// Number of low bits of an engine rule index that number the vectors of an
/// expanded negated match.
pub const NEGATION_INDEX_BITS: u32 = 12;

/// First table ID handed out by a fresh aggregator.
pub const FIRST_TABLE_ID: u32 = 1;

/// Local port index used by generators and probes for their single port.
pub const SOURCE_PORT_INDEX: u16 = 1;

/// Maximum size of a single producer frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Globally unique identifier for a rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

/// Globally unique identifier for a port: `(table_id << 16) | local_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u64);

impl PortId {
    pub fn new(table: TableId, index: u16) -> Self {
        PortId(((table.0 as u64) << PORT_INDEX_BITS) | index as u64)
    }

    /// The table this port was allocated for.
    pub fn table(&self) -> TableId {
        TableId((self.0 >> PORT_INDEX_BITS) as u32)
    }

    pub fn index(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortId({:#x})", self.0)
    }
}

/// Handle returned by the verification engine for an installed rule,
/// source or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleHandle(pub u64);

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleHandle({})", self.0)
    }
}

/// Engine-side index for the `n`-th vector of rule `index`.
pub fn engine_rule_index(index: u32, n: u32) -> u64 {
    ((index as u64) << NEGATION_INDEX_BITS) | n as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_id_layout() {
        let port = PortId::new(TableId(3), 7);
        assert_eq!(port.0, 0x30007);
        assert_eq!(port.table(), TableId(3));
        assert_eq!(port.index(), 7);
        assert_eq!(port.to_string(), "PortId(0x30007)");
    }

    #[test]
    fn test_engine_rule_index() {
        assert_eq!(engine_rule_index(0, 0), 0);
        assert_eq!(engine_rule_index(2, 5), (2 << 12) | 5);
    }
}
