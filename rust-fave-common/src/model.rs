//! Device models and their structural diff.
//!
//! A [`DeviceModel`] describes one network node as rule tables, a port table
//! (port name to owning table, empty for external ports) and internal wiring
//! between ports. Subtracting two versions of the same node yields the
//! entries that have to be installed or removed on the verification engine.

use crate::error::Error;
use crate::mapping::FieldMapping;
use crate::rule::{Action, Rule, RuleField};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Sub;

/// Suffix of the internal port that receives packets from an external port.
pub const INGRESS_SUFFIX: &str = "_ingress";

/// Suffix of the internal port that emits packets to an external port.
pub const EGRESS_SUFFIX: &str = "_egress";

/// Kind of device a model describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Model,
    PacketFilter,
    SnapshotPacketFilter,
    Switch,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Model => "model",
            ModelType::PacketFilter => "packet_filter",
            ModelType::SnapshotPacketFilter => "snapshot_packet_filter",
            ModelType::Switch => "switch",
        }
    }

    pub fn from_tag(tag: &str) -> Option<ModelType> {
        match tag {
            "model" => Some(ModelType::Model),
            "packet_filter" => Some(ModelType::PacketFilter),
            "snapshot_packet_filter" => Some(ModelType::SnapshotPacketFilter),
            "switch" => Some(ModelType::Switch),
            _ => None,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule tables, ports and wiring of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceModel {
    pub node: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Rule>>,
    /// Port name to owning table name; an empty table marks an external port.
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    #[serde(default)]
    pub wiring: Vec<(String, String)>,
    #[serde(default)]
    pub mapping: FieldMapping,

    #[serde(skip)]
    pending_adds: BTreeMap<String, Vec<Rule>>,
    #[serde(skip)]
    pending_deletes: Vec<(String, u32)>,
}

impl PartialEq for DeviceModel {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
            && self.model_type == other.model_type
            && self.tables == other.tables
            && self.ports == other.ports
            && self.wiring == other.wiring
    }
}

impl DeviceModel {
    pub fn new(node: impl Into<String>, model_type: ModelType) -> Self {
        Self {
            node: node.into(),
            model_type,
            tables: BTreeMap::new(),
            ports: BTreeMap::new(),
            wiring: Vec::new(),
            mapping: FieldMapping::new(),
            pending_adds: BTreeMap::new(),
            pending_deletes: Vec::new(),
        }
    }

    /* ------------------------------------------------------------ *
     * Pending edits
     * ------------------------------------------------------------ */

    /// Queue rules for insertion into the tables named by their `tid`.
    pub fn add_rules(&mut self, rules: impl IntoIterator<Item = Rule>) {
        for rule in rules {
            self.pending_adds.entry(rule.tid.clone()).or_default().push(rule);
        }
    }

    /// Queue removal of rule `index` from `table`.
    pub fn remove_rule(&mut self, table: impl Into<String>, index: u32) {
        self.pending_deletes.push((table.into(), index));
    }

    /// Drop all queued edits.
    pub fn reset(&mut self) {
        self.pending_adds.clear();
        self.pending_deletes.clear();
    }

    pub fn pending_adds(&self) -> &BTreeMap<String, Vec<Rule>> {
        &self.pending_adds
    }

    pub fn pending_deletes(&self) -> &[(String, u32)] {
        &self.pending_deletes
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_adds.is_empty() || !self.pending_deletes.is_empty()
    }

    /// Apply queued deletions, then queued additions, then reset.
    ///
    /// An added rule replaces any rule with the same index in its table.
    /// Tables named by added rules are created when missing.
    pub fn apply_pending(&mut self) {
        for (table, index) in std::mem::take(&mut self.pending_deletes) {
            if let Some(rules) = self.tables.get_mut(&table) {
                rules.retain(|r| r.idx != index);
            }
        }
        for (table, rules) in std::mem::take(&mut self.pending_adds) {
            let existing = self.tables.entry(table).or_default();
            for rule in rules {
                match existing.iter_mut().find(|r| r.idx == rule.idx) {
                    Some(slot) => *slot = rule,
                    None => existing.push(rule),
                }
            }
        }
        self.reset();
    }

    /* ------------------------------------------------------------ *
     * Lookups
     * ------------------------------------------------------------ */

    /// Lexicographic rank of `table` among this model's tables.
    pub fn table_index(&self, table: &str) -> Result<usize> {
        self.tables
            .keys()
            .position(|t| t == table)
            .ok_or_else(|| Error::UnknownReference(format!("table {} of {}", table, self.node)))
    }

    /// Lexicographic rank of `port` among this model's ports.
    pub fn port_index(&self, port: &str) -> Result<usize> {
        self.ports
            .keys()
            .position(|p| p == port)
            .ok_or_else(|| Error::UnknownReference(format!("port {} of {}", port, self.node)))
    }

    pub fn is_external_port(&self, port: &str) -> bool {
        self.ports.get(port).map_or(false, |t| t.is_empty())
    }

    /// Ports bound to `table`, in name order.
    pub fn table_ports<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.ports
            .iter()
            .filter(move |(_, t)| t.as_str() == table)
            .map(|(p, _)| p.as_str())
    }

    /// Internal port that receives traffic arriving on `port`.
    pub fn ingress_port(&self, port: &str) -> String {
        self.boundary_port(port, INGRESS_SUFFIX)
    }

    /// Internal port that emits traffic leaving through `port`.
    pub fn egress_port(&self, port: &str) -> String {
        self.boundary_port(port, EGRESS_SUFFIX)
    }

    fn boundary_port(&self, port: &str, suffix: &str) -> String {
        let internal = format!("{}{}", port, suffix);
        if self.is_external_port(port) && self.ports.contains_key(&internal) {
            internal
        } else {
            port.to_string()
        }
    }

    /// Table that stands for the whole node in probe paths.
    pub fn primary_table(&self) -> Option<&str> {
        let post_routing = format!("{}.post_routing", self.node);
        let single = format!("{}.1", self.node);
        [post_routing, single]
            .iter()
            .find_map(|t| self.tables.get_key_value(t.as_str()).map(|(k, _)| k.as_str()))
            .or_else(|| self.tables.keys().next().map(String::as_str))
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> + '_ {
        self.tables.values().flatten()
    }

    pub fn rule_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Whether the model holds no tables, ports or wiring.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.ports.is_empty() && self.wiring.is_empty()
    }

    /* ------------------------------------------------------------ *
     * Diff
     * ------------------------------------------------------------ */

    /// Entries of `self` that are not present verbatim in `other`.
    ///
    /// Tables of `self` missing from `other` are kept whole, even when they
    /// hold no rules. Tables present in both only keep the rules `other`
    /// lacks and are dropped when nothing changed.
    pub fn diff(&self, other: &DeviceModel) -> Result<DeviceModel> {
        if self.node != other.node || self.model_type != other.model_type {
            return Err(Error::IncompatibleModels(format!(
                "{} ({}) and {} ({})",
                self.node, self.model_type, other.node, other.model_type
            )));
        }

        let mut delta = DeviceModel::new(self.node.clone(), self.model_type);
        delta.mapping = self.mapping.clone();

        for (table, rules) in &self.tables {
            match other.tables.get(table) {
                Some(theirs) => {
                    let changed: Vec<Rule> = rules
                        .iter()
                        .filter(|r| !theirs.contains(r))
                        .cloned()
                        .collect();
                    if !changed.is_empty() {
                        delta.tables.insert(table.clone(), changed);
                    }
                }
                None => {
                    delta.tables.insert(table.clone(), rules.clone());
                }
            }
        }

        delta.ports = self
            .ports
            .iter()
            .filter(|(port, table)| other.ports.get(*port) != Some(*table))
            .map(|(p, t)| (p.clone(), t.clone()))
            .collect();

        delta.wiring = self
            .wiring
            .iter()
            .filter(|link| !other.wiring.contains(link))
            .cloned()
            .collect();

        Ok(delta)
    }

    /* ------------------------------------------------------------ *
     * Builders
     * ------------------------------------------------------------ */

    /// A single-table switch: table `<node>.1`, ports `<node>.<p>`.
    pub fn switch<P: fmt::Display>(
        node: &str,
        ports: impl IntoIterator<Item = P>,
        rules: impl IntoIterator<Item = Rule>,
    ) -> Self {
        let table = format!("{}.1", node);
        let mut model = DeviceModel::new(node, ModelType::Switch);

        model.ports = ports
            .into_iter()
            .map(|p| (format!("{}.{}", node, p), table.clone()))
            .collect();
        model.tables.insert(
            table.clone(),
            rules
                .into_iter()
                .map(|mut r| {
                    r.node = node.to_string();
                    r.tid = table.clone();
                    r
                })
                .collect(),
        );
        model
    }

    /// The fixed pipeline of a packet filter with the given external ports.
    ///
    /// Filtering rules are left empty; `post_routing` forwards by the
    /// `out_port` set during routing and drops hairpin traffic.
    pub fn packet_filter<P: fmt::Display>(node: &str, ports: impl IntoIterator<Item = P>) -> Self {
        let mut model = DeviceModel::new(node, ModelType::PacketFilter);
        let name = |suffix: &str| format!("{}.{}", node, suffix);

        for table in [
            "pre_routing",
            "input_filter",
            "output_filter",
            "forward_filter",
            "routing",
            "post_routing",
            "internals",
        ] {
            model.tables.insert(name(table), Vec::new());
        }

        for (port, table) in [
            ("pre_routing_input", "pre_routing"),
            ("pre_routing_forward", "pre_routing"),
            ("input_filter_in", "input_filter"),
            ("input_filter_accept", "input_filter"),
            ("forward_filter_in", "forward_filter"),
            ("forward_filter_accept", "forward_filter"),
            ("output_filter_in", "output_filter"),
            ("output_filter_accept", "output_filter"),
            ("internals_in", "internals"),
            ("internals_out", "internals"),
            ("post_routing_in", "post_routing"),
            ("routing_in", "routing"),
            ("routing_out", "routing"),
        ] {
            model.ports.insert(name(port), name(table));
        }

        let ports: Vec<String> = ports.into_iter().map(|p| p.to_string()).collect();
        for port in &ports {
            let external = name(port.as_str());
            model
                .ports
                .insert(format!("{}{}", external, INGRESS_SUFFIX), name("pre_routing"));
            model
                .ports
                .insert(format!("{}{}", external, EGRESS_SUFFIX), name("post_routing"));
            model.ports.insert(external, String::new());
        }

        model.wiring = [
            ("pre_routing_input", "input_filter_in"),
            ("input_filter_accept", "internals_in"),
            ("pre_routing_forward", "forward_filter_in"),
            ("forward_filter_accept", "routing_in"),
            ("internals_out", "output_filter_in"),
            ("output_filter_accept", "routing_in"),
            ("routing_out", "post_routing_in"),
        ]
        .into_iter()
        .map(|(from, to)| (name(from), name(to)))
        .collect();

        let post_routing = name("post_routing");
        let count = ports.len() as u32;
        let mut rules = Vec::with_capacity(ports.len() * 2);

        // Hairpin traffic is dropped first.
        for (i, port) in ports.iter().enumerate() {
            let ingress = format!("{}{}", name(port.as_str()), INGRESS_SUFFIX);
            let egress = format!("{}{}", name(port.as_str()), EGRESS_SUFFIX);
            rules.push(
                Rule::new(node, post_routing.clone(), i as u32)
                    .with_in_ports(vec![name("post_routing_in")])
                    .with_match(vec![
                        RuleField::new("in_port", ingress),
                        RuleField::new("out_port", egress),
                    ]),
            );
        }
        for (i, port) in ports.iter().enumerate() {
            let egress = format!("{}{}", name(port.as_str()), EGRESS_SUFFIX);
            rules.push(
                Rule::new(node, post_routing.clone(), count + i as u32)
                    .with_in_ports(vec![name("post_routing_in")])
                    .with_match(vec![RuleField::new("out_port", egress.clone())])
                    .with_action(Action::Rewrite {
                        rw: vec![
                            RuleField::new("in_port", "x".repeat(32)),
                            RuleField::new("out_port", "x".repeat(32)),
                        ],
                    })
                    .with_action(Action::Forward { ports: vec![egress] }),
            );
        }
        model.tables.insert(post_routing, rules);
        model
    }
}

impl Sub for &DeviceModel {
    type Output = Result<DeviceModel>;

    fn sub(self, other: &DeviceModel) -> Self::Output {
        self.diff(other)
    }
}
