//! Bookkeeping owned by the aggregator worker.
//!
//! Tracks the global mapping, the table, port and rule IDs handed out so far,
//! installed links, sources, probes and slices, and the last model seen per
//! node. Nothing here talks to the engine.

use rust_fave_common::{
    types::{PortId, RuleHandle, TableId, FIRST_TABLE_ID},
    DeviceModel, Error, FieldMapping, HeaderSpace, Result,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A generator or probe installed on the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    pub table: TableId,
    pub port: PortId,
    pub handle: RuleHandle,
    /// Header space emitted (generators) or filtered on (probes).
    pub space: HeaderSpace,
}

#[derive(Debug)]
pub struct AggregatorState {
    mapping: FieldMapping,
    tables: BTreeMap<String, TableId>,
    fresh_table_id: u32,
    ports: BTreeMap<String, PortId>,
    port_owners: HashMap<String, String>,
    rules: HashMap<(TableId, u32), Vec<RuleHandle>>,
    links: BTreeMap<PortId, BTreeSet<PortId>>,
    models: HashMap<String, DeviceModel>,
    generators: BTreeMap<String, SourceEntry>,
    probes: BTreeMap<String, SourceEntry>,
    slices: BTreeSet<u64>,
}

impl Default for AggregatorState {
    fn default() -> Self {
        Self::new(FieldMapping::new())
    }
}

impl AggregatorState {
    pub fn new(mapping: FieldMapping) -> Self {
        Self {
            mapping,
            tables: BTreeMap::new(),
            fresh_table_id: FIRST_TABLE_ID,
            ports: BTreeMap::new(),
            port_owners: HashMap::new(),
            rules: HashMap::new(),
            links: BTreeMap::new(),
            models: HashMap::new(),
            generators: BTreeMap::new(),
            probes: BTreeMap::new(),
            slices: BTreeSet::new(),
        }
    }

    /* ------------------------------------------------------------ *
     * Mapping
     * ------------------------------------------------------------ */

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Append the fields of `other` missing from the global mapping.
    /// Returns the number of bits added.
    pub fn absorb_mapping(&mut self, other: &FieldMapping) -> Result<usize> {
        let before = self.mapping.length();
        self.mapping.merge(other)?;
        Ok(self.mapping.length() - before)
    }

    /// Append `fields` missing from the global mapping.
    /// Returns the number of bits added.
    pub fn absorb_fields<'a>(&mut self, fields: impl IntoIterator<Item = &'a str>) -> Result<usize> {
        let before = self.mapping.length();
        for field in fields {
            self.mapping.ensure(field)?;
        }
        Ok(self.mapping.length() - before)
    }

    /// Grow every live header space by `n` don't-care bits.
    pub fn enlarge_spaces(&mut self, n: usize) {
        for entry in self.generators.values_mut().chain(self.probes.values_mut()) {
            entry.space.enlarge(n);
        }
    }

    /* ------------------------------------------------------------ *
     * Tables and ports
     * ------------------------------------------------------------ */

    pub fn table_id(&self, table: &str) -> Option<TableId> {
        self.tables.get(table).copied()
    }

    pub fn require_table(&self, table: &str) -> Result<TableId> {
        self.table_id(table)
            .ok_or_else(|| Error::UnknownReference(format!("table {}", table)))
    }

    /// Hand out the next table ID for `table`. IDs are never reused.
    pub fn allocate_table(&mut self, table: &str) -> TableId {
        let id = TableId(self.fresh_table_id);
        self.fresh_table_id += 1;
        self.tables.insert(table.to_string(), id);
        id
    }

    pub fn forget_table(&mut self, table: &str) -> Option<TableId> {
        self.tables.remove(table)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn port_id(&self, port: &str) -> Option<PortId> {
        self.ports.get(port).copied()
    }

    /// Name registered for `id`.
    pub fn port_name(&self, id: PortId) -> Option<&str> {
        self.ports
            .iter()
            .find(|(_, p)| **p == id)
            .map(|(name, _)| name.as_str())
    }

    pub fn require_port(&self, port: &str) -> Result<PortId> {
        self.port_id(port)
            .ok_or_else(|| Error::UnknownReference(format!("port {}", port)))
    }

    /// Give every port in `ports` an ID within `table`.
    ///
    /// Known ports keep their ID. A new port takes its rank in `ports` plus
    /// one as local index unless that index is already used in the table,
    /// in which case it gets the next free one.
    pub fn assign_ports<'a>(
        &mut self,
        table: TableId,
        ports: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<PortId>> {
        let mut used: BTreeSet<u16> = self
            .ports
            .values()
            .filter(|p| p.table() == table)
            .map(PortId::index)
            .collect();

        let mut assigned = Vec::new();
        for (rank, port) in ports.into_iter().enumerate() {
            if let Some(id) = self.port_id(port) {
                assigned.push(id);
                continue;
            }
            let preferred = u16::try_from(rank + 1)
                .map_err(|_| Error::invalid_value("port", format!("{} exceeds the table's port space", port)))?;
            let index = if used.contains(&preferred) {
                let next = used.iter().next_back().copied().unwrap_or(0);
                next.checked_add(1)
                    .ok_or_else(|| Error::invalid_value("port", port.to_string()))?
            } else {
                preferred
            };
            used.insert(index);

            let id = PortId::new(table, index);
            self.ports.insert(port.to_string(), id);
            assigned.push(id);
        }
        Ok(assigned)
    }

    pub fn insert_port(&mut self, port: &str, id: PortId) {
        self.ports.insert(port.to_string(), id);
    }

    pub fn forget_port(&mut self, port: &str) -> Option<PortId> {
        self.port_owners.remove(port);
        self.ports.remove(port)
    }

    pub fn set_owner(&mut self, port: &str, node: &str) {
        self.port_owners.insert(port.to_string(), node.to_string());
    }

    /// Node whose model declares `port`.
    pub fn owner(&self, port: &str) -> Option<&str> {
        self.port_owners.get(port).map(String::as_str)
    }

    /// Global ID of `port`, mapping external ports to the internal port
    /// facing the given direction.
    ///
    /// `hint` is consulted before the stored models so ports of a model that
    /// is being installed resolve as well.
    pub fn resolve_port(&self, port: &str, egress: bool, hint: Option<&DeviceModel>) -> Result<PortId> {
        if let Some(id) = self.port_id(port) {
            return Ok(id);
        }
        let model = hint
            .filter(|m| m.ports.contains_key(port))
            .or_else(|| self.owner(port).and_then(|node| self.model(node)));
        match model {
            Some(model) if model.is_external_port(port) => {
                let internal = if egress {
                    model.egress_port(port)
                } else {
                    model.ingress_port(port)
                };
                self.require_port(&internal)
            }
            _ => self.require_port(port),
        }
    }

    /// Table standing for `node` in probe paths.
    pub fn node_table(&self, node: &str) -> Result<TableId> {
        if let Some(table) = self.model(node).and_then(DeviceModel::primary_table) {
            return self.require_table(table);
        }
        self.generator(node)
            .or_else(|| self.probe(node))
            .map(|entry| entry.table)
            .ok_or_else(|| Error::UnknownReference(format!("node {}", node)))
    }

    /* ------------------------------------------------------------ *
     * Rules
     * ------------------------------------------------------------ */

    pub fn record_rule(&mut self, table: TableId, index: u32, handle: RuleHandle) {
        self.rules.entry((table, index)).or_default().push(handle);
    }

    /// Remove and return the handles installed for rule `index` of `table`.
    pub fn take_rule(&mut self, table: TableId, index: u32) -> Vec<RuleHandle> {
        self.rules.remove(&(table, index)).unwrap_or_default()
    }

    pub fn rule_handles(&self, table: TableId, index: u32) -> &[RuleHandle] {
        self.rules.get(&(table, index)).map_or(&[], Vec::as_slice)
    }

    /* ------------------------------------------------------------ *
     * Links
     * ------------------------------------------------------------ */

    pub fn has_link(&self, from: PortId, to: PortId) -> bool {
        self.links.get(&from).map_or(false, |t| t.contains(&to))
    }

    /// Returns `false` if the link was already installed.
    pub fn insert_link(&mut self, from: PortId, to: PortId) -> bool {
        self.links.entry(from).or_default().insert(to)
    }

    /// Returns `false` if the link was not installed.
    pub fn remove_link(&mut self, from: PortId, to: PortId) -> bool {
        let removed = self.links.get_mut(&from).map_or(false, |t| t.remove(&to));
        if self.links.get(&from).map_or(false, BTreeSet::is_empty) {
            self.links.remove(&from);
        }
        removed
    }

    /// Installed links starting or ending at `port`.
    pub fn links_touching(&self, port: PortId) -> Vec<(PortId, PortId)> {
        self.links
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| *from == port || *to == port)
            .collect()
    }

    pub fn link_count(&self) -> usize {
        self.links.values().map(BTreeSet::len).sum()
    }

    /* ------------------------------------------------------------ *
     * Models, sources, probes, slices
     * ------------------------------------------------------------ */

    pub fn model(&self, node: &str) -> Option<&DeviceModel> {
        self.models.get(node)
    }

    pub fn store_model(&mut self, model: DeviceModel) {
        self.models.insert(model.node.clone(), model);
    }

    pub fn remove_model(&mut self, node: &str) -> Option<DeviceModel> {
        self.models.remove(node)
    }

    pub fn generator(&self, node: &str) -> Option<&SourceEntry> {
        self.generators.get(node)
    }

    pub fn insert_generator(&mut self, node: &str, entry: SourceEntry) {
        self.generators.insert(node.to_string(), entry);
    }

    pub fn remove_generator(&mut self, node: &str) -> Option<SourceEntry> {
        self.generators.remove(node)
    }

    pub fn probe(&self, node: &str) -> Option<&SourceEntry> {
        self.probes.get(node)
    }

    pub fn insert_probe(&mut self, node: &str, entry: SourceEntry) {
        self.probes.insert(node.to_string(), entry);
    }

    pub fn remove_probe(&mut self, node: &str) -> Option<SourceEntry> {
        self.probes.remove(node)
    }

    pub fn has_slice(&self, id: u64) -> bool {
        self.slices.contains(&id)
    }

    pub fn insert_slice(&mut self, id: u64) {
        self.slices.insert(id);
    }

    pub fn remove_slice(&mut self, id: u64) -> bool {
        self.slices.remove(&id)
    }

    /* ------------------------------------------------------------ *
     * Dump
     * ------------------------------------------------------------ */

    /// Contents of `fave.json`: the mapping and every ID handed out.
    pub fn dump(&self) -> Value {
        let id_to_table: BTreeMap<u32, &str> =
            self.tables.iter().map(|(name, id)| (id.0, name.as_str())).collect();
        let id_to_port: BTreeMap<u64, &str> =
            self.ports.iter().map(|(name, id)| (id.0, name.as_str())).collect();
        let id_to_rule: BTreeMap<u64, u32> = self
            .rules
            .iter()
            .flat_map(|((table, _), handles)| handles.iter().map(move |h| (h.0, table.0)))
            .collect();
        let id_to_generator: BTreeMap<u32, &str> = self
            .generators
            .iter()
            .map(|(node, entry)| (entry.table.0, node.as_str()))
            .collect();
        let id_to_probe: BTreeMap<u32, &str> = self
            .probes
            .iter()
            .map(|(node, entry)| (entry.table.0, node.as_str()))
            .collect();
        let links: Vec<(u64, u64)> = self
            .links
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from.0, to.0)))
            .collect();

        json!({
            "mapping": self.mapping,
            "id_to_table": id_to_table,
            "id_to_port": id_to_port,
            "id_to_rule": id_to_rule,
            "id_to_generator": id_to_generator,
            "id_to_probe": id_to_probe,
            "links": links,
            "slices": self.slices,
        })
    }
}
