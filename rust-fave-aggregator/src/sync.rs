//! Synchronization of producer messages onto the verification engine.
//!
//! The [`Aggregator`] decodes one message at a time, turns it into the
//! minimal set of engine edits and keeps [`AggregatorState`] in step with
//! what the engine holds. Full models are always reconciled through the
//! structural diff: removals of `old - new` are applied before additions of
//! `new - old`.

use log::{debug, info, warn};
use rust_fave_common::{
    field::is_port_field,
    message::{RuleCommand, RuleCommandKind, SlicingCommand},
    metrics::{AggregatorMetrics, Timer},
    model::ModelType,
    types::TableId,
    Action, DeviceModel, Error, FieldMapping, Message, ModelRegistry, Result, Rule,
};
use rust_fave_rpc::VerificationEngine;
use std::{collections::BTreeSet, fmt, path::Path, sync::Arc};

use crate::{engine::MeteredEngine, state::AggregatorState, translate, DUMP_FILE_NAME};

/// What the worker should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// A `stop` message was received.
    Stop,
}

/// Single-threaded owner of the aggregator state and the engine client.
pub struct Aggregator<E> {
    pub(crate) engine: MeteredEngine<E>,
    pub(crate) state: AggregatorState,
    registry: ModelRegistry,
    pub(crate) metrics: Arc<AggregatorMetrics>,
}

impl<E> fmt::Debug for Aggregator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("state", &self.state)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<E: VerificationEngine> Aggregator<E> {
    pub fn new(engine: E, mapping: FieldMapping, metrics: Arc<AggregatorMetrics>) -> Self {
        Self {
            engine: MeteredEngine::new(engine, Arc::clone(&metrics)),
            state: AggregatorState::new(mapping),
            registry: ModelRegistry::default(),
            metrics,
        }
    }

    /// Replace the message registry.
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    pub fn metrics(&self) -> Arc<AggregatorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn engine(&self) -> &E {
        self.engine.inner()
    }

    /// Announce the initial vector length to the engine.
    pub async fn start(&mut self) -> Result<()> {
        let length = self.state.mapping().length();
        info!("Initializing engine with vector length {}", length);
        self.engine.init(length).await
    }

    /// Stop the engine.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Stopping engine");
        self.engine.stop().await
    }

    /// Decode and apply one raw producer payload.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Result<Outcome> {
        let message = match self.registry.decode(payload) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.messages_rejected.increment();
                return Err(err);
            }
        };
        self.apply(message).await
    }

    /// Apply one decoded message.
    pub async fn apply(&mut self, message: Message) -> Result<Outcome> {
        let tag = message.tag();
        let node = message.node().unwrap_or("-").to_string();
        let metrics = Arc::clone(&self.metrics);

        let timer = Timer::start(&metrics.task_time);
        let result = self.dispatch(message).await;
        let elapsed = timer.stop();

        match result {
            Ok(outcome) => {
                metrics.messages_applied.increment();
                info!("Applied {} for {} in {:?}", tag, node, elapsed);
                Ok(outcome)
            }
            Err(err) => {
                metrics.messages_failed.increment();
                Err(err)
            }
        }
    }

    async fn dispatch(&mut self, message: Message) -> Result<Outcome> {
        match message {
            Message::Model(model) => self.sync_model(model).await?,
            Message::SwitchCommand(command) => {
                self.apply_rule_command(command, ModelType::Switch).await?
            }
            Message::StateCommand(command) => {
                self.apply_rule_command(command, ModelType::SnapshotPacketFilter)
                    .await?
            }
            Message::Topology(command) => self.apply_topology(command).await?,
            Message::Slicing(command) => self.apply_slicing(command).await?,
            Message::Dump { dir } => self.dump(&dir).await?,
            Message::Stop => return Ok(Outcome::Stop),
        }
        Ok(Outcome::Applied)
    }

    /// Count and log a skippable error, propagate anything else.
    pub(crate) fn tolerate(&self, result: Result<()>, what: impl fmt::Display) -> Result<()> {
        match result {
            Err(err) if err.is_skippable() => {
                warn!("Skipping {}: {}", what, err);
                self.metrics.edits_skipped.increment();
                Ok(())
            }
            other => other,
        }
    }

    /* ------------------------------------------------------------ *
     * Mapping
     * ------------------------------------------------------------ */

    /// Merge `mapping` and `fields` into the global mapping, expanding the
    /// engine and every live header space if it grew.
    pub(crate) async fn grow_mapping(
        &mut self,
        mapping: Option<&FieldMapping>,
        fields: &[String],
    ) -> Result<()> {
        let mut added = 0;
        if let Some(mapping) = mapping {
            added += self.state.absorb_mapping(mapping)?;
        }
        added += self.state.absorb_fields(fields.iter().map(String::as_str))?;

        if added > 0 {
            let length = self.state.mapping().length();
            debug!("Mapping grew by {} bits to {}", added, length);
            self.engine.expand(length).await?;
            self.state.enlarge_spaces(added);
        }
        Ok(())
    }

    /* ------------------------------------------------------------ *
     * Full models
     * ------------------------------------------------------------ */

    /// Reconcile the engine with a full model of one node.
    pub async fn sync_model(&mut self, mut model: DeviceModel) -> Result<()> {
        model.reset();
        let node = model.node.clone();

        if let Some(stored) = self.state.model(&node) {
            if stored.model_type != model.model_type {
                info!(
                    "Node {} changes type from {} to {}, reinstalling",
                    node, stored.model_type, model.model_type
                );
                self.remove_node(&node).await?;
            }
        }

        let old = match self.state.model(&node) {
            Some(stored) => stored.clone(),
            None => DeviceModel::new(node.clone(), model.model_type),
        };
        let add = (&model - &old)?;
        let sub = (&old - &model)?;
        debug!(
            "Node {}: {} rules to add, {} rules to remove",
            node,
            add.rule_count(),
            sub.rule_count()
        );

        let fields: Vec<String> = add
            .rules()
            .flat_map(translate::rule_fields)
            .map(str::to_string)
            .collect();
        self.grow_mapping(Some(&model.mapping), &fields).await?;

        let displaced = self.apply_removals(&sub, &model).await?;
        self.apply_additions(&add, &model).await?;

        // Ports bound to another table come back with new IDs.
        let moved: BTreeSet<&str> = sub
            .ports
            .keys()
            .filter(|port| model.ports.contains_key(*port))
            .map(String::as_str)
            .collect();
        if !moved.is_empty() {
            self.restore_links(displaced).await?;
            self.refresh_rules(&model, &add, &moved).await?;
        }

        self.state.store_model(model);
        Ok(())
    }

    /// Remove every table, rule, link and port of `node`.
    pub(crate) async fn remove_node(&mut self, node: &str) -> Result<()> {
        let old = self
            .state
            .model(node)
            .cloned()
            .ok_or_else(|| Error::UnknownReference(format!("node {}", node)))?;
        let empty = DeviceModel::new(node, old.model_type);
        let sub = (&old - &empty)?;

        self.apply_removals(&sub, &empty).await?;
        self.state.remove_model(node);
        info!("Removed node {}", node);
        Ok(())
    }

    /// Returns the links, by port name, dropped because one of their ports
    /// vanished or moved to another table.
    async fn apply_removals(
        &mut self,
        sub: &DeviceModel,
        new: &DeviceModel,
    ) -> Result<Vec<(String, String)>> {
        for (table, rules) in &sub.tables {
            let id = match self.state.table_id(table) {
                Some(id) => id,
                None => continue,
            };
            for rule in rules {
                for handle in self.state.take_rule(id, rule.idx) {
                    debug!("Remove rule {} of {} ({})", rule.idx, table, handle);
                    self.engine.remove_rule(handle).await?;
                }
            }
        }

        for (from, to) in &sub.wiring {
            let result = self.uninstall_link(from, to, Some(sub)).await;
            self.tolerate(result, format_args!("unwiring {} -> {}", from, to))?;
        }

        // Ports that vanish or move take their links with them.
        let stale_ports: Vec<&str> = sub
            .ports
            .iter()
            .filter(|(port, table)| new.ports.get(*port) != Some(*table))
            .map(|(port, _)| port.as_str())
            .collect();
        let mut displaced = Vec::new();
        for port in &stale_ports {
            if let Some(id) = self.state.port_id(port) {
                for (from, to) in self.state.links_touching(id) {
                    debug!("Remove link {} -> {}", from, to);
                    self.engine.remove_link(from, to).await?;
                    self.state.remove_link(from, to);
                    if let (Some(src), Some(dst)) =
                        (self.state.port_name(from), self.state.port_name(to))
                    {
                        displaced.push((src.to_string(), dst.to_string()));
                    }
                }
            }
        }

        for table in sub.tables.keys().filter(|t| !new.tables.contains_key(*t)) {
            if let Some(id) = self.state.forget_table(table) {
                debug!("Remove table {} ({})", table, id);
                self.engine.remove_table(id).await?;
            }
        }

        for port in stale_ports {
            if self.state.forget_port(port).is_some() {
                debug!("Forget port {}", port);
            }
        }
        Ok(displaced)
    }

    /// Reinstall links whose ports are known again under new IDs.
    async fn restore_links(&mut self, links: Vec<(String, String)>) -> Result<()> {
        for (from, to) in links {
            let (src, dst) = match (self.state.port_id(&from), self.state.port_id(&to)) {
                (Some(src), Some(dst)) => (src, dst),
                _ => {
                    debug!("Drop link {} -> {}", from, to);
                    continue;
                }
            };
            if self.state.has_link(src, dst) {
                continue;
            }
            debug!("Restore link {} -> {} ({} -> {})", from, to, src, dst);
            self.engine.add_link(src, dst).await?;
            self.state.insert_link(src, dst);
        }
        Ok(())
    }

    /// Reinstall unchanged rules of `model` that refer to a moved port.
    async fn refresh_rules(
        &mut self,
        model: &DeviceModel,
        add: &DeviceModel,
        moved: &BTreeSet<&str>,
    ) -> Result<()> {
        for (table, rules) in &model.tables {
            let id = match self.state.table_id(table) {
                Some(id) => id,
                None => continue,
            };
            let installed = add.tables.get(table);
            for rule in rules {
                if installed.map_or(false, |added| added.iter().any(|r| r.idx == rule.idx)) {
                    continue;
                }
                if !mentions_port(rule, model, moved) {
                    continue;
                }
                for handle in self.state.take_rule(id, rule.idx) {
                    debug!("Remove rule {} of {} ({}) for reinstall", rule.idx, table, handle);
                    self.engine.remove_rule(handle).await?;
                }
                let result = self.install_rule(id, rule, model).await;
                self.tolerate(result, format_args!("rule {} of {}", rule.idx, table))?;
            }
        }
        Ok(())
    }

    async fn apply_additions(&mut self, add: &DeviceModel, new: &DeviceModel) -> Result<()> {
        for table in add.tables.keys() {
            if self.state.table_id(table).is_some() {
                continue;
            }
            let id = self.state.allocate_table(table);
            let ports = self.state.assign_ports(id, new.table_ports(table))?;
            debug!("Add table {} ({}) with ports {:?}", table, id, ports);
            self.engine.add_table(id, ports).await?;
        }

        for (port, table) in &new.ports {
            self.state.set_owner(port, &new.node);
            if table.is_empty() || self.state.port_id(port).is_some() {
                continue;
            }
            // New port on a table the engine already knows.
            let result = self
                .state
                .require_table(table)
                .and_then(|id| self.state.assign_ports(id, [port.as_str()]).map(drop));
            self.tolerate(result, format_args!("port {}", port))?;
        }

        for (from, to) in &add.wiring {
            let result = self.install_link(from, to, Some(new)).await;
            self.tolerate(result, format_args!("wiring {} -> {}", from, to))?;
        }

        for (table, rules) in &add.tables {
            let id = match self.state.table_id(table) {
                Some(id) => id,
                None => continue,
            };
            for rule in rules {
                let result = self.install_rule(id, rule, new).await;
                self.tolerate(result, format_args!("rule {} of {}", rule.idx, table))?;
            }
        }
        Ok(())
    }

    async fn install_rule(&mut self, table: TableId, rule: &Rule, model: &DeviceModel) -> Result<()> {
        let requests = {
            let state = &self.state;
            let resolve = |field: &str, port: &str| {
                state.resolve_port(port, field == "out_port", Some(model))
            };
            translate::rule_requests(table, rule, state.mapping(), &resolve)?
        };
        if requests.is_empty() {
            debug!("Rule {} of {} matches nothing", rule.idx, rule.tid);
        }

        for request in requests {
            debug!(
                "Add rule {} to {}: {} -> {:?}",
                request.index, table, request.r#match, request.out_ports
            );
            let handle = self.engine.add_rule(request).await?;
            self.state.record_rule(table, rule.idx, handle);
        }
        Ok(())
    }

    /* ------------------------------------------------------------ *
     * Rule commands
     * ------------------------------------------------------------ */

    async fn apply_rule_command(&mut self, command: RuleCommand, fallback: ModelType) -> Result<()> {
        let mut model = match self.state.model(&command.node) {
            Some(stored) => stored.clone(),
            None if command.command == RuleCommandKind::RemoveRules => {
                let missing = Err(Error::UnknownReference(format!("node {}", command.node)));
                return self.tolerate(missing, format_args!("rule removal on {}", command.node));
            }
            None => {
                info!(
                    "No model for {}, synthesizing a {} model",
                    command.node, fallback
                );
                command.synthesize(fallback)
            }
        };
        if let Some(mapping) = &command.mapping {
            model.mapping.merge(mapping)?;
        }

        command.stage(&mut model);
        debug!(
            "{:?} on {}: {} tables with additions, {} deletions",
            command.command,
            command.node,
            model.pending_adds().len(),
            model.pending_deletes().len()
        );
        model.apply_pending();
        self.sync_model(model).await
    }

    /* ------------------------------------------------------------ *
     * Slicing
     * ------------------------------------------------------------ */

    async fn apply_slicing(&mut self, command: SlicingCommand) -> Result<()> {
        match command {
            SlicingCommand::AddSlice(slice) => {
                let fields: Vec<String> = slice
                    .ns_list
                    .iter()
                    .chain(&slice.ns_diff)
                    .flatten()
                    .map(|f| f.name.clone())
                    .collect();
                self.grow_mapping(None, &fields).await?;

                let space = {
                    let state = &self.state;
                    let resolve =
                        |field: &str, port: &str| state.resolve_port(port, field == "out_port", None);
                    translate::header_space(
                        state.mapping(),
                        &slice.ns_list,
                        &slice.ns_diff,
                        &resolve,
                    )?
                };
                if self.state.has_slice(slice.id) {
                    debug!("Replace slice {}", slice.id);
                    self.engine.remove_slice(slice.id).await?;
                }
                self.engine.add_slice(slice.id, space).await?;
                self.state.insert_slice(slice.id);
                Ok(())
            }
            SlicingCommand::DelSlice(id) => {
                let result = if self.state.remove_slice(id) {
                    self.engine.remove_slice(id).await
                } else {
                    Err(Error::UnknownReference(format!("slice {}", id)))
                };
                self.tolerate(result, format_args!("slice removal {}", id))
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Dump
     * ------------------------------------------------------------ */

    /// Write the current state to `<dir>/fave.json`.
    pub async fn dump(&self, dir: &str) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = Path::new(dir).join(DUMP_FILE_NAME);
        let contents = serde_json::to_vec_pretty(&self.state.dump())?;
        tokio::fs::write(&path, contents).await?;
        info!("Dumped aggregator state to {}", path.display());
        Ok(())
    }
}

/// Whether `rule` names one of `ports` as input, output or port field value.
fn mentions_port(rule: &Rule, model: &DeviceModel, ports: &BTreeSet<&str>) -> bool {
    let named = |port: &str| {
        ports.contains(port)
            || ports.contains(model.ingress_port(port).as_str())
            || ports.contains(model.egress_port(port).as_str())
    };

    rule.in_ports.iter().any(|p| named(p))
        || rule.actions.iter().any(|action| match action {
            Action::Forward { ports } => ports.iter().any(|p| named(p)),
            _ => false,
        })
        || rule
            .r#match
            .fields
            .iter()
            .any(|f| is_port_field(&f.name) && named(&f.value))
}
