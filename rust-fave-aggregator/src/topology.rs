//! Topology commands: links between nodes, devices, generators and probes.

use log::{debug, info, warn};
use rust_fave_common::{
    message::{Generator, NodeKind, Pathlet, Probe, TopologyAction, TopologyCommand, TopologyTarget},
    types::{PortId, SOURCE_PORT_INDEX},
    DeviceModel, Error, HeaderSpace, Result,
};
use rust_fave_rpc::{ProbeRequest, VerificationEngine};
use serde_json::{json, Value};

use crate::{
    state::{AggregatorState, SourceEntry},
    sync::Aggregator,
    translate,
};

impl<E: VerificationEngine> Aggregator<E> {
    pub(crate) async fn apply_topology(&mut self, command: TopologyCommand) -> Result<()> {
        use TopologyAction::{Add, Del};

        match (command.action, command.target) {
            (Add, TopologyTarget::Links(links)) => {
                for (from, to) in &links {
                    let result = self.install_link(from, to, None).await;
                    self.tolerate(result, format_args!("link {} -> {}", from, to))?;
                }
                Ok(())
            }
            (Del, TopologyTarget::Links(links)) => {
                for (from, to) in &links {
                    let result = self.uninstall_link(from, to, None).await;
                    self.tolerate(result, format_args!("link removal {} -> {}", from, to))?;
                }
                Ok(())
            }
            (Add, TopologyTarget::Device(model)) => self.sync_model(model).await,
            (Add, TopologyTarget::Generator(generator)) => self.add_generator(generator).await,
            (Add, TopologyTarget::Probe(probe)) => self.add_probe(probe).await,
            (Add, TopologyTarget::Node { node, .. }) => Err(Error::Decode(format!(
                "cannot add node {} without its model",
                node
            ))),
            (Del, TopologyTarget::Device(model)) => {
                self.remove_tolerated(&model.node, NodeKind::Device(model.model_type))
                    .await
            }
            (Del, TopologyTarget::Generator(generator)) => {
                self.remove_tolerated(&generator.node, NodeKind::Generator).await
            }
            (Del, TopologyTarget::Probe(probe)) => {
                self.remove_tolerated(&probe.node, NodeKind::Probe).await
            }
            (Del, TopologyTarget::Node { node, kind }) => self.remove_tolerated(&node, kind).await,
        }
    }

    async fn remove_tolerated(&mut self, node: &str, kind: NodeKind) -> Result<()> {
        let result = match kind {
            NodeKind::Device(_) => self.remove_node(node).await,
            NodeKind::Generator => self.remove_generator(node).await,
            NodeKind::Probe => self.remove_probe(node).await,
        };
        self.tolerate(result, format_args!("removal of {}", node))
    }

    /* ------------------------------------------------------------ *
     * Links
     * ------------------------------------------------------------ */

    /// Resolve a link to `(egress of from, ingress of to)`.
    fn link_ports(&self, from: &str, to: &str, hint: Option<&DeviceModel>) -> Result<(PortId, PortId)> {
        Ok((
            self.state.resolve_port(from, true, hint)?,
            self.state.resolve_port(to, false, hint)?,
        ))
    }

    pub(crate) async fn install_link(
        &mut self,
        from: &str,
        to: &str,
        hint: Option<&DeviceModel>,
    ) -> Result<()> {
        let (src, dst) = self.link_ports(from, to, hint)?;
        if self.state.has_link(src, dst) {
            debug!("Link {} -> {} already installed", from, to);
            return Ok(());
        }
        debug!("Add link {} -> {} ({} -> {})", from, to, src, dst);
        self.engine.add_link(src, dst).await?;
        self.state.insert_link(src, dst);
        Ok(())
    }

    pub(crate) async fn uninstall_link(
        &mut self,
        from: &str,
        to: &str,
        hint: Option<&DeviceModel>,
    ) -> Result<()> {
        let (src, dst) = self.link_ports(from, to, hint)?;
        if !self.state.has_link(src, dst) {
            return Err(Error::UnknownReference(format!("link {} -> {}", from, to)));
        }
        debug!("Remove link {} -> {} ({} -> {})", from, to, src, dst);
        self.engine.remove_link(src, dst).await?;
        self.state.remove_link(src, dst);
        Ok(())
    }

    async fn unlink_port(&mut self, port: PortId) -> Result<()> {
        for (from, to) in self.state.links_touching(port) {
            self.engine.remove_link(from, to).await?;
            self.state.remove_link(from, to);
        }
        Ok(())
    }

    /// Give a source or probe node its own table and single port.
    fn allocate_source_node(&mut self, node: &str, port_name: &str) -> PortId {
        let table = self.state.allocate_table(node);
        let port = PortId::new(table, SOURCE_PORT_INDEX);
        self.state.insert_port(port_name, port);
        port
    }

    fn release_source_node(&mut self, node: &str, port_name: &str) {
        self.state.forget_port(port_name);
        self.state.forget_table(node);
    }

    /* ------------------------------------------------------------ *
     * Generators
     * ------------------------------------------------------------ */

    async fn add_generator(&mut self, generator: Generator) -> Result<()> {
        let node = generator.node.as_str();
        if self.state.generator(node).is_some() {
            info!("Replacing generator {}", node);
            self.remove_generator(node).await?;
        }

        let fields: Vec<String> = generator.fields.keys().cloned().collect();
        self.grow_mapping(generator.mapping.as_ref(), &fields).await?;

        let space = {
            let state = &self.state;
            let mapping = state.mapping();
            match (&generator.outgoing, &generator.mapping) {
                (Some(outgoing), Some(layout)) => outgoing.align(layout, mapping)?,
                (Some(outgoing), None) if outgoing.length() != mapping.length() => {
                    return Err(Error::LengthMismatch {
                        expected: mapping.length(),
                        actual: outgoing.length(),
                    })
                }
                (Some(outgoing), None) => outgoing.clone(),
                (None, _) => {
                    let resolve = |field: &str, port: &str| state.resolve_port(port, field == "out_port", None);
                    translate::header_space(mapping, &generator.combinations(), &[], &resolve)?
                }
            }
        };

        let port_name = generator.port();
        let port = self.allocate_source_node(node, &port_name);
        let handle = match self.engine.add_source(space.clone(), vec![port]).await {
            Ok(handle) => handle,
            Err(err) => {
                self.release_source_node(node, &port_name);
                return Err(err);
            }
        };

        info!("Added generator {} on {} ({})", node, port, handle);
        self.state.insert_generator(
            node,
            SourceEntry {
                table: port.table(),
                port,
                handle,
                space,
            },
        );
        Ok(())
    }

    async fn remove_generator(&mut self, node: &str) -> Result<()> {
        let entry = self
            .state
            .remove_generator(node)
            .ok_or_else(|| Error::UnknownReference(format!("generator {}", node)))?;

        self.unlink_port(entry.port).await?;
        self.engine.remove_source(entry.handle).await?;
        self.release_source_node(node, &format!("{}.1", node));
        info!("Removed generator {}", node);
        Ok(())
    }

    /* ------------------------------------------------------------ *
     * Probes
     * ------------------------------------------------------------ */

    async fn add_probe(&mut self, probe: Probe) -> Result<()> {
        let node = probe.node.as_str();
        if probe.test_fields.is_empty() && probe.test_path.pathlets.is_empty() {
            warn!("Probe {} has neither test fields nor a test path, skipping", node);
            self.metrics.edits_skipped.increment();
            return Ok(());
        }
        if self.state.probe(node).is_some() {
            info!("Replacing probe {}", node);
            self.remove_probe(node).await?;
        }

        let fields: Vec<String> = probe
            .r#match
            .fields
            .iter()
            .chain(probe.filter_fields.values().flatten())
            .chain(probe.test_fields.values().flatten())
            .map(|f| f.name.clone())
            .collect();
        self.grow_mapping(probe.mapping.as_ref(), &fields).await?;

        let (r#match, filter_space, test) = {
            let state = &self.state;
            let mapping = state.mapping();
            let resolve = |field: &str, port: &str| state.resolve_port(port, field == "out_port", None);

            let r#match = translate::project(mapping, &probe.r#match.fields, &resolve)?;
            let filter_space = translate::header_space(
                mapping,
                &translate::alternatives(&probe.filter_fields),
                &[],
                &resolve,
            )?;
            let test = probe_test(state, &probe, &resolve)?;
            (r#match, filter_space, test)
        };

        let port_name = probe.port();
        let port = self.allocate_source_node(node, &port_name);
        let request = ProbeRequest {
            table: port.table(),
            ports: vec![port],
            quantor: probe.quantor,
            r#match,
            filter: Some(header_expression(&filter_space)),
            test,
        };
        let handle = match self.engine.add_source_probe(request).await {
            Ok(handle) => handle,
            Err(err) => {
                self.release_source_node(node, &port_name);
                return Err(err);
            }
        };

        info!("Added {} probe {} on {} ({})", probe.quantor, node, port, handle);
        self.state.insert_probe(
            node,
            SourceEntry {
                table: port.table(),
                port,
                handle,
                space: filter_space,
            },
        );
        Ok(())
    }

    async fn remove_probe(&mut self, node: &str) -> Result<()> {
        let entry = self
            .state
            .remove_probe(node)
            .ok_or_else(|| Error::UnknownReference(format!("probe {}", node)))?;

        self.unlink_port(entry.port).await?;
        self.engine.remove_source_probe(entry.handle).await?;
        self.release_source_node(node, &format!("{}.1", node));
        info!("Removed probe {}", node);
        Ok(())
    }
}

fn header_expression(space: &HeaderSpace) -> Value {
    json!({ "type": "header", "header": translate::header_operand(space) })
}

/// Test expression of a probe: its header test, its path test, or both.
fn probe_test<R: translate::PortResolver>(
    state: &AggregatorState,
    probe: &Probe,
    resolve: &R,
) -> Result<Value> {
    let header = if probe.test_fields.is_empty() {
        None
    } else {
        let space = translate::header_space(
            state.mapping(),
            &translate::alternatives(&probe.test_fields),
            &[],
            resolve,
        )?;
        Some(header_expression(&space))
    };

    let path = if probe.test_path.pathlets.is_empty() {
        None
    } else {
        let pathlets = probe
            .test_path
            .pathlets
            .iter()
            .map(|p| pathlet_value(state, p))
            .collect::<Result<Vec<_>>>()?;
        Some(json!({ "type": "path", "pathlets": pathlets }))
    };

    match (header, path) {
        (Some(header), Some(path)) => Ok(json!({ "type": "and", "arg1": header, "arg2": path })),
        (Some(test), None) | (None, Some(test)) => Ok(test),
        (None, None) => Err(Error::invalid_value("test", probe.node.clone())),
    }
}

/// A pathlet with port and node names replaced by global IDs.
fn pathlet_value(state: &AggregatorState, pathlet: &Pathlet) -> Result<Value> {
    let ports = |names: &[String]| {
        names
            .iter()
            .map(|p| state.resolve_port(p, false, None))
            .collect::<Result<Vec<_>>>()
    };
    let tables = |nodes: &[String]| {
        nodes
            .iter()
            .map(|n| state.node_table(n))
            .collect::<Result<Vec<_>>>()
    };

    let value = match pathlet {
        Pathlet::Port { port } => {
            json!({ "type": "port", "port": state.resolve_port(port, false, None)? })
        }
        Pathlet::NextPorts { ports: names } => json!({ "type": "next_ports", "ports": ports(names)? }),
        Pathlet::LastPorts { ports: names } => json!({ "type": "last_ports", "ports": ports(names)? }),
        Pathlet::Table { table } => json!({ "type": "table", "table": state.node_table(table)? }),
        Pathlet::NextTables { tables: nodes } => {
            json!({ "type": "next_tables", "tables": tables(nodes)? })
        }
        Pathlet::LastTables { tables: nodes } => {
            json!({ "type": "last_tables", "tables": tables(nodes)? })
        }
        other => serde_json::to_value(other)?,
    };
    Ok(value)
}
