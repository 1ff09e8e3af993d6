//! Producer messages and the registry that decodes them.
//!
//! Every message is a JSON object with a `"type"` tag. The [`ModelRegistry`]
//! maps each tag to a decoder producing a [`Message`]; unknown tags are
//! rejected with [`Error::UnsupportedModelType`].

use crate::error::Error;
use crate::mapping::FieldMapping;
use crate::model::{DeviceModel, ModelType};
use crate::rule::{value_to_string, Match, Rule, RuleField};
use crate::vector::HeaderSpace;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Directed link between two ports of different nodes.
pub type Link = (String, String);

/* ---------------------------------------------------------------- *
 * Rule commands
 * ---------------------------------------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCommandKind {
    #[serde(alias = "add_rule")]
    AddRules,
    #[serde(alias = "remove_rule")]
    RemoveRules,
    #[serde(alias = "update_rule")]
    UpdateRules,
}

/// Incremental rule change for a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCommand {
    pub node: String,
    pub command: RuleCommandKind,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<FieldMapping>,
}

impl RuleCommand {
    /// Queue this command's edits on `model`.
    pub fn stage(&self, model: &mut DeviceModel) {
        match self.command {
            RuleCommandKind::AddRules | RuleCommandKind::UpdateRules => {
                model.add_rules(self.rules.iter().cloned())
            }
            RuleCommandKind::RemoveRules => {
                for rule in &self.rules {
                    model.remove_rule(rule.tid.clone(), rule.idx);
                }
            }
        }
    }

    /// A minimal model for a node that has not been seen yet.
    pub fn synthesize(&self, model_type: ModelType) -> DeviceModel {
        let mut model = DeviceModel::new(self.node.clone(), model_type);
        for rule in &self.rules {
            model.tables.entry(rule.tid.clone()).or_default();
        }
        if let Some(mapping) = &self.mapping {
            model.mapping = mapping.clone();
        }
        model
    }
}

/* ---------------------------------------------------------------- *
 * Topology: generators and probes
 * ---------------------------------------------------------------- */

fn field_value_lists<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<String>>, D::Error> {
    let raw = BTreeMap::<String, Vec<Value>>::deserialize(deserializer)?;
    let mut fields = BTreeMap::new();
    for (name, values) in raw {
        let mut converted = Vec::with_capacity(values.len());
        for value in values {
            let shown = value.to_string();
            match value_to_string(value) {
                Some(v) => converted.push(v),
                None => {
                    return Err(<D::Error as serde::de::Error>::custom(format!(
                        "unsupported value for {}: {}",
                        name, shown
                    )))
                }
            }
        }
        fields.insert(name, converted);
    }
    Ok(fields)
}

/// A traffic source attached to the network.
///
/// The emitted header space is either the cartesian product of `fields`
/// or, when given, the `outgoing` header space laid out by `mapping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generator {
    pub node: String,
    #[serde(default, deserialize_with = "field_value_lists")]
    pub fields: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing: Option<HeaderSpace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<FieldMapping>,
}

impl Generator {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            fields: BTreeMap::new(),
            outgoing: None,
            mapping: None,
        }
    }

    /// Name of the generator's only port.
    pub fn port(&self) -> String {
        format!("{}.1", self.node)
    }

    /// One field assignment per element of the cartesian product of
    /// `fields`, taken in field-name order.
    pub fn combinations(&self) -> Vec<Vec<RuleField>> {
        self.fields
            .iter()
            .fold(vec![Vec::new()], |acc, (name, values)| {
                acc.iter()
                    .flat_map(|prefix| {
                        values.iter().map(move |value| {
                            let mut next = prefix.clone();
                            next.push(RuleField::new(name.clone(), value.clone()));
                            next
                        })
                    })
                    .collect()
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantor {
    Universal,
    Existential,
}

impl fmt::Display for Quantor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantor::Universal => f.write_str("universal"),
            Quantor::Existential => f.write_str("existential"),
        }
    }
}

/// One step of a probe path expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pathlet {
    Port { port: String },
    NextPorts { ports: Vec<String> },
    LastPorts { ports: Vec<String> },
    Table { table: String },
    NextTables { tables: Vec<String> },
    LastTables { tables: Vec<String> },
    Start,
    End,
    Skip,
    SkipNext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    #[serde(default)]
    pub pathlets: Vec<Pathlet>,
}

/// A traffic sink that checks packets arriving on its port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub node: String,
    pub quantor: Quantor,
    #[serde(default)]
    pub r#match: Match,
    #[serde(default)]
    pub filter_fields: BTreeMap<String, Vec<RuleField>>,
    #[serde(default)]
    pub test_fields: BTreeMap<String, Vec<RuleField>>,
    #[serde(default)]
    pub test_path: Path,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<FieldMapping>,
}

impl Probe {
    pub fn new(node: impl Into<String>, quantor: Quantor) -> Self {
        Self {
            node: node.into(),
            quantor,
            r#match: Match::default(),
            filter_fields: BTreeMap::new(),
            test_fields: BTreeMap::new(),
            test_path: Path::default(),
            mapping: None,
        }
    }

    /// Name of the probe's only port.
    pub fn port(&self) -> String {
        format!("{}.1", self.node)
    }
}

/* ---------------------------------------------------------------- *
 * Topology and slicing commands
 * ---------------------------------------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyAction {
    Add,
    Del,
}

/// What a removal addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Device(ModelType),
    Generator,
    Probe,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyTarget {
    Links(Vec<Link>),
    Device(DeviceModel),
    Generator(Generator),
    Probe(Probe),
    /// Removal of a whole node.
    Node { node: String, kind: NodeKind },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopologyCommand {
    pub action: TopologyAction,
    pub target: TopologyTarget,
}

/// A named region of header space the engine checks for isolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    #[serde(alias = "sid")]
    pub id: u64,
    #[serde(default)]
    pub ns_list: Vec<Vec<RuleField>>,
    #[serde(default)]
    pub ns_diff: Vec<Vec<RuleField>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlicingCommand {
    AddSlice(Slice),
    DelSlice(u64),
}

/* ---------------------------------------------------------------- *
 * Message
 * ---------------------------------------------------------------- */

/// Everything a producer can send to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Model(DeviceModel),
    SwitchCommand(RuleCommand),
    StateCommand(RuleCommand),
    Topology(TopologyCommand),
    Slicing(SlicingCommand),
    /// Write the aggregator state to `<dir>/fave.json`.
    Dump { dir: String },
    /// Drain the queue and shut down.
    Stop,
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Model(model) => model.model_type.as_str(),
            Message::SwitchCommand(_) => "switch_command",
            Message::StateCommand(_) => "state_command",
            Message::Topology(_) => "topology_command",
            Message::Slicing(_) => "slicing_command",
            Message::Dump { .. } => "dump",
            Message::Stop => "stop",
        }
    }

    /// Node the message is about, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Message::Model(model) => Some(&model.node),
            Message::SwitchCommand(cmd) | Message::StateCommand(cmd) => Some(&cmd.node),
            Message::Topology(cmd) => match &cmd.target {
                TopologyTarget::Device(model) => Some(&model.node),
                TopologyTarget::Generator(generator) => Some(&generator.node),
                TopologyTarget::Probe(probe) => Some(&probe.node),
                TopologyTarget::Node { node, .. } => Some(node),
                TopologyTarget::Links(_) => None,
            },
            _ => None,
        }
    }

    /// JSON form accepted by [`ModelRegistry::decode`].
    pub fn to_json(&self) -> Result<Value> {
        let mut value = match self {
            Message::Model(model) => serde_json::to_value(model)?,
            Message::SwitchCommand(cmd) | Message::StateCommand(cmd) => serde_json::to_value(cmd)?,
            Message::Topology(cmd) => {
                let (mtype, model) = match &cmd.target {
                    TopologyTarget::Links(links) => ("links", serde_json::to_value(links)?),
                    TopologyTarget::Device(model) => {
                        (model.model_type.as_str(), serde_json::to_value(model)?)
                    }
                    TopologyTarget::Generator(g) => ("generator", serde_json::to_value(g)?),
                    TopologyTarget::Probe(p) => ("probe", serde_json::to_value(p)?),
                    TopologyTarget::Node { node, kind } => {
                        let mtype = match kind {
                            NodeKind::Device(t) => t.as_str(),
                            NodeKind::Generator => "generator",
                            NodeKind::Probe => "probe",
                        };
                        (mtype, json!({ "node": node }))
                    }
                };
                json!({ "command": cmd.action, "mtype": mtype, "model": model })
            }
            Message::Slicing(SlicingCommand::AddSlice(slice)) => {
                json!({ "command": "add_slice", "slice": slice })
            }
            Message::Slicing(SlicingCommand::DelSlice(id)) => {
                json!({ "command": "del_slice", "slice": { "id": id } })
            }
            Message::Dump { dir } => json!({ "dir": dir }),
            Message::Stop => json!({}),
        };
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), Value::String(self.tag().to_string()));
        }
        Ok(value)
    }

    /// Serialized JSON payload, ready to be framed.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_json()?)?)
    }
}

/* ---------------------------------------------------------------- *
 * Registry
 * ---------------------------------------------------------------- */

/// Decoder for one message tag.
pub type Decoder = fn(&ModelRegistry, Value) -> Result<Message>;

/// Tag-keyed decoders for producer messages.
#[derive(Clone)]
pub struct ModelRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("ModelRegistry").field("tags", &tags).finish()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for tag in ["model", "packet_filter", "snapshot_packet_filter", "switch"] {
            registry.register(tag, decode_model);
        }
        registry.register("switch_command", decode_switch_command);
        registry.register("state_command", decode_state_command);
        registry.register("topology_command", decode_topology_command);
        registry.register("links", decode_links);
        registry.register("generator", decode_generator);
        registry.register("host", decode_host);
        registry.register("probe", decode_probe);
        registry.register("slicing_command", decode_slicing_command);
        registry.register("dump", decode_dump);
        registry.register("stop", |_, _| Ok(Message::Stop));
        registry
    }
}

impl ModelRegistry {
    /// Registry with every built-in message type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without any decoders.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `decoder` for `tag`, returning the decoder it replaces.
    pub fn register(&mut self, tag: &'static str, decoder: Decoder) -> Option<Decoder> {
        self.decoders.insert(tag, decoder)
    }

    pub fn supports(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decode a raw JSON payload.
    pub fn decode(&self, payload: &[u8]) -> Result<Message> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Decode(format!("invalid JSON payload: {}", e)))?;
        self.decode_value(value)
    }

    pub fn decode_value(&self, value: Value) -> Result<Message> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Decode("message without type tag".into()))?
            .to_string();
        let decoder = self
            .decoders
            .get(tag.as_str())
            .ok_or(Error::UnsupportedModelType(tag))?;
        decoder(self, value)
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))
}

fn decode_model(_: &ModelRegistry, value: Value) -> Result<Message> {
    parse(value).map(Message::Model)
}

fn decode_switch_command(_: &ModelRegistry, value: Value) -> Result<Message> {
    parse(value).map(Message::SwitchCommand)
}

fn decode_state_command(_: &ModelRegistry, value: Value) -> Result<Message> {
    parse(value).map(Message::StateCommand)
}

fn decode_generator(_: &ModelRegistry, value: Value) -> Result<Message> {
    let generator = parse(value)?;
    Ok(Message::Topology(TopologyCommand {
        action: TopologyAction::Add,
        target: TopologyTarget::Generator(generator),
    }))
}

/// A host is a generator whose traffic is given as an `outgoing` space.
fn parse_host(value: Value) -> Result<Generator> {
    let host: Generator = parse(value)?;
    if host.outgoing.is_none() {
        return Err(Error::Decode(format!("host {} without outgoing header space", host.node)));
    }
    Ok(host)
}

fn decode_host(_: &ModelRegistry, value: Value) -> Result<Message> {
    Ok(Message::Topology(TopologyCommand {
        action: TopologyAction::Add,
        target: TopologyTarget::Generator(parse_host(value)?),
    }))
}

fn decode_probe(_: &ModelRegistry, value: Value) -> Result<Message> {
    let probe = parse(value)?;
    Ok(Message::Topology(TopologyCommand {
        action: TopologyAction::Add,
        target: TopologyTarget::Probe(probe),
    }))
}

fn decode_links(_: &ModelRegistry, mut value: Value) -> Result<Message> {
    let links = value
        .get_mut("links")
        .map(Value::take)
        .ok_or_else(|| Error::Decode("links message without links".into()))?;
    Ok(Message::Topology(TopologyCommand {
        action: TopologyAction::Add,
        target: TopologyTarget::Links(parse(links)?),
    }))
}

fn decode_dump(_: &ModelRegistry, value: Value) -> Result<Message> {
    #[derive(Deserialize)]
    struct Raw {
        dir: String,
    }
    let raw: Raw = parse(value)?;
    Ok(Message::Dump { dir: raw.dir })
}

fn decode_topology_command(registry: &ModelRegistry, value: Value) -> Result<Message> {
    #[derive(Deserialize)]
    struct Raw {
        command: TopologyAction,
        #[serde(default)]
        mtype: Option<String>,
        #[serde(default)]
        model: Option<Value>,
        #[serde(default)]
        node: Option<String>,
    }

    let raw: Raw = parse(value)?;
    let mtype = match (&raw.mtype, &raw.model) {
        (Some(mtype), _) => mtype.clone(),
        (None, Some(Value::Array(_))) => "links".to_string(),
        (None, Some(model)) => model
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Decode("topology command without model type".into()))?
            .to_string(),
        (None, None) => return Err(Error::Decode("topology command without model".into())),
    };

    let node = || -> Result<String> {
        raw.node
            .clone()
            .or_else(|| {
                raw.model
                    .as_ref()
                    .and_then(|m| m.get("node"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| Error::Decode(format!("{} removal without node", mtype)))
    };
    let model = || -> Result<Value> {
        raw.model
            .clone()
            .ok_or_else(|| Error::Decode(format!("{} addition without model", mtype)))
    };

    let target = match (mtype.as_str(), raw.command) {
        ("links", _) => TopologyTarget::Links(parse(model()?)?),
        ("generator", TopologyAction::Add) => TopologyTarget::Generator(parse(model()?)?),
        ("probe", TopologyAction::Add) => TopologyTarget::Probe(parse(model()?)?),
        ("host", TopologyAction::Add) => TopologyTarget::Generator(parse_host(model()?)?),
        ("generator" | "host", TopologyAction::Del) => TopologyTarget::Node {
            node: node()?,
            kind: NodeKind::Generator,
        },
        ("probe", TopologyAction::Del) => TopologyTarget::Node {
            node: node()?,
            kind: NodeKind::Probe,
        },
        (tag, action) => {
            let model_type =
                ModelType::from_tag(tag).ok_or_else(|| Error::UnsupportedModelType(tag.to_string()))?;
            match action {
                TopologyAction::Add => {
                    let mut model = model()?;
                    if let Value::Object(map) = &mut model {
                        map.entry("type").or_insert_with(|| Value::String(tag.to_string()));
                    }
                    match registry.decode_value(model)? {
                        Message::Model(model) => TopologyTarget::Device(model),
                        other => {
                            return Err(Error::Decode(format!(
                                "topology command carries {} instead of a device model",
                                other.tag()
                            )))
                        }
                    }
                }
                TopologyAction::Del => TopologyTarget::Node {
                    node: node()?,
                    kind: NodeKind::Device(model_type),
                },
            }
        }
    };

    Ok(Message::Topology(TopologyCommand {
        action: raw.command,
        target,
    }))
}

fn decode_slicing_command(_: &ModelRegistry, value: Value) -> Result<Message> {
    #[derive(Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Kind {
        AddSlice,
        DelSlice,
    }
    #[derive(Deserialize)]
    struct Raw {
        command: Kind,
        slice: Value,
    }

    let raw: Raw = parse(value)?;
    let command = match raw.command {
        Kind::AddSlice => SlicingCommand::AddSlice(parse(raw.slice)?),
        Kind::DelSlice => {
            let id = raw
                .slice
                .get("id")
                .or_else(|| raw.slice.get("sid"))
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::Decode("slice removal without id".into()))?;
            SlicingCommand::DelSlice(id)
        }
    };
    Ok(Message::Slicing(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_is_rejected() {
        let registry = ModelRegistry::new();
        let err = registry.decode(br#"{"type": "router", "node": "r1"}"#).unwrap_err();
        assert!(matches!(err, Error::UnsupportedModelType(t) if t == "router"));

        assert!(matches!(registry.decode(b"{not json"), Err(Error::Decode(_))));
        assert!(matches!(registry.decode(br#"{"node": "r1"}"#), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_device_model() {
        let payload = json!({
            "type": "packet_filter",
            "node": "fw",
            "tables": {"fw.t1": []},
            "ports": {"fw.t1_in": "fw.t1"},
            "wiring": [],
            "mapping": {"packet.ipv6.destination": 0, "length": 128}
        });
        let message = ModelRegistry::new()
            .decode(payload.to_string().as_bytes())
            .unwrap();
        match message {
            Message::Model(model) => {
                assert_eq!(model.model_type, ModelType::PacketFilter);
                assert_eq!(model.mapping.length(), 128);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_custom_decoder() {
        let mut registry = ModelRegistry::empty();
        assert!(!registry.supports("stop"));
        registry.register("stop", |_, _| Ok(Message::Stop));
        assert_eq!(registry.decode(br#"{"type":"stop"}"#).unwrap(), Message::Stop);
    }

    #[test]
    fn test_rule_command_aliases() {
        let payload = json!({
            "type": "switch_command",
            "node": "s1",
            "command": "remove_rule",
            "rules": [{"tid": "s1.1", "idx": 4}]
        });
        match ModelRegistry::new().decode_value(payload).unwrap() {
            Message::SwitchCommand(cmd) => {
                assert_eq!(cmd.command, RuleCommandKind::RemoveRules);
                let mut model = DeviceModel::switch("s1", [1], Vec::new());
                cmd.stage(&mut model);
                assert_eq!(model.pending_deletes(), &[("s1.1".to_string(), 4)]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_topology_commands() {
        let registry = ModelRegistry::new();

        let links = registry
            .decode_value(json!({"type": "links", "links": [["a.1", "b.1"]]}))
            .unwrap();
        assert_eq!(
            links,
            Message::Topology(TopologyCommand {
                action: TopologyAction::Add,
                target: TopologyTarget::Links(vec![("a.1".into(), "b.1".into())]),
            })
        );

        let del = registry
            .decode_value(json!({"type": "topology_command", "command": "del", "mtype": "switch", "node": "s1"}))
            .unwrap();
        assert_eq!(del.node(), Some("s1"));

        let add = registry
            .decode_value(json!({
                "type": "topology_command",
                "command": "add",
                "mtype": "switch",
                "model": {"node": "s2", "tables": {"s2.1": []}}
            }))
            .unwrap();
        match add {
            Message::Topology(TopologyCommand {
                target: TopologyTarget::Device(model),
                ..
            }) => assert_eq!(model.model_type, ModelType::Switch),
            other => panic!("unexpected message {:?}", other),
        }

        let host = registry
            .decode_value(json!({
                "type": "topology_command",
                "command": "add",
                "mtype": "host",
                "model": {
                    "node": "h1",
                    "type": "host",
                    "address": "2001:db8::1",
                    "mapping": {"packet.ipv6.proto": 0, "length": 8},
                    "outgoing": {"length": 8, "hs_list": ["00000110"], "hs_diff": []}
                }
            }))
            .unwrap();
        match host {
            Message::Topology(TopologyCommand {
                action: TopologyAction::Add,
                target: TopologyTarget::Generator(generator),
            }) => {
                assert_eq!(generator.port(), "h1.1");
                assert_eq!(generator.outgoing.unwrap().included().len(), 1);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let host_del = registry
            .decode_value(json!({"type": "topology_command", "command": "del", "mtype": "host", "node": "h1"}))
            .unwrap();
        assert_eq!(
            host_del,
            Message::Topology(TopologyCommand {
                action: TopologyAction::Del,
                target: TopologyTarget::Node {
                    node: "h1".into(),
                    kind: NodeKind::Generator,
                },
            })
        );

        // A host must carry its traffic
        let empty_host = registry.decode_value(json!({"type": "host", "node": "h2"}));
        assert!(matches!(empty_host, Err(Error::Decode(_))));

        let bad = registry.decode_value(json!({
            "type": "topology_command", "command": "add", "mtype": "router", "model": {}
        }));
        assert!(matches!(bad, Err(Error::UnsupportedModelType(_))));
    }

    #[test]
    fn test_generator_combinations() {
        let payload = json!({
            "type": "generator",
            "node": "g1",
            "fields": {
                "packet.upper.dport": [22, 80],
                "packet.ipv6.proto": ["tcp"]
            }
        });
        let message = ModelRegistry::new().decode_value(payload).unwrap();
        let generator = match message {
            Message::Topology(TopologyCommand {
                target: TopologyTarget::Generator(g),
                ..
            }) => g,
            other => panic!("unexpected message {:?}", other),
        };

        assert_eq!(generator.port(), "g1.1");
        let combos = generator.combinations();
        assert_eq!(combos.len(), 2);
        // Sorted by field name: proto before dport
        assert_eq!(combos[0][0], RuleField::new("packet.ipv6.proto", "tcp"));
        assert_eq!(combos[1][1], RuleField::new("packet.upper.dport", "80"));

        assert_eq!(Generator::new("g2").combinations(), vec![Vec::<RuleField>::new()]);
    }

    #[test]
    fn test_messages_survive_json() {
        let messages = vec![
            Message::Stop,
            Message::Dump { dir: "/tmp/np".into() },
            Message::Model(DeviceModel::packet_filter("fw", [1])),
            Message::Slicing(SlicingCommand::DelSlice(3)),
            Message::Topology(TopologyCommand {
                action: TopologyAction::Del,
                target: TopologyTarget::Node {
                    node: "p1".into(),
                    kind: NodeKind::Probe,
                },
            }),
        ];
        let registry = ModelRegistry::new();
        for message in messages {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(registry.decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_probe_path() {
        let payload = json!({
            "type": "probe",
            "node": "p1",
            "quantor": "existential",
            "test_path": {"pathlets": [
                {"type": "start"},
                {"type": "port", "port": "fw.1"},
                {"type": "last_tables", "tables": ["fw"]}
            ]}
        });
        match ModelRegistry::new().decode_value(payload).unwrap() {
            Message::Topology(TopologyCommand {
                target: TopologyTarget::Probe(probe),
                ..
            }) => {
                assert_eq!(probe.quantor, Quantor::Existential);
                assert_eq!(probe.test_path.pathlets.len(), 3);
                assert_eq!(probe.test_path.pathlets[0], Pathlet::Start);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
