//! Wire format of the verification engine.
//!
//! Every call is a JSON-RPC 2.0 request object. The engine answers with one
//! JSON object whose `result` carries node handles and whose `error` carries
//! a non-zero code on failure.

use rust_fave_common::{
    message::Quantor,
    types::{PortId, RuleHandle, TableId},
    Error, HeaderSpace, Result, Vector,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Request ID sent with every call; calls are strictly sequential.
pub const REQUEST_ID: &str = "0";

pub const JSONRPC_VERSION: &str = "2.0";

/// Everything needed to install one rule vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRequest {
    pub table: TableId,
    /// Engine-side index, see [`rust_fave_common::types::engine_rule_index`].
    pub index: u64,
    pub in_ports: Vec<PortId>,
    pub out_ports: Vec<PortId>,
    pub r#match: Vector,
    pub mask: Option<Vector>,
    pub rewrite: Option<Vector>,
}

/// A probe attached to its own table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub table: TableId,
    pub ports: Vec<PortId>,
    pub quantor: Quantor,
    pub r#match: Vector,
    pub filter: Option<Value>,
    pub test: Value,
}

/// One engine operation.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Init { length: usize },
    Expand { length: usize },
    AddTable { id: TableId, ports: Vec<PortId> },
    RemoveTable { id: TableId },
    AddRule(RuleRequest),
    RemoveRule { handle: RuleHandle },
    AddLink { from: PortId, to: PortId },
    RemoveLink { from: PortId, to: PortId },
    AddSource { hs: HeaderSpace, ports: Vec<PortId> },
    RemoveSource { handle: RuleHandle },
    AddSourceProbe(ProbeRequest),
    RemoveSourceProbe { handle: RuleHandle },
    AddSlice { id: u64, space: HeaderSpace },
    RemoveSlice { id: u64 },
    Stop,
}

impl EngineCall {
    pub fn method(&self) -> &'static str {
        match self {
            EngineCall::Init { .. } => "init",
            EngineCall::Expand { .. } => "expand",
            EngineCall::AddTable { .. } => "add_table",
            EngineCall::RemoveTable { .. } => "remove_table",
            EngineCall::AddRule(_) => "add_rule",
            EngineCall::RemoveRule { .. } => "remove_rule",
            EngineCall::AddLink { .. } => "add_link",
            EngineCall::RemoveLink { .. } => "remove_link",
            EngineCall::AddSource { .. } => "add_source",
            EngineCall::RemoveSource { .. } => "remove_source",
            EngineCall::AddSourceProbe(_) => "add_source_probe",
            EngineCall::RemoveSourceProbe { .. } => "remove_source_probe",
            EngineCall::AddSlice { .. } => "add_slice",
            EngineCall::RemoveSlice { .. } => "remove_slice",
            EngineCall::Stop => "stop",
        }
    }

    /// Whether the engine answers with a node handle.
    pub fn returns_handle(&self) -> bool {
        matches!(
            self,
            EngineCall::AddRule(_) | EngineCall::AddSource { .. } | EngineCall::AddSourceProbe(_)
        )
    }

    pub fn params(&self) -> Value {
        match self {
            EngineCall::Init { length } | EngineCall::Expand { length } => json!({ "length": length }),
            EngineCall::AddTable { id, ports } => json!({ "id": id, "in": ports }),
            EngineCall::RemoveTable { id } => json!({ "id": id }),
            EngineCall::AddRule(rule) => json!({
                "table": rule.table,
                "index": rule.index,
                "in": rule.in_ports,
                "out": rule.out_ports,
                "match": rule.r#match,
                "mask": rule.mask,
                "rw": rule.rewrite,
            }),
            EngineCall::RemoveRule { handle } => json!({ "node": handle }),
            EngineCall::AddLink { from, to } | EngineCall::RemoveLink { from, to } => {
                json!({ "from_port": from, "to_port": to })
            }
            EngineCall::AddSource { hs, ports } => {
                let hs = match (hs.included(), hs.excluded()) {
                    ([single], []) => json!(single),
                    (list, diff) => json!({ "list": list, "diff": diff }),
                };
                json!({ "hs": hs, "ports": ports })
            }
            EngineCall::RemoveSource { handle } | EngineCall::RemoveSourceProbe { handle } => {
                json!({ "id": handle })
            }
            EngineCall::AddSourceProbe(probe) => json!({
                "ports": probe.ports,
                "mode": probe.quantor,
                "match": probe.r#match,
                "filter": probe.filter,
                "test": probe.test,
                "id": probe.table,
            }),
            EngineCall::AddSlice { id, space } => {
                let diff = match space.excluded() {
                    [] => Value::Null,
                    diff => json!(diff),
                };
                json!({
                    "id": id,
                    "net_space": { "type": "header", "list": space.included(), "diff": diff }
                })
            }
            EngineCall::RemoveSlice { id } => json!({ "id": id }),
            EngineCall::Stop => Value::Null,
        }
    }

    /// Full JSON-RPC request object.
    pub fn request(&self) -> Request {
        Request {
            id: REQUEST_ID,
            jsonrpc: JSONRPC_VERSION,
            method: self.method(),
            params: self.params(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Request {
    pub id: &'static str,
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Response {
    /// The `result` value, or the engine's error.
    pub fn into_result(self, method: &str) -> Result<Value> {
        match self.error {
            Some(err) if err.code != 0 => Err(Error::Rpc(format!(
                "{} failed with code {}: {}",
                method, err.code, err.message
            ))),
            _ => Ok(self.result),
        }
    }
}

/// Interpret a `result` value as a node handle.
pub fn handle_from(method: &str, result: &Value) -> Result<RuleHandle> {
    result
        .as_u64()
        .map(RuleHandle)
        .ok_or_else(|| Error::Rpc(format!("{} returned no handle: {}", method, result)))
}
