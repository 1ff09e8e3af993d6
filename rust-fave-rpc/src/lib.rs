//! Client side of the verification engine protocol.
//!
//! The [`VerificationEngine`] trait is the seam between the aggregator and
//! the engine: [`NetPlumberClient`] speaks JSON-RPC to one or more engine
//! shards, [`RecordingEngine`] only records the calls it receives.

use async_trait::async_trait;
use rust_fave_common::{
    types::{PortId, RuleHandle, TableId},
    HeaderSpace, Result,
};
use serde_json::Value;

pub mod client;
pub mod config;
pub mod protocol;
pub mod recording;

pub use client::NetPlumberClient;
pub use config::{Endpoint, EngineOptions};
pub use protocol::{EngineCall, ProbeRequest, RuleRequest};
pub use recording::{CallLog, RecordingEngine};

/// Default TCP port of a NetPlumber instance
pub const DEFAULT_ENGINE_PORT: u16 = 44001;

/// Operations of the header-space verification engine.
///
/// Implementors only provide [`execute`](VerificationEngine::execute); the
/// typed operations build the call and interpret its result.
#[async_trait]
pub trait VerificationEngine: Send {
    /// Perform one call and return the engine's `result` value.
    async fn execute(&mut self, call: EngineCall) -> Result<Value>;

    async fn init(&mut self, length: usize) -> Result<()> {
        self.execute(EngineCall::Init { length }).await.map(drop)
    }

    /// Grow every vector held by the engine to `length` bits.
    async fn expand(&mut self, length: usize) -> Result<()> {
        self.execute(EngineCall::Expand { length }).await.map(drop)
    }

    async fn add_table(&mut self, id: TableId, ports: Vec<PortId>) -> Result<()> {
        self.execute(EngineCall::AddTable { id, ports }).await.map(drop)
    }

    async fn remove_table(&mut self, id: TableId) -> Result<()> {
        self.execute(EngineCall::RemoveTable { id }).await.map(drop)
    }

    async fn add_rule(&mut self, rule: RuleRequest) -> Result<RuleHandle> {
        let result = self.execute(EngineCall::AddRule(rule)).await?;
        protocol::handle_from("add_rule", &result)
    }

    async fn remove_rule(&mut self, handle: RuleHandle) -> Result<()> {
        self.execute(EngineCall::RemoveRule { handle }).await.map(drop)
    }

    async fn add_link(&mut self, from: PortId, to: PortId) -> Result<()> {
        self.execute(EngineCall::AddLink { from, to }).await.map(drop)
    }

    async fn remove_link(&mut self, from: PortId, to: PortId) -> Result<()> {
        self.execute(EngineCall::RemoveLink { from, to }).await.map(drop)
    }

    async fn add_source(&mut self, hs: HeaderSpace, ports: Vec<PortId>) -> Result<RuleHandle> {
        let result = self.execute(EngineCall::AddSource { hs, ports }).await?;
        protocol::handle_from("add_source", &result)
    }

    async fn remove_source(&mut self, handle: RuleHandle) -> Result<()> {
        self.execute(EngineCall::RemoveSource { handle }).await.map(drop)
    }

    async fn add_source_probe(&mut self, probe: ProbeRequest) -> Result<RuleHandle> {
        let result = self.execute(EngineCall::AddSourceProbe(probe)).await?;
        protocol::handle_from("add_source_probe", &result)
    }

    async fn remove_source_probe(&mut self, handle: RuleHandle) -> Result<()> {
        self.execute(EngineCall::RemoveSourceProbe { handle })
            .await
            .map(drop)
    }

    async fn add_slice(&mut self, id: u64, space: HeaderSpace) -> Result<()> {
        self.execute(EngineCall::AddSlice { id, space }).await.map(drop)
    }

    async fn remove_slice(&mut self, id: u64) -> Result<()> {
        self.execute(EngineCall::RemoveSlice { id }).await.map(drop)
    }

    /// Ask the engine to shut down.
    async fn stop(&mut self) -> Result<()> {
        self.execute(EngineCall::Stop).await.map(drop)
    }
}
