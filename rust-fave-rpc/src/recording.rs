//! An engine that records calls instead of performing them.
//!
//! Used for dry runs of the aggregator and to observe the exact call
//! sequence in tests.

use async_trait::async_trait;
use log::info;
use rust_fave_common::{Error, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::{protocol::EngineCall, VerificationEngine};

/// Shared, cloneable view of the recorded calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<EngineCall>>>,
}

impl CallLog {
    fn push(&self, call: EngineCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Copy of every call so far.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Method names of every call so far.
    pub fn methods(&self) -> Vec<&'static str> {
        self.calls
            .lock()
            .map(|c| c.iter().map(EngineCall::method).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all calls recorded so far.
    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

/// Engine stand-in handing out sequential handles.
#[derive(Debug)]
pub struct RecordingEngine {
    log: CallLog,
    next_handle: u64,
    fail_method: Option<&'static str>,
    verbose: bool,
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self {
            log: CallLog::default(),
            next_handle: 1,
            fail_method: None,
            verbose: false,
        }
    }

    /// Log every call at info level.
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Reject every call to `method` with an RPC error.
    pub fn failing_on(mut self, method: &'static str) -> Self {
        self.fail_method = Some(method);
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

#[async_trait]
impl VerificationEngine for RecordingEngine {
    async fn execute(&mut self, call: EngineCall) -> Result<Value> {
        if self.verbose {
            info!("[dry-run] {} {}", call.method(), call.params());
        }
        if self.fail_method == Some(call.method()) {
            return Err(Error::Rpc(format!("{} rejected", call.method())));
        }

        let result = if call.returns_handle() {
            let handle = self.next_handle;
            self.next_handle += 1;
            Value::from(handle)
        } else {
            Value::Bool(true)
        };
        self.log.push(call);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_fave_common::types::{PortId, RuleHandle, TableId};

    #[tokio::test]
    async fn test_records_in_order() {
        let mut engine = RecordingEngine::new();
        let log = engine.log();

        engine.add_table(TableId(1), vec![PortId(0x10001)]).await.unwrap();
        engine.remove_table(TableId(1)).await.unwrap();

        assert_eq!(log.methods(), vec!["add_table", "remove_table"]);
        assert_eq!(
            log.calls()[0],
            EngineCall::AddTable {
                id: TableId(1),
                ports: vec![PortId(0x10001)]
            }
        );
    }

    #[tokio::test]
    async fn test_sequential_handles() {
        let mut engine = RecordingEngine::new();
        let hs = rust_fave_common::HeaderSpace::new(0);
        assert_eq!(engine.add_source(hs.clone(), vec![]).await.unwrap(), RuleHandle(1));
        assert_eq!(engine.add_source(hs, vec![]).await.unwrap(), RuleHandle(2));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut engine = RecordingEngine::new().failing_on("expand");
        let log = engine.log();
        assert!(matches!(engine.expand(8).await, Err(Error::Rpc(_))));
        assert!(log.is_empty());
    }
}
