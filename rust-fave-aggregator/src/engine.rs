use async_trait::async_trait;
use log::debug;
use rust_fave_common::{metrics::AggregatorMetrics, Result};
use rust_fave_rpc::{EngineCall, VerificationEngine};
use serde_json::Value;
use std::sync::Arc;

/// Counts every call and failure of the wrapped engine.
#[derive(Debug)]
pub struct MeteredEngine<E> {
    inner: E,
    metrics: Arc<AggregatorMetrics>,
}

impl<E: VerificationEngine> MeteredEngine<E> {
    pub fn new(inner: E, metrics: Arc<AggregatorMetrics>) -> Self {
        Self { inner, metrics }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }
}

#[async_trait]
impl<E: VerificationEngine> VerificationEngine for MeteredEngine<E> {
    async fn execute(&mut self, call: EngineCall) -> Result<Value> {
        debug!("engine: {}", call.method());
        self.metrics.rpc_calls.increment();
        let result = self.inner.execute(call).await;
        if result.is_err() {
            self.metrics.rpc_errors.increment();
        }
        result
    }
}
