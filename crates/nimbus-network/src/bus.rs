use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A request on the bus, identified by method name and arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub args: serde_json::Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Message-bus contract: awaited request/reply and fire-and-forget
#[async_trait]
pub trait Bus: Send + Sync {
    /// Send a request to a topic and wait for the reply
    async fn call(&self, topic: &str, request: RpcRequest) -> Result<serde_json::Value>;

    /// Send a request to a topic without waiting
    async fn cast(&self, topic: &str, request: RpcRequest) -> Result<()>;
}

/// Handler serving one topic
pub type BusHandler =
    Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// In-process bus routing topics to registered handlers.
///
/// Stands in for the message-bus runtime when every host lives in one
/// process (tests, the reference binary).
pub struct InProcessBus {
    handlers: RwLock<HashMap<String, BusHandler>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a handler to a topic, replacing any previous one
    pub fn register(&self, topic: impl Into<String>, handler: BusHandler) {
        self.handlers.write().unwrap().insert(topic.into(), handler);
    }

    fn handler_for(&self, topic: &str) -> Result<BusHandler> {
        self.handlers
            .read()
            .unwrap()
            .get(topic)
            .cloned()
            .ok_or_else(|| NetworkError::bus(format!("no handler registered for topic '{}'", topic)))
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn call(&self, topic: &str, request: RpcRequest) -> Result<serde_json::Value> {
        let handler = self.handler_for(topic)?;
        handler(request).await
    }

    async fn cast(&self, topic: &str, request: RpcRequest) -> Result<()> {
        let handler = self.handler_for(topic)?;
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(e) = handler(request).await {
                warn!("cast to topic '{}' failed: {}", topic, e);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_handler() -> BusHandler {
        Arc::new(|request: RpcRequest| {
            Box::pin(async move { Ok(json!({"method": request.method, "args": request.args})) })
        })
    }

    #[tokio::test]
    async fn test_call_reaches_registered_handler() {
        let bus = InProcessBus::new();
        bus.register("network.host-a", echo_handler());

        let reply = bus
            .call(
                "network.host-a",
                RpcRequest::new("allocate_fixed_ip", json!({"network_id": 1})),
            )
            .await
            .unwrap();
        assert_eq!(reply["method"], "allocate_fixed_ip");
        assert_eq!(reply["args"]["network_id"], 1);
    }

    #[tokio::test]
    async fn test_call_unknown_topic_fails() {
        let bus = InProcessBus::new();
        let err = bus
            .call("network.ghost", RpcRequest::new("noop", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Bus { .. }));
    }

    #[tokio::test]
    async fn test_cast_runs_handler() {
        let bus = InProcessBus::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let tx = std::sync::Mutex::new(Some(tx));
        bus.register(
            "network.host-a",
            Arc::new(move |request: RpcRequest| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(request.method.clone());
                }
                Box::pin(async move { Ok(serde_json::Value::Null) })
            }),
        );

        bus.cast("network.host-a", RpcRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), "ping");
    }
}
