// Shared helpers for bridge integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use cadence_bridge::{
    BridgeError, BridgeValue, CallbackInvocation, CapabilityFlags, Gateway, RegistryConfig,
    ResolverRegistry, ResolverSurface, ScriptEngine,
};
use serde_json::Value;
use tokio::sync::mpsc;

/// A callback as it arrived at the script side.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub invocation: CallbackInvocation,
    pub thread: Option<String>,
}

/// Test engine: a function's input is a JSON list of `{method, args}`
/// bridge calls, which are dispatched in order and their results recorded.
/// Callback deliveries are forwarded to the test.
pub struct ScriptedEngine {
    results: Arc<Mutex<Vec<BridgeValue>>>,
    delivered: mpsc::UnboundedSender<Delivered>,
}

impl ScriptEngine for ScriptedEngine {
    fn call_function(
        &mut self,
        _function: &str,
        input: &str,
        gateway: &Gateway,
    ) -> Result<(), BridgeError> {
        let Ok(Value::Array(calls)) = serde_json::from_str::<Value>(input) else {
            return Ok(());
        };
        for call in calls {
            let method = call["method"].as_str().unwrap_or_default();
            let args = call["args"].as_array().cloned().unwrap_or_default();
            let value = gateway.dispatch(method, &args);
            self.results.lock().unwrap().push(value);
        }
        Ok(())
    }

    fn deliver_callback(
        &mut self,
        invocation: &CallbackInvocation,
        _gateway: &Gateway,
    ) -> Result<(), BridgeError> {
        let _ = self.delivered.send(Delivered {
            invocation: invocation.clone(),
            thread: std::thread::current().name().map(str::to_owned),
        });
        Ok(())
    }
}

/// One resolver driven by a [`ScriptedEngine`].
pub struct Scripted {
    pub id: String,
    pub results: Arc<Mutex<Vec<BridgeValue>>>,
    pub delivered: mpsc::UnboundedReceiver<Delivered>,
}

pub fn registry_at(root: &Path) -> ResolverRegistry {
    let mut config = RegistryConfig::default();
    config.resolver_dir = root.join("packages");
    config.bridge.storage_root = root.join("storage");
    ResolverRegistry::new(config).expect("registry must be created inside a runtime")
}

pub async fn attach_scripted(
    registry: &ResolverRegistry,
    id: &str,
    declared: CapabilityFlags,
) -> Scripted {
    let results = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    let surface = ResolverSurface::new(id, id, format!("{id}/resolver.wasm"), Default::default(), declared);
    registry
        .attach(
            surface,
            Box::new(ScriptedEngine {
                results: Arc::clone(&results),
                delivered: tx,
            }),
            None,
        )
        .await
        .expect("attach failed");
    Scripted {
        id: id.to_string(),
        results,
        delivered: rx,
    }
}

impl Scripted {
    /// Run `calls` on the script thread and return their results.
    pub async fn run(&self, registry: &ResolverRegistry, calls: Value) -> Vec<BridgeValue> {
        registry
            .run(&self.id, "test", calls.to_string())
            .await
            .expect("script run failed");
        std::mem::take(&mut *self.results.lock().unwrap())
    }

    /// Wait for the next callback delivery.
    pub async fn next_delivery(&mut self) -> Delivered {
        tokio::time::timeout(std::time::Duration::from_secs(10), self.delivered.recv())
            .await
            .expect("no callback delivered in time")
            .expect("engine dropped")
    }

    /// Assert nothing else is delivered within a short grace period.
    pub async fn assert_no_more_deliveries(&mut self) {
        let extra =
            tokio::time::timeout(std::time::Duration::from_millis(200), self.delivered.recv()).await;
        assert!(
            !matches!(extra, Ok(Some(_))),
            "unexpected extra callback: {extra:?}"
        );
    }
}

pub fn call(method: &str, args: Value) -> Value {
    serde_json::json!({ "method": method, "args": args })
}
