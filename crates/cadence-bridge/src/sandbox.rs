//! WASM resolver sandbox using Extism (wasmtime).
//!
//! Each resolver runs in its own isolated WASM sandbox with configurable
//! memory limits and fuel-based execution limits. [`WasmScriptEngine`] speaks
//! the bridge protocol on top of it:
//!
//! - an export returns `{"bridge_calls": [{"method", "args", "reply_to"?}]}`;
//! - each call is dispatched through the gateway in order;
//! - when `reply_to` is set, the result goes back through the
//!   `bridge_reply` export as `{"id", "value"}`, which may in turn emit more
//!   calls;
//! - completed async requests are delivered through `bridge_callback`.

use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::callbacks::CallbackInvocation;
use crate::engine::ScriptEngine;
use crate::error::BridgeError;
use crate::gateway::{BridgeValue, Gateway};

/// Export that receives replies to bridge calls.
pub const REPLY_EXPORT: &str = "bridge_reply";
/// Export that receives async callback invocations.
pub const CALLBACK_EXPORT: &str = "bridge_callback";
/// Upper bound on export invocations triggered by one message.
pub const MAX_CALL_ROUNDS: usize = 64;

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per execution (default: 1_000_000).
    pub fuel_limit: u64,
    /// Whether to enable WASI (default: false).
    /// When false, resolvers cannot access env vars, filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            wasi_enabled: std::env::var("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// A loaded WASM resolver module.
pub struct PluginSandbox {
    plugin: extism::Plugin,
    config: SandboxConfig,
    resolver: String,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn classify_call_error(resolver: &str, message: String) -> BridgeError {
    if message.contains("fuel") {
        BridgeError::FuelExhausted(resolver.to_string())
    } else if message.contains("memory") {
        BridgeError::MemoryExceeded(resolver.to_string())
    } else {
        BridgeError::Sandbox(message)
    }
}

impl PluginSandbox {
    /// Load a WASM module from disk. Memory is limited in 64 KB pages.
    pub fn load(wasm_path: &Path, config: SandboxConfig, name: &str) -> Result<Self, BridgeError> {
        let wasm_bytes = std::fs::read(wasm_path)?;

        let manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((config.memory_limit / 65536) as u32);

        let builder = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit);

        if config.wasi_enabled {
            tracing::warn!(
                resolver = %name,
                "WASI enabled for resolver, it can read environment variables"
            );
        }

        let plugin = builder
            .build()
            .map_err(|e| BridgeError::Sandbox(e.to_string()))?;

        Ok(Self {
            plugin,
            config,
            resolver: name.to_string(),
        })
    }

    /// Call an export with raw bytes. Each call gets a fresh fuel budget.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, BridgeError> {
        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| classify_call_error(&self.resolver, e.to_string()))
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.plugin.function_exists(name)
    }

    pub fn name(&self) -> &str {
        &self.resolver
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

// ─── Bridge protocol ────────────────────────────────────────────────────

/// One gateway call requested by script code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub reply_to: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ScriptOutput {
    #[serde(default)]
    bridge_calls: Vec<BridgeCall>,
}

#[derive(Serialize)]
struct Reply<'a> {
    id: i64,
    value: &'a BridgeValue,
}

/// Bridge calls in an export's output. Empty output means none; anything
/// that isn't the expected shape is logged and treated as none.
pub fn parse_bridge_calls(resolver: &str, output: &[u8]) -> Vec<BridgeCall> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Vec::new();
    }
    match serde_json::from_slice::<ScriptOutput>(output) {
        Ok(out) => out.bridge_calls,
        Err(e) => {
            tracing::warn!(resolver = %resolver, "ignoring malformed script output: {e}");
            Vec::new()
        }
    }
}

/// [`ScriptEngine`] backed by an Extism sandbox.
#[derive(Debug)]
pub struct WasmScriptEngine {
    sandbox: PluginSandbox,
}

impl WasmScriptEngine {
    pub fn new(sandbox: PluginSandbox) -> Self {
        Self { sandbox }
    }

    pub fn load(wasm_path: &Path, config: SandboxConfig, name: &str) -> Result<Self, BridgeError> {
        PluginSandbox::load(wasm_path, config, name).map(Self::new)
    }

    fn run(&mut self, function: &str, input: Vec<u8>, gateway: &Gateway) -> Result<(), BridgeError> {
        let mut queue = VecDeque::from([(function.to_string(), input)]);
        let mut rounds = 0;

        while let Some((export, input)) = queue.pop_front() {
            rounds += 1;
            if rounds > MAX_CALL_ROUNDS {
                return Err(BridgeError::Engine(format!(
                    "resolver {} exceeded {MAX_CALL_ROUNDS} call rounds from '{function}'",
                    self.sandbox.name()
                )));
            }

            let output = self.sandbox.call(&export, &input)?;
            for call in parse_bridge_calls(self.sandbox.name(), &output) {
                let value = gateway.dispatch(&call.method, &call.args);
                let Some(id) = call.reply_to else {
                    continue;
                };
                if !self.sandbox.has_function(REPLY_EXPORT) {
                    tracing::warn!(
                        resolver = %self.sandbox.name(),
                        method = %call.method,
                        "reply requested but module has no {REPLY_EXPORT} export"
                    );
                    continue;
                }
                let reply = serde_json::to_vec(&Reply { id, value: &value })?;
                queue.push_back((REPLY_EXPORT.to_string(), reply));
            }
        }
        Ok(())
    }
}

impl ScriptEngine for WasmScriptEngine {
    fn call_function(
        &mut self,
        function: &str,
        input: &str,
        gateway: &Gateway,
    ) -> Result<(), BridgeError> {
        if !self.sandbox.has_function(function) {
            return Err(BridgeError::Engine(format!(
                "resolver {} has no export '{function}'",
                self.sandbox.name()
            )));
        }
        self.run(function, input.as_bytes().to_vec(), gateway)
    }

    fn deliver_callback(
        &mut self,
        invocation: &CallbackInvocation,
        gateway: &Gateway,
    ) -> Result<(), BridgeError> {
        if !self.sandbox.has_function(CALLBACK_EXPORT) {
            return Err(BridgeError::Engine(format!(
                "resolver {} has no {CALLBACK_EXPORT} export",
                self.sandbox.name()
            )));
        }
        let input = serde_json::to_vec(invocation)?;
        self.run(CALLBACK_EXPORT, input, gateway)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
