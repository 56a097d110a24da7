//! Resolver registry: loads resolver packages and routes native calls.
//!
//! The registry owns every loaded resolver. For each one it assembles the
//! control surface, storage namespace, fuzzy index, HTTP relay, callback
//! registry and gateway, then hands the script engine to a dedicated script
//! thread. It also owns the process-wide URL handler table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::callbacks::CallbackRegistry;
use crate::config::BridgeConfig;
use crate::engine::{ScriptEngine, ScriptThread, ScriptThreadHandle};
use crate::error::BridgeError;
use crate::fuzzy::FuzzyIndexService;
use crate::gateway::{Gateway, GatewayParts};
use crate::manifest::{ResolverManifest, MANIFEST_FILE};
use crate::relay::RequestRelay;
use crate::resolver::ResolverSurface;
use crate::sandbox::{SandboxConfig, WasmScriptEngine};
use crate::storage::KeyValueStore;
use crate::url_handlers::UrlHandlerTable;

/// Script export run once after a resolver is attached.
pub const INIT_FUNCTION: &str = "init";

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding one sub-directory per resolver package.
    pub resolver_dir: PathBuf,
    pub bridge: BridgeConfig,
    pub sandbox: SandboxConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resolver_dir: PathBuf::from("/data/resolvers"),
            bridge: BridgeConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            resolver_dir: std::env::var("RESOLVER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data/resolvers")),
            bridge: BridgeConfig::from_env(),
            sandbox: SandboxConfig::from_env(),
        }
    }
}

// ─── Loaded resolver entry ──────────────────────────────────────────────

struct LoadedResolver {
    surface: Arc<ResolverSurface>,
    gateway: Arc<Gateway>,
    script: ScriptThreadHandle,
    thread: ScriptThread,
    call_timeout: Duration,
}

// ─── Registry ───────────────────────────────────────────────────────────

pub struct ResolverRegistry {
    resolvers: RwLock<HashMap<String, LoadedResolver>>,
    url_handlers: Arc<UrlHandlerTable>,
    config: RegistryConfig,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("resolver_dir", &self.config.resolver_dir)
            .field("url_handlers", &self.url_handlers.len())
            .finish_non_exhaustive()
    }
}

impl ResolverRegistry {
    /// Create an empty registry. Must be called from within a tokio runtime;
    /// relays and sweepers are spawned on it.
    pub fn new(config: RegistryConfig) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Engine(format!("no tokio runtime: {e}")))?;
        Ok(Self {
            resolvers: RwLock::new(HashMap::new()),
            url_handlers: Arc::new(UrlHandlerTable::new()),
            config,
            runtime,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn url_handlers(&self) -> &Arc<UrlHandlerTable> {
        &self.url_handlers
    }

    /// Load every package under the resolver directory. Failures are logged
    /// per package. Returns the ids that loaded.
    pub async fn load_all(&self) -> Vec<String> {
        let dir = &self.config.resolver_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(dir = %dir.display(), "cannot read resolver directory: {e}");
                return Vec::new();
            }
        };

        let mut packages = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.join(MANIFEST_FILE).is_file() {
                        packages.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(dir = %dir.display(), "error while listing resolvers: {e}");
                    break;
                }
            }
        }
        packages.sort();

        let mut loaded = Vec::new();
        for package in packages {
            match self.load_from_dir(&package).await {
                Ok(id) => loaded.push(id),
                Err(e) => tracing::error!(
                    package = %package.display(),
                    "failed to load resolver: {e}"
                ),
            }
        }
        tracing::info!(count = loaded.len(), "resolvers loaded");
        loaded
    }

    /// Load one resolver package (`resolver.toml` + WASM module) and run
    /// its `init` export.
    pub async fn load_from_dir(&self, dir: &Path) -> Result<String, BridgeError> {
        let manifest = ResolverManifest::from_dir(dir).await?;
        let wasm_path = dir.join(&manifest.build.wasm);
        let id = manifest.resolver.name.clone();

        let sandbox_config = self.config.sandbox.clone();
        let engine_id = id.clone();
        let engine = tokio::task::spawn_blocking(move || {
            WasmScriptEngine::load(&wasm_path, sandbox_config, &engine_id)
        })
        .await
        .map_err(|e| BridgeError::Sandbox(format!("module load task failed: {e}")))??;

        let surface = ResolverSurface::new(
            &id,
            &manifest.resolver.name,
            dir.join(&manifest.build.wasm).to_string_lossy(),
            manifest.config_json()?,
            manifest.capabilities.flags(),
        );
        let timeout = manifest.resolver.timeout_secs.map(Duration::from_secs);
        self.attach(surface, Box::new(engine), timeout).await?;

        if let Err(e) = self.init(&id).await {
            let _ = self.unload(&id).await;
            return Err(e);
        }
        tracing::info!(
            resolver = %id,
            version = %manifest.resolver.version,
            "resolver loaded"
        );
        Ok(id)
    }

    /// Wire `surface` to its native services and start its script thread.
    /// `call_timeout` overrides the configured native call timeout.
    pub async fn attach(
        &self,
        surface: ResolverSurface,
        engine: Box<dyn ScriptEngine>,
        call_timeout: Option<Duration>,
    ) -> Result<Arc<ResolverSurface>, BridgeError> {
        let id = surface.id().to_string();
        let mut resolvers = self.resolvers.write().await;
        if resolvers.contains_key(&id) {
            return Err(BridgeError::AlreadyLoaded(id));
        }

        let bridge = &self.config.bridge;
        let surface = Arc::new(surface);
        let store = KeyValueStore::open(&bridge.storage_root, &id)?;
        let relay = RequestRelay::new(&id, bridge, self.runtime.clone())?;
        let (script, rx) = ScriptThreadHandle::channel(&id);
        let callbacks = CallbackRegistry::new(&id, script.clone());
        callbacks.spawn_sweeper(&self.runtime, bridge.callback_ttl());

        let gateway = Arc::new(Gateway::new(GatewayParts {
            resolver: Arc::clone(&surface),
            store,
            fuzzy: FuzzyIndexService::new(&id, surface.has_fuzzy_index()),
            relay,
            callbacks,
            url_handlers: Arc::clone(&self.url_handlers),
        })?);
        let thread = ScriptThread::spawn(&id, rx, engine, Arc::clone(&gateway))?;

        tracing::debug!(resolver = %id, instance = %surface.instance(), "resolver attached");
        resolvers.insert(
            id,
            LoadedResolver {
                surface: Arc::clone(&surface),
                gateway,
                script,
                thread,
                call_timeout: call_timeout.unwrap_or_else(|| bridge.call_timeout()),
            },
        );
        Ok(surface)
    }

    /// Run the `init` export with the resolver descriptor as input.
    pub async fn init(&self, id: &str) -> Result<(), BridgeError> {
        let descriptor = self
            .gateway(id)
            .await
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))?
            .descriptor();
        self.run(id, INIT_FUNCTION, descriptor).await
    }

    /// Run script function `function` and wait until it returned.
    pub async fn run(&self, id: &str, function: &str, input: String) -> Result<(), BridgeError> {
        let (script, timeout) = {
            let resolvers = self.resolvers.read().await;
            let loaded = resolvers
                .get(id)
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
            (loaded.script.clone(), loaded.call_timeout)
        };

        let done = script.call(function, input)?;
        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Engine(format!(
                "script thread for {id} stopped during {function}"
            ))),
            Err(_) => Err(BridgeError::Timeout(format!("{id}.{function}"))),
        }
    }

    /// Call script function `function` and wait for its `callbackToNative`
    /// answer. The script receives `{"callId", "args"}`.
    pub async fn call(
        &self,
        id: &str,
        function: &str,
        args: serde_json::Value,
    ) -> Result<Option<String>, BridgeError> {
        let (surface, script, timeout) = {
            let resolvers = self.resolvers.read().await;
            let loaded = resolvers
                .get(id)
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
            (
                Arc::clone(&loaded.surface),
                loaded.script.clone(),
                loaded.call_timeout,
            )
        };

        let calls = surface.native_calls();
        let (call_id, answer) = calls.register();
        let input = serde_json::json!({ "callId": call_id, "args": args }).to_string();
        if let Err(e) = script.post(function, input) {
            calls.cancel(call_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(BridgeError::Engine(format!(
                "call {call_id} to {id}.{function} was dropped"
            ))),
            Err(_) => {
                calls.cancel(call_id);
                Err(BridgeError::Timeout(format!("{id}.{function}")))
            }
        }
    }

    /// Hand `url` to the resolver that registered its scheme.
    pub async fn route_url(&self, url: &str) -> Result<Option<String>, BridgeError> {
        let handler = self
            .url_handlers
            .lookup(url)
            .ok_or_else(|| BridgeError::NotFound(format!("no URL handler for '{url}'")))?;
        self.call(
            &handler.resolver_id,
            &handler.function,
            serde_json::json!([url]),
        )
        .await
    }

    /// Stop a resolver: its URL handlers go, its script thread drains and
    /// exits.
    pub async fn unload(&self, id: &str) -> Result<(), BridgeError> {
        let loaded = self
            .resolvers
            .write()
            .await
            .remove(id)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;

        let removed = self.url_handlers.unregister_resolver(id);
        if let Err(e) = loaded.script.shutdown() {
            tracing::warn!(resolver = %id, "script thread already gone: {e}");
        }
        drop(loaded.gateway);
        tokio::task::spawn_blocking(move || loaded.thread.join())
            .await
            .map_err(|e| BridgeError::Engine(format!("join task failed: {e}")))??;

        tracing::info!(resolver = %id, url_handlers = removed, "resolver unloaded");
        Ok(())
    }

    pub async fn unload_all(&self) {
        for id in self.loaded_ids().await {
            if let Err(e) = self.unload(&id).await {
                tracing::error!(resolver = %id, "failed to unload resolver: {e}");
            }
        }
    }

    /// Ids of loaded resolvers, sorted.
    pub async fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.resolvers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.resolvers.read().await.contains_key(id)
    }

    pub async fn surface(&self, id: &str) -> Option<Arc<ResolverSurface>> {
        self.resolvers
            .read()
            .await
            .get(id)
            .map(|l| Arc::clone(&l.surface))
    }

    pub async fn gateway(&self, id: &str) -> Option<Arc<Gateway>> {
        self.resolvers
            .read()
            .await
            .get(id)
            .map(|l| Arc::clone(&l.gateway))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
