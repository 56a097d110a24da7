//! Cadence resolver bridge
//!
//! Connects the native audio host to sandboxed script resolvers. Resolvers
//! run inside a WASM sandbox (Extism) on a dedicated script thread and reach
//! native services through one method [`Gateway`]: persistent key/value
//! storage, an async HTTP relay with callback correlation, an optional fuzzy
//! search index, and the resolver control surface (descriptor, results,
//! capabilities, stream URLs, URL handlers).

pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod fuzzy;
pub mod gateway;
pub mod manifest;
pub mod playlist;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod sandbox;
pub mod storage;
pub mod url_handlers;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use callbacks::{
    CallbackHandle, CallbackInvocation, CallbackOutcome, CallbackRegistry, HttpReply,
    NativeCallTable, PendingCall,
};
pub use config::BridgeConfig;
pub use engine::{EngineMessage, ScriptEngine, ScriptThread, ScriptThreadHandle};
pub use error::BridgeError;
pub use fuzzy::{FuzzyIndexEntry, FuzzyIndexService, FuzzyMatcher, FuzzyQuery, TermMatcher};
pub use gateway::{ArgKind, BridgeValue, Gateway, GatewayParts, MethodTable};
pub use manifest::ResolverManifest;
pub use playlist::{Playlist, Track};
pub use registry::{RegistryConfig, ResolverRegistry};
pub use relay::{HttpRequest, RequestOptions, RequestRelay};
pub use resolver::{
    CapabilityFlags, ResolverDescriptor, ResolverEvent, ResolverEventKind, ResolverSurface,
    ResultKind, StreamUrl,
};
pub use sandbox::{PluginSandbox, SandboxConfig, WasmScriptEngine};
pub use storage::KeyValueStore;
pub use url_handlers::{UrlHandler, UrlHandlerTable};

// A panic while holding one of these locks leaves plain data behind, never a
// half-applied invariant, so poisoned guards are recovered.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
