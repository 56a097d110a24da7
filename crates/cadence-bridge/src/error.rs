//! Bridge error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("capability missing: {0}")]
    CapabilityMissing(String),

    #[error("fuzzy index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("unknown bridge method: {0}")]
    UnknownMethod(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("method registration error: {0}")]
    Registration(String),

    #[error("script engine error: {0}")]
    Engine(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("execution timeout: resolver {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: resolver {0}")]
    MemoryExceeded(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),

    #[error("resolver not found: {0}")]
    NotFound(String),

    #[error("resolver already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("timed out: {0}")]
    Timeout(String),
}
