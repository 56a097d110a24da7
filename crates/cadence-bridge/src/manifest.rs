//! Resolver manifest parsing and validation.
//!
//! Parses the `resolver.toml` file shipped with every resolver package. It
//! declares metadata, the WASM module, static capabilities, and the config
//! table that becomes the descriptor's `config`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::resolver::CapabilityFlags;

/// File name of the manifest inside a resolver package.
pub const MANIFEST_FILE: &str = "resolver.toml";

/// Resolver manifest parsed from `resolver.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverManifest {
    pub resolver: ResolverMeta,
    pub build: BuildConfig,
    #[serde(default)]
    pub capabilities: CapabilityConfig,
    /// Free-form settings handed to the script through the descriptor.
    #[serde(default)]
    pub config: toml::Table,
}

/// Resolver metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverMeta {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    /// Per-resolver override of the native → script call timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub wasm: String,
}

/// Capabilities known before the script runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default)]
    pub browsable: bool,
    #[serde(default)]
    pub fuzzy_index: bool,
    #[serde(default)]
    pub playlist_sync: bool,
    #[serde(default)]
    pub url_lookup: bool,
}

impl CapabilityConfig {
    pub fn flags(&self) -> CapabilityFlags {
        [
            (self.browsable, CapabilityFlags::BROWSABLE),
            (self.fuzzy_index, CapabilityFlags::FUZZY_INDEX),
            (self.playlist_sync, CapabilityFlags::PLAYLIST_SYNC),
            (self.url_lookup, CapabilityFlags::URL_LOOKUP),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(CapabilityFlags::NONE, |acc, (_, flag)| acc.union(flag))
    }
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a resolver name against `^[a-z][a-z0-9-]{1,63}$`.
fn validate_resolver_name(name: &str) -> Result<(), BridgeError> {
    let len = name.len();
    if !(2..=64).contains(&len) {
        return Err(BridgeError::InvalidManifest(format!(
            "resolver name must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next().filter(|c| !c.is_ascii_lowercase()) {
        return Err(BridgeError::InvalidManifest(format!(
            "resolver name must start with a lowercase letter, got '{first}'"
        )));
    }

    if let Some(ch) = chars.find(|ch| !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && *ch != '-')
    {
        return Err(BridgeError::InvalidManifest(format!(
            "resolver name contains invalid character '{ch}'"
        )));
    }

    Ok(())
}

/// Validate that a path is relative and has no `..` components.
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), BridgeError> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(BridgeError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(BridgeError::InvalidManifest(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    Ok(())
}

impl ResolverManifest {
    /// Parse a manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, BridgeError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        validate_resolver_name(&self.resolver.name)?;

        semver::Version::parse(&self.resolver.version).map_err(|_| {
            BridgeError::InvalidManifest(format!(
                "resolver.version is not valid semver: '{}'",
                self.resolver.version
            ))
        })?;

        let desc_len = self.resolver.description.len();
        if desc_len == 0 || desc_len > 500 {
            return Err(BridgeError::InvalidManifest(format!(
                "resolver.description must be 1-500 characters, got {desc_len}"
            )));
        }

        if let Some(ref author) = self.resolver.author {
            let len = author.len();
            if len == 0 || len > 255 {
                return Err(BridgeError::InvalidManifest(format!(
                    "resolver.author must be 1-255 characters, got {len}"
                )));
            }
        }

        if let Some(ref homepage) = self.resolver.homepage {
            url::Url::parse(homepage).map_err(|e| {
                BridgeError::InvalidManifest(format!("resolver.homepage is not a URL: {e}"))
            })?;
        }

        if let Some(timeout) = self.resolver.timeout_secs.filter(|t| !(1..=300).contains(t)) {
            return Err(BridgeError::InvalidManifest(format!(
                "resolver.timeout_secs must be 1-300, got {timeout}"
            )));
        }

        validate_path_safety(&self.build.wasm, "build.wasm")?;
        if !self.build.wasm.ends_with(".wasm") {
            return Err(BridgeError::InvalidManifest(format!(
                "build.wasm must end with '.wasm', got '{}'",
                self.build.wasm
            )));
        }

        Ok(())
    }

    pub fn parse_and_validate(toml_str: &str) -> Result<Self, BridgeError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and validate `resolver.toml` from a package directory.
    pub async fn from_dir(dir: &Path) -> Result<Self, BridgeError> {
        let path = dir.join(MANIFEST_FILE);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            BridgeError::Manifest(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse_and_validate(&content)
    }

    /// The `[config]` table as a JSON object.
    pub fn config_json(&self) -> Result<serde_json::Map<String, serde_json::Value>, BridgeError> {
        match serde_json::to_value(&self.config)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(BridgeError::Manifest(format!(
                "config table did not serialize to an object: {other}"
            ))),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
