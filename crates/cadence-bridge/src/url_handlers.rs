//! Process-wide URL protocol handler table.
//!
//! A resolver can claim a URL scheme (`spotify`, `bandcamp`, ...) so links
//! with that scheme are routed to one of its script functions. The table is
//! shared by all resolvers in the process; a later registration for the
//! same scheme replaces the earlier one.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::BridgeError;
use crate::lock;

/// Script function that handles one URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlHandler {
    pub resolver_id: String,
    pub function: String,
}

#[derive(Debug, Default)]
pub struct UrlHandlerTable {
    handlers: Mutex<HashMap<String, UrlHandler>>,
}

/// Normalize a protocol to a bare lowercase scheme (`"Spotify://"` → `"spotify"`).
pub fn normalize_protocol(protocol: &str) -> Result<String, BridgeError> {
    let trimmed = protocol.trim();
    let bare = trimmed
        .strip_suffix("://")
        .or_else(|| trimmed.strip_suffix(':'))
        .unwrap_or(trimmed);
    let scheme = bare.to_ascii_lowercase();

    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid {
        return Err(BridgeError::InvalidArguments(format!(
            "not a valid URL scheme: '{protocol}'"
        )));
    }
    Ok(scheme)
}

impl UrlHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `protocol` to `function` of `resolver_id`.
    pub fn register(
        &self,
        protocol: &str,
        resolver_id: &str,
        function: &str,
    ) -> Result<(), BridgeError> {
        let scheme = normalize_protocol(protocol)?;
        if function.trim().is_empty() {
            return Err(BridgeError::InvalidArguments(
                "URL handler function name must not be empty".into(),
            ));
        }

        let handler = UrlHandler {
            resolver_id: resolver_id.to_string(),
            function: function.to_string(),
        };
        let previous = lock(&self.handlers).insert(scheme.clone(), handler);
        match previous {
            Some(prev) if prev.resolver_id != resolver_id => tracing::info!(
                scheme = %scheme,
                previous = %prev.resolver_id,
                resolver = %resolver_id,
                "URL handler taken over by another resolver"
            ),
            _ => tracing::debug!(scheme = %scheme, resolver = %resolver_id, "URL handler registered"),
        }
        Ok(())
    }

    /// Handler for the scheme of `url`, if one is registered.
    pub fn lookup(&self, url: &str) -> Option<UrlHandler> {
        let scheme = match url::Url::parse(url) {
            Ok(parsed) => parsed.scheme().to_string(),
            Err(_) => normalize_protocol(url.split(':').next()?).ok()?,
        };
        lock(&self.handlers).get(&scheme).cloned()
    }

    /// Drop every scheme owned by `resolver_id`. Returns how many were removed.
    pub fn unregister_resolver(&self, resolver_id: &str) -> usize {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|_, h| h.resolver_id != resolver_id);
        before - handlers.len()
    }

    /// Schemes currently owned by `resolver_id`, sorted.
    pub fn schemes_for(&self, resolver_id: &str) -> Vec<String> {
        let mut schemes: Vec<String> = lock(&self.handlers)
            .iter()
            .filter(|(_, h)| h.resolver_id == resolver_id)
            .map(|(s, _)| s.clone())
            .collect();
        schemes.sort();
        schemes
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
