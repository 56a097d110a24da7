//! Bridge Gateway: the single method surface a resolver script can call.
//!
//! Every wire method takes and returns primitives only. Methods live in an
//! explicit [`MethodTable`] that maps a name to its argument signature and a
//! handler; [`Gateway::dispatch`] checks the arguments against the signature
//! before calling the handler.
//!
//! The gateway is also the fault boundary. Native errors (bad JSON, I/O
//! failures, a missing index) are logged here with the operation name and
//! turned into a benign return value, so the script only ever sees `null`,
//! empty strings or empty lists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::callbacks::{CallbackHandle, CallbackRegistry};
use crate::error::BridgeError;
use crate::fuzzy::{FuzzyIndexEntry, FuzzyIndexService, FuzzyQuery};
use crate::lock;
use crate::relay::{self, RequestRelay};
use crate::resolver::{CapabilityFlags, ResolverSurface, ResultKind};
use crate::storage::KeyValueStore;
use crate::url_handlers::UrlHandlerTable;

static NULL: serde_json::Value = serde_json::Value::Null;

/// Maximum log message length accepted from a resolver.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Strip control characters (except newline and tab) and cap the length.
fn sanitize_log_message(message: &str) -> String {
    let mut kept = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t');
    let cleaned: String = kept.by_ref().take(MAX_LOG_MESSAGE_LEN).collect();
    if kept.next().is_some() {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

// ─── Wire values ────────────────────────────────────────────────────────

/// Return value of a bridge method.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgeValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Option<String>>),
}

impl From<Option<String>> for BridgeValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(BridgeValue::Null, BridgeValue::Str)
    }
}

/// Primitive kind of one argument in a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    OptStr,
    Int,
    OptInt,
    Bool,
}

impl ArgKind {
    fn name(self) -> &'static str {
        match self {
            ArgKind::Str => "string",
            ArgKind::OptStr => "string or null",
            ArgKind::Int => "integer",
            ArgKind::OptInt => "integer or null",
            ArgKind::Bool => "boolean",
        }
    }

    fn coerce(self, value: &serde_json::Value) -> Option<Arg> {
        use serde_json::Value;
        match (self, value) {
            (ArgKind::Str, Value::String(s)) => Some(Arg::Str(Some(s.clone()))),
            (ArgKind::OptStr, Value::String(s)) => Some(Arg::Str(Some(s.clone()))),
            (ArgKind::OptStr, Value::Null) => Some(Arg::Str(None)),
            (ArgKind::Int | ArgKind::OptInt, Value::Number(n)) => integer(n).map(|i| Arg::Int(Some(i))),
            (ArgKind::OptInt, Value::Null) => Some(Arg::Int(None)),
            (ArgKind::Bool, Value::Bool(b)) => Some(Arg::Bool(*b)),
            _ => None,
        }
    }

    fn is_optional(self) -> bool {
        matches!(self, ArgKind::OptStr | ArgKind::OptInt)
    }
}

/// Script numbers may arrive as whole floats (`3.0`).
fn integer(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Str(Option<String>),
    Int(Option<i64>),
    Bool(bool),
}

/// Arguments checked against a method signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Args(Vec<Arg>);

impl Args {
    pub fn str(&self, i: usize) -> &str {
        self.opt_str(i).unwrap_or_default()
    }

    pub fn opt_str(&self, i: usize) -> Option<&str> {
        match self.0.get(i) {
            Some(Arg::Str(s)) => s.as_deref(),
            _ => None,
        }
    }

    pub fn int(&self, i: usize) -> i64 {
        self.opt_int(i).unwrap_or_default()
    }

    pub fn opt_int(&self, i: usize) -> Option<i64> {
        match self.0.get(i) {
            Some(Arg::Int(n)) => *n,
            _ => None,
        }
    }

    pub fn bool(&self, i: usize) -> bool {
        matches!(self.0.get(i), Some(Arg::Bool(true)))
    }
}

// ─── Method table ───────────────────────────────────────────────────────

pub type Handler = fn(&Gateway, &Args) -> BridgeValue;

struct MethodEntry {
    signature: &'static [ArgKind],
    handler: Handler,
}

/// Name → (signature, handler) registration table.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<&'static str, MethodEntry>,
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        signature: &'static [ArgKind],
        handler: Handler,
    ) -> Result<(), BridgeError> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BridgeError::Registration(format!(
                "invalid method name: '{name}'"
            )));
        }
        if self.methods.contains_key(name) {
            return Err(BridgeError::Registration(format!(
                "method '{name}' is already registered"
            )));
        }
        self.methods.insert(name, MethodEntry { signature, handler });
        Ok(())
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn check(&self, method: &str, args: &[serde_json::Value]) -> Result<(Handler, Args), BridgeError> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| BridgeError::UnknownMethod(method.to_string()))?;

        if args.len() > entry.signature.len() {
            return Err(BridgeError::InvalidArguments(format!(
                "{method} takes {} arguments, got {}",
                entry.signature.len(),
                args.len()
            )));
        }

        let mut checked = Vec::with_capacity(entry.signature.len());
        for (i, kind) in entry.signature.iter().enumerate() {
            let value = args.get(i).unwrap_or(&NULL);
            if args.get(i).is_none() && !kind.is_optional() {
                return Err(BridgeError::InvalidArguments(format!(
                    "{method}: missing argument {i} ({})",
                    kind.name()
                )));
            }
            let arg = kind.coerce(value).ok_or_else(|| {
                BridgeError::InvalidArguments(format!(
                    "{method}: argument {i} must be {}, got {value}",
                    kind.name()
                ))
            })?;
            checked.push(arg);
        }
        Ok((entry.handler, Args(checked)))
    }

    /// Every method a resolver script can call.
    pub fn standard() -> Result<Self, BridgeError> {
        use ArgKind::*;
        let mut t = Self::new();

        // Control surface
        t.register("descriptor", &[], |gw, _| BridgeValue::Str(gw.descriptor()))?;
        t.register("log", &[Str], |gw, a| {
            gw.log(a.str(0));
            BridgeValue::Null
        })?;
        t.register("deliverResults", &[Str, Str], |gw, a| {
            gw.deliver_results(a.str(0), a.str(1));
            BridgeValue::Null
        })?;
        t.register("reportCapabilities", &[Int], |gw, a| {
            gw.report_capabilities(a.int(0));
            BridgeValue::Null
        })?;
        t.register("reportStreamUrl", &[Str, Str, OptStr], |gw, a| {
            gw.report_stream_url(a.str(0), a.str(1), a.opt_str(2));
            BridgeValue::Null
        })?;
        t.register("registerUrlHandler", &[Str, Str], |gw, a| {
            gw.register_url_handler(a.str(0), a.str(1));
            BridgeValue::Null
        })?;
        t.register("callbackToNative", &[Int, OptStr, Bool], |gw, a| {
            gw.callback_to_native(a.int(0), a.opt_str(1), a.bool(2));
            BridgeValue::Null
        })?;
        t.register("readBase64", &[OptStr], |gw, a| {
            BridgeValue::Str(gw.read_base64(a.opt_str(0).unwrap_or_default()))
        })?;

        // Relay
        t.register(
            "asyncHttpRequest",
            &[Str, OptInt, OptStr, OptStr, OptInt],
            |gw, a| {
                gw.async_http_request(
                    a.str(0),
                    a.opt_int(1),
                    a.opt_str(2),
                    a.opt_str(3),
                    a.opt_int(4),
                );
                BridgeValue::Null
            },
        )?;

        // Fuzzy index
        t.register("hasFuzzyIndex", &[], |gw, _| BridgeValue::Bool(gw.has_fuzzy_index()))?;
        t.register("createFuzzyIndex", &[Str], |gw, a| {
            gw.create_fuzzy_index(a.str(0));
            BridgeValue::Null
        })?;
        t.register("addToFuzzyIndex", &[Str], |gw, a| {
            gw.add_to_fuzzy_index(a.str(0));
            BridgeValue::Null
        })?;
        t.register("search", &[Str], |gw, a| gw.search(a.str(0)).into())?;
        t.register("searchStructured", &[Str, Str, Str], |gw, a| {
            gw.search_structured(a.str(0), a.str(1), a.str(2)).into()
        })?;
        t.register("deleteFuzzyIndex", &[], |gw, _| {
            gw.delete_fuzzy_index();
            BridgeValue::Null
        })?;

        // Key/value store
        t.register("get", &[Str], |gw, a| gw.get(a.str(0)).into())?;
        t.register("set", &[Str, Str], |gw, a| {
            gw.set(a.str(0), a.str(1));
            BridgeValue::Null
        })?;
        t.register("remove", &[Str], |gw, a| {
            gw.remove(a.str(0));
            BridgeValue::Null
        })?;
        t.register("listKeys", &[], |gw, _| {
            BridgeValue::List(gw.list_keys().into_iter().map(Some).collect())
        })?;
        t.register("listValues", &[], |gw, _| BridgeValue::List(gw.list_values()))?;

        Ok(t)
    }
}

// ─── Gateway ────────────────────────────────────────────────────────────

/// Services a gateway is assembled from.
pub struct GatewayParts {
    pub resolver: Arc<ResolverSurface>,
    pub store: KeyValueStore,
    pub fuzzy: FuzzyIndexService,
    pub relay: RequestRelay,
    pub callbacks: Arc<CallbackRegistry>,
    pub url_handlers: Arc<UrlHandlerTable>,
}

pub struct Gateway {
    resolver: Arc<ResolverSurface>,
    store: KeyValueStore,
    fuzzy: FuzzyIndexService,
    relay: RequestRelay,
    callbacks: Arc<CallbackRegistry>,
    url_handlers: Arc<UrlHandlerTable>,
    methods: MethodTable,
    /// (config version, serialized descriptor)
    descriptor_cache: Mutex<Option<(u64, String)>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("resolver", &self.resolver.id())
            .field("store", &self.store)
            .field("fuzzy", &self.fuzzy)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Result<Self, BridgeError> {
        if parts.resolver.has_fuzzy_index() {
            parts.fuzzy.enable();
        }
        Ok(Self {
            resolver: parts.resolver,
            store: parts.store,
            fuzzy: parts.fuzzy,
            relay: parts.relay,
            callbacks: parts.callbacks,
            url_handlers: parts.url_handlers,
            methods: MethodTable::standard()?,
            descriptor_cache: Mutex::new(None),
        })
    }

    pub fn resolver(&self) -> &Arc<ResolverSurface> {
        &self.resolver
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub fn fuzzy(&self) -> &FuzzyIndexService {
        &self.fuzzy
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Call wire method `method` with script-supplied `args`.
    ///
    /// Unknown methods and arguments that don't match the signature are
    /// logged and answered with `null`.
    pub fn dispatch(&self, method: &str, args: &[serde_json::Value]) -> BridgeValue {
        match self.methods.check(method, args) {
            Ok((handler, args)) => handler(self, &args),
            Err(e) => {
                tracing::warn!(
                    resolver = %self.resolver.id(),
                    method = %method,
                    "rejected bridge call: {e}"
                );
                BridgeValue::Null
            }
        }
    }

    fn report_failure(&self, operation: &str, err: &BridgeError) {
        match err {
            BridgeError::CapabilityMissing(_) | BridgeError::IndexUnavailable(_) => {
                tracing::warn!(
                    resolver = %self.resolver.id(),
                    operation = %operation,
                    "{err}"
                )
            }
            _ => tracing::error!(
                resolver = %self.resolver.id(),
                operation = %operation,
                "{err}"
            ),
        }
    }

    fn benign<T>(&self, operation: &str, result: Result<T, BridgeError>, fallback: T) -> T {
        result.unwrap_or_else(|e| {
            self.report_failure(operation, &e);
            fallback
        })
    }

    // ─── Control surface ────────────────────────────────────────────────

    /// Serialized descriptor; recomputed only after a config change.
    pub fn descriptor(&self) -> String {
        let version = self.resolver.config_version();
        let mut cache = lock(&self.descriptor_cache);
        if let Some((cached_version, json)) = cache.as_ref() {
            if *cached_version == version {
                return json.clone();
            }
        }
        match serde_json::to_string(&self.resolver.descriptor()) {
            Ok(json) => {
                *cache = Some((version, json.clone()));
                json
            }
            Err(e) => {
                self.report_failure("descriptor", &e.into());
                String::new()
            }
        }
    }

    pub fn log(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::info!(resolver = %self.resolver.name(), "{msg}");
    }

    pub fn deliver_results(&self, kind: &str, payload: &str) {
        match ResultKind::from_wire(kind) {
            Some(kind) => self.resolver.deliver_results(kind, payload),
            None => tracing::warn!(
                resolver = %self.resolver.id(),
                kind = %kind,
                "dropping results for unknown result kind"
            ),
        }
    }

    pub fn report_capabilities(&self, flags: i64) {
        let Ok(bits) = u32::try_from(flags) else {
            tracing::warn!(
                resolver = %self.resolver.id(),
                flags,
                "ignoring out-of-range capability flags"
            );
            return;
        };
        let flags = CapabilityFlags::from_bits(bits);
        if self.resolver.report_capabilities(flags) && flags.contains(CapabilityFlags::FUZZY_INDEX)
        {
            self.fuzzy.enable();
        }
    }

    pub fn report_stream_url(&self, qid: &str, url: &str, headers: Option<&str>) {
        self.resolver.report_stream_url(qid, url, headers);
    }

    pub fn register_url_handler(&self, protocol: &str, function: &str) {
        let result = self
            .url_handlers
            .register(protocol, self.resolver.id(), function);
        self.benign("registerUrlHandler", result, ());
    }

    /// Answer a native call into script code.
    pub fn callback_to_native(&self, id: i64, payload: Option<&str>, should_return_result: bool) {
        let payload = should_return_result
            .then(|| payload.map(str::to_owned))
            .flatten();
        if !self.resolver.native_calls().resolve(id, payload) {
            tracing::warn!(
                resolver = %self.resolver.id(),
                call_id = id,
                "answer for unknown or abandoned native call"
            );
        }
    }

    /// Binary assets are not exposed to resolvers.
    pub fn read_base64(&self, file_name: &str) -> String {
        tracing::debug!(
            resolver = %self.resolver.id(),
            file = %file_name,
            "readBase64 is not supported"
        );
        String::new()
    }

    // ─── Relay ──────────────────────────────────────────────────────────

    /// Start an HTTP request and return immediately. A request that can't be
    /// built is logged and fires neither callback.
    pub fn async_http_request(
        &self,
        url: &str,
        success_callback: Option<i64>,
        extra_headers: Option<&str>,
        options: Option<&str>,
        error_callback: Option<i64>,
    ) {
        let request = match relay::prepare(url, extra_headers, options) {
            Ok(request) => request,
            Err(e) => {
                self.report_failure("asyncHttpRequest", &e);
                return;
            }
        };
        let on_success = CallbackHandle::from_wire(success_callback)
            .map(|h| self.callbacks.accept(h));
        let on_error = CallbackHandle::from_wire(error_callback)
            .map(|h| self.callbacks.accept(h));
        self.relay.dispatch(request, on_success, on_error);
    }

    // ─── Fuzzy index ────────────────────────────────────────────────────

    pub fn has_fuzzy_index(&self) -> bool {
        self.fuzzy.is_enabled()
    }

    /// Create the index, then merge `entries`. Malformed entries still leave
    /// an empty index behind.
    pub fn create_fuzzy_index(&self, entries: &str) {
        if let Err(e) = self.fuzzy.create(Vec::new()) {
            self.report_failure("createFuzzyIndex", &e);
            return;
        }
        let result = FuzzyIndexEntry::parse_list(entries).and_then(|list| self.fuzzy.add(list));
        self.benign("createFuzzyIndex", result, ());
    }

    pub fn add_to_fuzzy_index(&self, entries: &str) {
        let result = if self.fuzzy.is_enabled() {
            FuzzyIndexEntry::parse_list(entries).and_then(|list| self.fuzzy.add(list))
        } else {
            self.fuzzy.add(Vec::new())
        };
        self.benign("addToFuzzyIndex", result, ());
    }

    fn run_search(&self, operation: &str, query: FuzzyQuery) -> Option<String> {
        let result = self
            .fuzzy
            .search(&query)
            .and_then(|matrix| Ok(serde_json::to_string(&matrix)?));
        self.benign(operation, result.map(Some), None)
    }

    pub fn search(&self, query: &str) -> Option<String> {
        self.run_search("search", FuzzyQuery::Text(query.to_string()))
    }

    pub fn search_structured(&self, title: &str, album: &str, artist: &str) -> Option<String> {
        self.run_search(
            "searchStructured",
            FuzzyQuery::Structured {
                title: title.to_string(),
                album: album.to_string(),
                artist: artist.to_string(),
            },
        )
    }

    pub fn delete_fuzzy_index(&self) {
        let result = self.fuzzy.delete();
        self.benign("deleteFuzzyIndex", result, ());
    }

    // ─── Key/value store ────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<String> {
        let result = self.store.get(key);
        self.benign("get", result, None)
    }

    pub fn set(&self, key: &str, value: &str) {
        let result = self.store.set(key, value);
        self.benign("set", result, ());
    }

    pub fn remove(&self, key: &str) {
        let result = self.store.remove(key);
        self.benign("remove", result, ());
    }

    pub fn list_keys(&self) -> Vec<String> {
        let result = self.store.list_keys();
        self.benign("listKeys", result, Vec::new())
    }

    pub fn list_values(&self) -> Vec<Option<String>> {
        let result = self.store.list_values();
        self.benign("listValues", result, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::{EngineMessage, ScriptThreadHandle};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        _dir: tempfile::TempDir,
        gateway: Gateway,
        _rx: UnboundedReceiver<EngineMessage>,
        _rt: tokio::runtime::Runtime,
    }

    fn fixture(declared: CapabilityFlags) -> Fixture {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            storage_root: dir.path().to_path_buf(),
            ..BridgeConfig::default()
        };
        let resolver = Arc::new(ResolverSurface::new(
            "test-resolver",
            "Test Resolver",
            "test/resolver.wasm",
            serde_json::Map::new(),
            declared,
        ));
        let (script, rx) = ScriptThreadHandle::channel("test-resolver");
        let gateway = Gateway::new(GatewayParts {
            resolver,
            store: KeyValueStore::open(dir.path(), "test-resolver").unwrap(),
            fuzzy: FuzzyIndexService::new("test-resolver", false),
            relay: RequestRelay::new("test-resolver", &config, rt.handle().clone()).unwrap(),
            callbacks: CallbackRegistry::new("test-resolver", script),
            url_handlers: Arc::new(UrlHandlerTable::new()),
        })
        .unwrap();
        Fixture {
            _dir: dir,
            gateway,
            _rx: rx,
            _rt: rt,
        }
    }

    // ─── Log sanitizing ─────────────────────────────────────────────────

    #[test]
    fn test_sanitize_log_message_strips_control_chars() {
        assert_eq!(sanitize_log_message("a\u{1b}[31mb\tc\nd\0"), "a[31mb\tc\nd");
    }

    #[test]
    fn test_sanitize_log_message_at_limit() {
        let msg = "x".repeat(MAX_LOG_MESSAGE_LEN);
        assert_eq!(sanitize_log_message(&msg).len(), MAX_LOG_MESSAGE_LEN);
    }

    #[test]
    fn test_sanitize_log_message_counts_after_stripping() {
        let msg = format!("{}{}", "x".repeat(MAX_LOG_MESSAGE_LEN), "\0".repeat(10));
        assert_eq!(sanitize_log_message(&msg), "x".repeat(MAX_LOG_MESSAGE_LEN));
    }

    #[test]
    fn test_sanitize_log_message_truncates() {
        let msg = "x".repeat(MAX_LOG_MESSAGE_LEN + 1);
        assert!(sanitize_log_message(&msg).ends_with("(truncated)"));
    }

    // ─── Registration ───────────────────────────────────────────────────

    #[test]
    fn test_standard_table_has_every_method() {
        let table = MethodTable::standard().unwrap();
        for name in [
            "descriptor",
            "log",
            "deliverResults",
            "reportCapabilities",
            "reportStreamUrl",
            "registerUrlHandler",
            "asyncHttpRequest",
            "hasFuzzyIndex",
            "createFuzzyIndex",
            "addToFuzzyIndex",
            "search",
            "searchStructured",
            "deleteFuzzyIndex",
            "get",
            "set",
            "remove",
            "listKeys",
            "listValues",
            "callbackToNative",
            "readBase64",
        ] {
            assert!(table.contains(name), "missing {name}");
        }
        assert_eq!(table.names().len(), 20);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = MethodTable::new();
        table.register("ping", &[], |_, _| BridgeValue::Null).unwrap();
        let err = table
            .register("ping", &[], |_, _| BridgeValue::Null)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Registration(_)));
    }

    #[test]
    fn test_invalid_method_name_rejected() {
        let mut table = MethodTable::new();
        assert!(table.register("", &[], |_, _| BridgeValue::Null).is_err());
        assert!(table.register("has space", &[], |_, _| BridgeValue::Null).is_err());
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    #[test]
    fn test_unknown_method_returns_null() {
        let f = fixture(CapabilityFlags::NONE);
        assert_eq!(f.gateway.dispatch("launchMissiles", &[]), BridgeValue::Null);
    }

    #[test]
    fn test_signature_mismatch_returns_null() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway.dispatch("set", &[json!("k"), json!("v")]);
        // Wrong kind, missing argument, too many arguments
        assert_eq!(f.gateway.dispatch("get", &[json!(42)]), BridgeValue::Null);
        assert_eq!(f.gateway.dispatch("set", &[json!("k")]), BridgeValue::Null);
        assert_eq!(
            f.gateway.dispatch("get", &[json!("k"), json!("extra")]),
            BridgeValue::Null
        );
        assert_eq!(
            f.gateway.dispatch("get", &[json!("k")]),
            BridgeValue::Str("v".into())
        );
    }

    #[test]
    fn test_whole_float_accepted_as_int() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway.dispatch("reportCapabilities", &[json!(2.0)]);
        assert!(f.gateway.has_fuzzy_index());
    }

    #[test]
    fn test_fractional_number_rejected_as_int() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway.dispatch("reportCapabilities", &[json!(2.5)]);
        assert_eq!(f.gateway.resolver().reported_capabilities(), None);
    }

    #[test]
    fn test_bridge_value_wire_shape() {
        assert_eq!(serde_json::to_string(&BridgeValue::Null).unwrap(), "null");
        assert_eq!(
            serde_json::to_string(&BridgeValue::List(vec![Some("a".into()), None])).unwrap(),
            r#"["a",null]"#
        );
    }

    // ─── Key/value methods ──────────────────────────────────────────────

    #[test]
    fn test_kv_methods_through_dispatch() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway.dispatch("set", &[json!("b"), json!("2")]);
        f.gateway.dispatch("set", &[json!("a"), json!("1")]);
        assert_eq!(
            f.gateway.dispatch("listKeys", &[]),
            BridgeValue::List(vec![Some("a".into()), Some("b".into())])
        );
        assert_eq!(
            f.gateway.dispatch("listValues", &[]),
            BridgeValue::List(vec![Some("1".into()), Some("2".into())])
        );
        f.gateway.dispatch("remove", &[json!("a")]);
        assert_eq!(f.gateway.dispatch("get", &[json!("a")]), BridgeValue::Null);
    }

    #[test]
    fn test_invalid_key_is_benign() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway.set("../escape", "x");
        assert_eq!(f.gateway.get("../escape"), None);
        f.gateway.remove("../escape");
        assert!(f.gateway.list_keys().is_empty());
    }

    // ─── Fuzzy methods ──────────────────────────────────────────────────

    #[test]
    fn test_fuzzy_without_capability_is_benign() {
        let f = fixture(CapabilityFlags::NONE);
        assert!(!f.gateway.has_fuzzy_index());
        f.gateway.create_fuzzy_index(r#"[{"title": "x"}]"#);
        assert_eq!(f.gateway.search("x"), None);
        assert_eq!(f.gateway.fuzzy().entry_count(), None);
    }

    #[test]
    fn test_declared_capability_enables_fuzzy() {
        let f = fixture(CapabilityFlags::FUZZY_INDEX);
        assert!(f.gateway.has_fuzzy_index());
        f.gateway
            .create_fuzzy_index(r#"[{"title": "Song A"}, {"title": "Song B"}]"#);
        let matrix: Vec<Vec<f64>> =
            serde_json::from_str(&f.gateway.search("song").unwrap()).unwrap();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].len(), 2);
    }

    #[test]
    fn test_malformed_entries_still_create_index() {
        let f = fixture(CapabilityFlags::FUZZY_INDEX);
        f.gateway.create_fuzzy_index("not json");
        assert_eq!(f.gateway.fuzzy().entry_count(), Some(0));
        f.gateway.add_to_fuzzy_index(r#"[{"title": "late"}]"#);
        assert_eq!(f.gateway.fuzzy().entry_count(), Some(1));
    }

    #[test]
    fn test_search_after_delete_is_null() {
        let f = fixture(CapabilityFlags::FUZZY_INDEX);
        f.gateway.create_fuzzy_index("[]");
        f.gateway.delete_fuzzy_index();
        assert_eq!(
            f.gateway
                .dispatch("searchStructured", &[json!("a"), json!("b"), json!("c")]),
            BridgeValue::Null
        );
        f.gateway.add_to_fuzzy_index(r#"[{"title": "x"}]"#);
        assert_eq!(f.gateway.fuzzy().entry_count(), None);
    }

    // ─── Control surface ────────────────────────────────────────────────

    #[test]
    fn test_descriptor_is_cached_until_config_changes() {
        let f = fixture(CapabilityFlags::NONE);
        let first = f.gateway.descriptor();
        assert_eq!(first, f.gateway.descriptor());
        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["scriptPath"], "test/resolver.wasm");

        let mut config = serde_json::Map::new();
        config.insert("quality".into(), json!("high"));
        f.gateway.resolver().set_config(config);
        let second = f.gateway.descriptor();
        assert_ne!(first, second);
        assert!(second.contains("\"quality\":\"high\""));
    }

    #[test]
    fn test_negative_capabilities_ignored() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway.report_capabilities(-1);
        assert_eq!(f.gateway.resolver().reported_capabilities(), None);
    }

    #[test]
    fn test_unknown_result_kind_dropped() {
        let f = fixture(CapabilityFlags::NONE);
        let mut events = f.gateway.resolver().subscribe();
        f.gateway
            .deliver_results("playlist", r#"{"qid": "q", "results": [{}]}"#);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_register_url_handler() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway
            .dispatch("registerUrlHandler", &[json!("spotify"), json!("lookupUrl")]);
        let handler = f.gateway.url_handlers.lookup("spotify:track:1").unwrap();
        assert_eq!(handler.resolver_id, "test-resolver");
        assert_eq!(handler.function, "lookupUrl");
    }

    #[test]
    fn test_callback_to_native() {
        let f = fixture(CapabilityFlags::NONE);
        let calls = f.gateway.resolver().native_calls();

        let (id, mut rx) = calls.register();
        f.gateway
            .dispatch("callbackToNative", &[json!(id), json!("{\"ok\":1}"), json!(true)]);
        assert_eq!(rx.try_recv().unwrap().as_deref(), Some("{\"ok\":1}"));

        let (id, mut rx) = calls.register();
        f.gateway.callback_to_native(id, Some("ignored"), false);
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn test_read_base64_is_empty() {
        let f = fixture(CapabilityFlags::NONE);
        assert_eq!(
            f.gateway.dispatch("readBase64", &[json!("cover.png")]),
            BridgeValue::Str(String::new())
        );
    }

    #[test]
    fn test_malformed_request_registers_no_callback() {
        let f = fixture(CapabilityFlags::NONE);
        f.gateway.async_http_request(
            "https://example.com",
            Some(1),
            Some("{not json"),
            None,
            Some(2),
        );
        assert_eq!(f.gateway.callbacks().pending_count(), 0);
    }
}
