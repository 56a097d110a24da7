//! Resolver Control Surface: the native state of one loaded resolver.
//!
//! Holds what the resolver reports back to the host: capability flags,
//! aggregated search results, and stream URLs. It also owns the descriptor
//! inputs (script path and config) and announces changes on a broadcast
//! channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::callbacks::NativeCallTable;
use crate::error::BridgeError;
use crate::playlist::{Playlist, Track};
use crate::{lock, read, write};

/// Broadcast buffer per resolver.
const EVENT_CAPACITY: usize = 64;

/// The result channels a resolver can deliver on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultKind {
    Track,
    Album,
    Artist,
    AlbumTrack,
}

impl ResultKind {
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "track" => Some(Self::Track),
            "album" => Some(Self::Album),
            "artist" => Some(Self::Artist),
            "albumTrack" => Some(Self::AlbumTrack),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Album => "album",
            Self::Artist => "artist",
            Self::AlbumTrack => "albumTrack",
        }
    }
}

/// Capability bitmask reported by a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const NONE: Self = Self(0);
    pub const BROWSABLE: Self = Self(0b0001);
    pub const FUZZY_INDEX: Self = Self(0b0010);
    pub const PLAYLIST_SYNC: Self = Self(0b0100);
    pub const URL_LOOKUP: Self = Self(0b1000);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Serialized form handed to the script runtime on load.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverDescriptor {
    pub script_path: String,
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// A resolved stream URL with the headers needed to fetch it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUrl {
    pub qid: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolverEventKind {
    Results { kind: ResultKind, qid: String, count: usize },
    StreamUrl(StreamUrl),
    Capabilities(CapabilityFlags),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolverEvent {
    pub resolver: String,
    pub at: DateTime<Utc>,
    pub kind: ResolverEventKind,
}

#[derive(Deserialize)]
struct ResultSet {
    #[serde(default)]
    qid: String,
    #[serde(default, alias = "tracks", alias = "albums", alias = "artists")]
    results: Vec<serde_json::Value>,
}

pub struct ResolverSurface {
    id: String,
    name: String,
    script_path: String,
    instance: Uuid,
    loaded_at: DateTime<Utc>,
    declared: CapabilityFlags,
    config: RwLock<serde_json::Map<String, serde_json::Value>>,
    config_version: AtomicU64,
    reported: Mutex<Option<CapabilityFlags>>,
    results: Mutex<HashMap<(ResultKind, String), Vec<serde_json::Value>>>,
    stream_waiters: Mutex<HashMap<String, oneshot::Sender<StreamUrl>>>,
    events: broadcast::Sender<ResolverEvent>,
    native_calls: NativeCallTable,
}

impl std::fmt::Debug for ResolverSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverSurface")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}

impl ResolverSurface {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        script_path: impl Into<String>,
        config: serde_json::Map<String, serde_json::Value>,
        declared: CapabilityFlags,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: id.into(),
            name: name.into(),
            script_path: script_path.into(),
            instance: Uuid::new_v4(),
            loaded_at: Utc::now(),
            declared,
            config: RwLock::new(config),
            config_version: AtomicU64::new(0),
            reported: Mutex::new(None),
            results: Mutex::new(HashMap::new()),
            stream_waiters: Mutex::new(HashMap::new()),
            events,
            native_calls: NativeCallTable::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script_path(&self) -> &str {
        &self.script_path
    }

    /// Unique id of this load of the resolver.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn native_calls(&self) -> &NativeCallTable {
        &self.native_calls
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResolverEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: ResolverEventKind) {
        // No subscriber is fine.
        let _ = self.events.send(ResolverEvent {
            resolver: self.id.clone(),
            at: Utc::now(),
            kind,
        });
    }

    // ─── Descriptor inputs ──────────────────────────────────────────────

    pub fn config(&self) -> serde_json::Map<String, serde_json::Value> {
        read(&self.config).clone()
    }

    /// Replace the config. Invalidates any cached descriptor.
    pub fn set_config(&self, config: serde_json::Map<String, serde_json::Value>) {
        *write(&self.config) = config;
        self.config_version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn config_version(&self) -> u64 {
        self.config_version.load(Ordering::Acquire)
    }

    pub fn descriptor(&self) -> ResolverDescriptor {
        ResolverDescriptor {
            script_path: self.script_path.clone(),
            config: self.config(),
        }
    }

    // ─── Capabilities ───────────────────────────────────────────────────

    /// Record the resolver's capability report. Only the first report counts.
    pub fn report_capabilities(&self, flags: CapabilityFlags) -> bool {
        let mut reported = lock(&self.reported);
        if let Some(existing) = *reported {
            tracing::warn!(
                resolver = %self.id,
                existing = existing.bits(),
                ignored = flags.bits(),
                "capabilities already reported, ignoring"
            );
            return false;
        }
        *reported = Some(flags);
        drop(reported);
        tracing::info!(resolver = %self.id, flags = flags.bits(), "capabilities reported");
        self.emit(ResolverEventKind::Capabilities(flags));
        true
    }

    pub fn reported_capabilities(&self) -> Option<CapabilityFlags> {
        *lock(&self.reported)
    }

    /// Declared plus reported capabilities.
    pub fn capabilities(&self) -> CapabilityFlags {
        self.declared
            .union(self.reported_capabilities().unwrap_or_default())
    }

    pub fn has_fuzzy_index(&self) -> bool {
        self.capabilities().contains(CapabilityFlags::FUZZY_INDEX)
    }

    // ─── Results ────────────────────────────────────────────────────────

    /// Parse a `{qid, results}` payload and aggregate it. Malformed payloads
    /// are logged and dropped.
    pub fn deliver_results(&self, kind: ResultKind, payload: &str) {
        match self.try_deliver_results(kind, payload) {
            Ok(count) => tracing::debug!(
                resolver = %self.id,
                kind = kind.as_str(),
                count,
                "results delivered"
            ),
            Err(e) => tracing::warn!(
                resolver = %self.id,
                kind = kind.as_str(),
                "dropping malformed results payload: {e}"
            ),
        }
    }

    fn try_deliver_results(&self, kind: ResultKind, payload: &str) -> Result<usize, BridgeError> {
        let set: ResultSet = serde_json::from_str(payload)?;
        let count = set.results.len();
        lock(&self.results)
            .entry((kind, set.qid.clone()))
            .or_default()
            .extend(set.results);
        self.emit(ResolverEventKind::Results {
            kind,
            qid: set.qid,
            count,
        });
        Ok(count)
    }

    /// Drain the results collected for `(kind, qid)`.
    pub fn take_results(&self, kind: ResultKind, qid: &str) -> Vec<serde_json::Value> {
        lock(&self.results)
            .remove(&(kind, qid.to_string()))
            .unwrap_or_default()
    }

    /// Build a playlist from the track results collected for `qid`.
    pub fn playlist_from_tracks(&self, name: &str, qid: &str) -> Playlist {
        let tracks: Vec<Track> = self
            .take_results(ResultKind::Track, qid)
            .iter()
            .filter_map(Track::from_result)
            .collect();
        Playlist::from_tracks(name, tracks)
    }

    // ─── Stream URLs ────────────────────────────────────────────────────

    /// Record a stream URL for `qid`. Malformed headers become an empty map.
    pub fn report_stream_url(&self, qid: &str, url: &str, headers_json: Option<&str>) {
        let headers = match headers_json.map(str::trim).filter(|h| !h.is_empty()) {
            None => HashMap::new(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                tracing::warn!(
                    resolver = %self.id,
                    qid = %qid,
                    "ignoring malformed stream headers: {e}"
                );
                HashMap::new()
            }),
        };
        let stream = StreamUrl {
            qid: qid.to_string(),
            url: url.to_string(),
            headers,
        };
        if let Some(waiter) = lock(&self.stream_waiters).remove(qid) {
            let _ = waiter.send(stream.clone());
        }
        self.emit(ResolverEventKind::StreamUrl(stream));
    }

    /// Wait for the next stream URL reported for `qid`. Replaces an earlier
    /// waiter on the same qid.
    pub fn await_stream_url(&self, qid: &str) -> oneshot::Receiver<StreamUrl> {
        let (tx, rx) = oneshot::channel();
        lock(&self.stream_waiters).insert(qid.to_string(), tx);
        rx
    }
}
