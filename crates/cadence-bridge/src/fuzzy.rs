//! Optional per-resolver fuzzy search index.
//!
//! Resolvers that declare the fuzzy-index capability can push their catalog
//! into a native index and query it with free text or structured
//! (title, album, artist) queries. Scoring sits behind [`FuzzyMatcher`];
//! [`TermMatcher`] is the default.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::{read, write};

/// One searchable item, as pushed by a resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuzzyIndexEntry {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, alias = "track")]
    pub title: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    /// Resolver-owned fields the index doesn't interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FuzzyIndexEntry {
    /// Parse a JSON array of entries sent by a resolver.
    pub fn parse_list(json: &str) -> Result<Vec<Self>, BridgeError> {
        Ok(serde_json::from_str(json)?)
    }

    fn fields(&self) -> [&str; 3] {
        [
            self.title.as_deref().unwrap_or_default(),
            self.album.as_deref().unwrap_or_default(),
            self.artist.as_deref().unwrap_or_default(),
        ]
    }
}

/// A search against the index.
#[derive(Debug, Clone, PartialEq)]
pub enum FuzzyQuery {
    Text(String),
    Structured {
        title: String,
        album: String,
        artist: String,
    },
}

/// Score matrix: one row per query, one column per entry (insertion order).
pub type SearchResult = Vec<Vec<f64>>;

// ─── Scoring ────────────────────────────────────────────────────────────

/// Similarity between a query string and a candidate string, in `[0, 1]`.
pub trait FuzzyMatcher: Send + Sync {
    fn score(&self, query: &str, candidate: &str) -> f64;
}

/// Term-based matcher: each query term takes its best match among the
/// candidate's terms (exact = 1, otherwise character-bigram Dice
/// coefficient); the score is the mean over query terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermMatcher;

/// Structured query weights.
const TITLE_WEIGHT: f64 = 0.5;
const ARTIST_WEIGHT: f64 = 0.3;
const ALBUM_WEIGHT: f64 = 0.2;

fn normalize_terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

fn bigrams(term: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = term.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

fn term_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (ba, bb) = (bigrams(a), bigrams(b));
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let mut remaining = bb.clone();
    let mut shared = 0usize;
    for g in &ba {
        if let Some(pos) = remaining.iter().position(|x| x == g) {
            remaining.swap_remove(pos);
            shared += 1;
        }
    }
    (2 * shared) as f64 / (ba.len() + bb.len()) as f64
}

impl FuzzyMatcher for TermMatcher {
    fn score(&self, query: &str, candidate: &str) -> f64 {
        let query_terms = normalize_terms(query);
        let candidate_terms = normalize_terms(candidate);
        if query_terms.is_empty() || candidate_terms.is_empty() {
            return 0.0;
        }
        let total: f64 = query_terms
            .iter()
            .map(|q| {
                candidate_terms
                    .iter()
                    .map(|c| term_similarity(q, c))
                    .fold(0.0, f64::max)
            })
            .sum();
        total / query_terms.len() as f64
    }
}

// ─── Index ──────────────────────────────────────────────────────────────

/// Built index contents.
pub struct FuzzyIndex {
    entries: Vec<FuzzyIndexEntry>,
}

impl FuzzyIndex {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn extend(&mut self, entries: Vec<FuzzyIndexEntry>) {
        self.entries.extend(entries);
    }

    fn search(&self, matcher: &dyn FuzzyMatcher, query: &FuzzyQuery) -> SearchResult {
        let row = match query {
            FuzzyQuery::Text(text) => self
                .entries
                .iter()
                .map(|e| matcher.score(text, &e.fields().join(" ")))
                .collect(),
            FuzzyQuery::Structured {
                title,
                album,
                artist,
            } => {
                let weighted = [
                    (title.as_str(), TITLE_WEIGHT),
                    (album.as_str(), ALBUM_WEIGHT),
                    (artist.as_str(), ARTIST_WEIGHT),
                ];
                let weight_sum: f64 = weighted
                    .iter()
                    .filter(|(q, _)| !q.trim().is_empty())
                    .map(|(_, w)| w)
                    .sum();
                self.entries
                    .iter()
                    .map(|e| {
                        if weight_sum == 0.0 {
                            return 0.0;
                        }
                        let fields = e.fields();
                        weighted
                            .iter()
                            .zip(fields)
                            .filter(|((q, _), _)| !q.trim().is_empty())
                            .map(|((q, w), field)| w * matcher.score(q, field))
                            .sum::<f64>()
                            / weight_sum
                    })
                    .collect()
            }
        };
        vec![row]
    }
}

enum IndexState {
    Absent,
    Created(FuzzyIndex),
    Deleted,
}

impl IndexState {
    fn name(&self) -> &'static str {
        match self {
            IndexState::Absent => "absent",
            IndexState::Created(_) => "created",
            IndexState::Deleted => "deleted",
        }
    }
}

/// Fuzzy index lifecycle for one resolver:
/// `Absent → Created → (populated, searched) → Deleted`.
pub struct FuzzyIndexService {
    resolver: String,
    enabled: AtomicBool,
    matcher: Box<dyn FuzzyMatcher>,
    state: RwLock<IndexState>,
}

impl std::fmt::Debug for FuzzyIndexService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuzzyIndexService")
            .field("resolver", &self.resolver)
            .field("enabled", &self.is_enabled())
            .field("state", &read(&self.state).name())
            .finish_non_exhaustive()
    }
}

impl FuzzyIndexService {
    /// `enabled` is the resolver's declared capability; a later capability
    /// report can still [`enable`](Self::enable) it.
    pub fn new(resolver: impl Into<String>, enabled: bool) -> Self {
        Self::with_matcher(resolver, enabled, Box::new(TermMatcher))
    }

    pub fn with_matcher(
        resolver: impl Into<String>,
        enabled: bool,
        matcher: Box<dyn FuzzyMatcher>,
    ) -> Self {
        Self {
            resolver: resolver.into(),
            enabled: AtomicBool::new(enabled),
            matcher,
            state: RwLock::new(IndexState::Absent),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn the capability on. There is no way back.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    fn require_capability(&self) -> Result<(), BridgeError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(BridgeError::CapabilityMissing(format!(
                "resolver '{}' did not declare a fuzzy index",
                self.resolver
            )))
        }
    }

    /// Create the index (if absent) and merge `entries` into it.
    pub fn create(&self, entries: Vec<FuzzyIndexEntry>) -> Result<(), BridgeError> {
        self.require_capability()?;
        let mut state = write(&self.state);
        match &mut *state {
            IndexState::Absent => {
                let mut index = FuzzyIndex::new();
                index.extend(entries);
                tracing::debug!(
                    resolver = %self.resolver,
                    entries = index.len(),
                    "fuzzy index created"
                );
                *state = IndexState::Created(index);
                Ok(())
            }
            IndexState::Created(index) => {
                tracing::warn!(
                    resolver = %self.resolver,
                    "fuzzy index created twice, merging entries into the existing index"
                );
                index.extend(entries);
                Ok(())
            }
            IndexState::Deleted => Err(BridgeError::IndexUnavailable(
                "index was deleted".into(),
            )),
        }
    }

    /// Merge `entries` into an existing index.
    pub fn add(&self, entries: Vec<FuzzyIndexEntry>) -> Result<(), BridgeError> {
        self.require_capability()?;
        let mut state = write(&self.state);
        match &mut *state {
            IndexState::Created(index) => {
                index.extend(entries);
                Ok(())
            }
            other => Err(BridgeError::IndexUnavailable(format!(
                "index is {}",
                other.name()
            ))),
        }
    }

    /// Score `query` against every entry.
    pub fn search(&self, query: &FuzzyQuery) -> Result<SearchResult, BridgeError> {
        self.require_capability()?;
        match &*read(&self.state) {
            IndexState::Created(index) => Ok(index.search(self.matcher.as_ref(), query)),
            other => Err(BridgeError::IndexUnavailable(format!(
                "index is {}",
                other.name()
            ))),
        }
    }

    /// Drop a created index. Terminal: later operations are rejected.
    /// Deleting an index that was never created leaves the state untouched.
    pub fn delete(&self) -> Result<(), BridgeError> {
        self.require_capability()?;
        let mut state = write(&self.state);
        match *state {
            IndexState::Created(_) => {
                *state = IndexState::Deleted;
                tracing::debug!(resolver = %self.resolver, "fuzzy index deleted");
                Ok(())
            }
            IndexState::Absent => Err(BridgeError::IndexUnavailable(
                "no index to delete".into(),
            )),
            IndexState::Deleted => Err(BridgeError::IndexUnavailable("already deleted".into())),
        }
    }

    /// Number of indexed entries, `None` unless the index exists.
    pub fn entry_count(&self) -> Option<usize> {
        match &*read(&self.state) {
            IndexState::Created(index) => Some(index.len()),
            _ => None,
        }
    }
}
