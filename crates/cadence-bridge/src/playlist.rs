//! Ad-hoc playlists built from resolver track results.

use serde::{Deserialize, Serialize};

/// A playable track as reported by a resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    #[serde(alias = "track")]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
}

impl Track {
    /// Interpret one entry of a `deliverResults("track", ..)` payload.
    /// Entries without a title are skipped.
    pub fn from_result(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    fn same_track(&self, other: &Track) -> bool {
        self.title == other.title && self.artist == other.artist && self.album == other.album
    }
}

/// An ordered list of tracks with an optional current position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Playlist {
    name: String,
    tracks: Vec<Track>,
    current: Option<usize>,
}

impl Playlist {
    /// Ad-hoc playlists are never persisted and share this id.
    pub const ADHOC_ID: i64 = 0;

    /// Current track is the first one, or none for an empty list.
    pub fn from_tracks(name: impl Into<String>, tracks: Vec<Track>) -> Self {
        let current = if tracks.is_empty() { None } else { Some(0) };
        Self {
            name: name.into(),
            tracks,
            current,
        }
    }

    /// Position on `current` if it is in `tracks`, otherwise behave like
    /// [`from_tracks`](Self::from_tracks).
    pub fn from_tracks_with_current(
        name: impl Into<String>,
        tracks: Vec<Track>,
        current: &Track,
    ) -> Self {
        let mut playlist = Self::from_tracks(name, tracks);
        if let Some(pos) = playlist.tracks.iter().position(|t| t.same_track(current)) {
            playlist.current = Some(pos);
        }
        playlist
    }

    pub fn id(&self) -> i64 {
        Self::ADHOC_ID
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current.and_then(|i| self.tracks.get(i))
    }

    /// Move to the next track. Returns it, or `None` at the end of the list.
    pub fn advance(&mut self) -> Option<&Track> {
        let next = self.current? + 1;
        if next < self.tracks.len() {
            self.current = Some(next);
            self.tracks.get(next)
        } else {
            None
        }
    }
}
