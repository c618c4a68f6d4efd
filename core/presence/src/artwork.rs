//! Artwork resolution and caching.
//!
//! Cache keys are `"{artist}|{track}"`. Entries are written once and kept
//! for the process lifetime: a hit never touches the network, and a failed
//! lookup is cached as "no artwork", so a single track can never generate
//! repeated lookups no matter how often it is re-published. The cache is
//! an explicit object handed to whoever needs it; lookups run on
//! caller-provided threads, so interior locking is all it needs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

const ITUNES_SEARCH_URL: &str = "https://itunes.apple.com/search";
const HTTP_TIMEOUT_SECS: u64 = 10;
// iTunes returns 100x100 thumbnails; the size is embedded in the URL and
// the presence surface renders far larger.
const THUMB_SIZE: &str = "100x100";
const FULL_SIZE: &str = "512x512";

/// Cache key for one track.
pub fn cache_key(artist: &str, track: &str) -> String {
    format!("{}|{}", artist, track)
}

/// Failures while talking to the artwork service. These never escalate
/// past the cache; a failed lookup just pins the fallback asset.
#[derive(Debug, thiserror::Error)]
pub enum ArtworkError {
    #[error("artwork request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("artwork service returned status {0}")]
    Status(u16),
}

/// Resolves an artwork URL for a track. `Ok(None)` means the service had
/// no image for it.
pub trait ArtworkFetcher: Send + Sync {
    fn lookup(&self, artist: &str, track: &str) -> Result<Option<String>, ArtworkError>;
}

/// Outcome of a cache query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtworkQuery {
    /// Key resolved earlier. `None` means the lookup found nothing (or
    /// failed) and the fallback asset applies from here on.
    Hit(Option<String>),
    /// First miss for this key; the caller owns starting the one lookup.
    MissStarted,
    /// A lookup for this key is already in flight.
    MissPending,
}

enum Entry {
    Pending,
    Ready(Option<String>),
}

/// Write-once artwork cache shared between the session worker and its
/// lookup threads.
pub struct ArtworkCache {
    entries: Mutex<HashMap<String, Entry>>,
    fetcher: Box<dyn ArtworkFetcher>,
}

impl ArtworkCache {
    pub fn new(fetcher: Box<dyn ArtworkFetcher>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fetcher,
        }
    }

    /// Looks up a key, claiming it for a fetch on the first miss. The
    /// claim is what guarantees at most one lookup per key even when the
    /// same track is published again before the first lookup finishes.
    pub fn query(&self, artist: &str, track: &str) -> ArtworkQuery {
        let key = cache_key(artist, track);
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(Entry::Ready(url)) => ArtworkQuery::Hit(url.clone()),
            Some(Entry::Pending) => ArtworkQuery::MissPending,
            None => {
                entries.insert(key, Entry::Pending);
                ArtworkQuery::MissStarted
            }
        }
    }

    /// Runs the fetcher for a previously claimed key and stores the
    /// outcome. Failures are stored as "no artwork" so the key is never
    /// retried.
    pub fn fetch_and_store(&self, artist: &str, track: &str) -> Option<String> {
        let resolved = match self.fetcher.lookup(artist, track) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(
                    artist = %artist,
                    track = %track,
                    error = %err,
                    "Artwork lookup failed; pinning fallback asset"
                );
                None
            }
        };
        let mut entries = self.entries.lock().unwrap();
        entries.insert(cache_key(artist, track), Entry::Ready(resolved.clone()));
        resolved
    }
}

/// Artwork lookups against the iTunes Search API. No API key required;
/// results are public catalog metadata.
pub struct ItunesArtworkFetcher {
    http: reqwest::blocking::Client,
}

impl ItunesArtworkFetcher {
    pub fn new() -> Result<Self, ArtworkError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    artwork_url_100: Option<String>,
}

impl ArtworkFetcher for ItunesArtworkFetcher {
    fn lookup(&self, artist: &str, track: &str) -> Result<Option<String>, ArtworkError> {
        let term = format!("{} {}", artist, track);
        let response = self
            .http
            .get(ITUNES_SEARCH_URL)
            .query(&[
                ("term", term.as_str()),
                ("media", "music"),
                ("entity", "song"),
                ("limit", "1"),
            ])
            .send()?;
        if !response.status().is_success() {
            return Err(ArtworkError::Status(response.status().as_u16()));
        }

        let parsed: SearchResponse = response.json()?;
        let url = parsed
            .results
            .into_iter()
            .find_map(|result| result.artwork_url_100)
            .map(|url| upscale_artwork_url(&url));
        debug!(artist = %artist, track = %track, found = url.is_some(), "Artwork lookup finished");
        Ok(url)
    }
}

fn upscale_artwork_url(url: &str) -> String {
    url.replace(THUMB_SIZE, FULL_SIZE)
}
