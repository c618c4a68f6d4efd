//! # overtone-presence
//!
//! Discord Rich Presence session core for Overtone: finds the co-resident
//! Discord client's IPC socket, keeps a framed-JSON session alive against
//! it, and publishes "Listening to ..." activities with asynchronously
//! resolved album artwork.
//!
//! ## Design Principles
//!
//! - **Thread-based**: No async runtime dependency. One worker thread owns
//!   all socket I/O and state transitions; public entry points enqueue and
//!   return immediately.
//! - **Graceful degradation**: A missing Discord process, a vanished
//!   socket, or a failed artwork lookup never surfaces as a hard error.
//!   The session retries on its own schedule and falls back to the static
//!   asset.
//! - **Explicit dependencies**: The artwork cache is built once and
//!   injected; there is no ambient global state.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use overtone_presence::{ArtworkCache, ItunesArtworkFetcher, PresenceConfig, PresenceSession};
//!
//! let cache = Arc::new(ArtworkCache::new(Box::new(ItunesArtworkFetcher::new()?)));
//! let session = PresenceSession::spawn(PresenceConfig::from_env(), cache);
//! session.enable();
//! ```

// Public modules
pub mod activity;
pub mod artwork;
pub mod config;
pub mod error;
pub mod locator;
pub mod reconnect;
pub mod session;

// Re-export commonly used items at crate root
pub use activity::{clear_activity, listening_activity, NowPlaying, FALLBACK_ASSET_KEY};
pub use artwork::{
    cache_key, ArtworkCache, ArtworkError, ArtworkFetcher, ArtworkQuery, ItunesArtworkFetcher,
};
pub use config::{PresenceConfig, CLIENT_ID_ENV, IPC_DIR_ENV};
pub use error::{PresenceError, Result};
pub use locator::{candidate_directories, socket_path, SOCKET_PREFIX, SOCKET_SLOTS};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{run_connection_test, ConnectionState, PresenceSession};
