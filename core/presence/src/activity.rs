//! `SET_ACTIVITY` payload construction.
//!
//! Pure functions from a now-playing tuple to the wire payload. The
//! caller supplies the clock so timestamp math stays testable.

use overtone_presence_wire::{
    Activity, ActivityArgs, ActivityAssets, ActivityTimestamps, SetActivity,
    ACTIVITY_TYPE_LISTENING, SET_ACTIVITY_COMMAND,
};
use uuid::Uuid;

/// Key of the static asset shown when no artwork URL is available. Must
/// match an asset uploaded to the Discord application.
pub const FALLBACK_ASSET_KEY: &str = "music";

const SMALL_ASSET_TEXT: &str = "Overtone";

/// One observation of the local player.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track: String,
    pub artist: String,
    pub album: String,
    /// Track length in seconds; zero or negative disables the progress bar.
    pub duration_secs: f64,
    /// Playback position in seconds at the time of observation.
    pub elapsed_secs: f64,
}

/// Builds the "Listening to ..." payload.
///
/// With an artwork URL the fallback asset moves to the small slot as a
/// brand mark; without one the fallback covers the large slot and the
/// small slot stays empty. `now_ms` is Unix-epoch milliseconds.
pub fn listening_activity(
    playing: &NowPlaying,
    artwork_url: Option<&str>,
    now_ms: i64,
    pid: u32,
) -> SetActivity {
    let assets = match artwork_url {
        Some(url) => ActivityAssets {
            large_image: Some(url.to_string()),
            large_text: non_empty(&playing.album),
            small_image: Some(FALLBACK_ASSET_KEY.to_string()),
            small_text: Some(SMALL_ASSET_TEXT.to_string()),
        },
        None => ActivityAssets {
            large_image: Some(FALLBACK_ASSET_KEY.to_string()),
            large_text: non_empty(&playing.album),
            small_image: None,
            small_text: None,
        },
    };

    SetActivity {
        cmd: SET_ACTIVITY_COMMAND.to_string(),
        args: ActivityArgs {
            pid,
            activity: Some(Activity {
                activity_type: ACTIVITY_TYPE_LISTENING,
                details: playing.track.clone(),
                state: format!("by {}", playing.artist),
                assets,
                timestamps: progress_timestamps(playing, now_ms),
            }),
        },
        nonce: Uuid::new_v4().to_string(),
    }
}

/// Builds the payload that clears the published activity.
pub fn clear_activity(pid: u32) -> SetActivity {
    SetActivity {
        cmd: SET_ACTIVITY_COMMAND.to_string(),
        args: ActivityArgs {
            pid,
            activity: None,
        },
        nonce: Uuid::new_v4().to_string(),
    }
}

/// Start/end bounds for the remote's progress bar: start is now minus the
/// elapsed position, end is start plus the track length.
fn progress_timestamps(playing: &NowPlaying, now_ms: i64) -> Option<ActivityTimestamps> {
    if playing.duration_secs <= 0.0 {
        return None;
    }
    let start = now_ms - (playing.elapsed_secs * 1000.0).round() as i64;
    let end = start + (playing.duration_secs * 1000.0).round() as i64;
    Some(ActivityTimestamps {
        start,
        end: Some(end),
    })
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
