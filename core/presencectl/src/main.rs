//! presencectl: diagnostics and driver CLI for the Overtone presence core.
//!
//! Exercises the same library the desktop app embeds, against the real
//! Discord client on this machine.
//!
//! ## Subcommands
//!
//! - `discover`: List candidate socket directories and present slots
//! - `test`: Run one connect + handshake + disconnect cycle and report
//! - `play`: Publish a now-playing activity for a while, then clear it

use std::env;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use overtone_presence::{
    candidate_directories, run_connection_test, socket_path, ArtworkCache, ConnectionState,
    ItunesArtworkFetcher, NowPlaying, PresenceConfig, PresenceSession, SOCKET_SLOTS,
};

const CONNECT_WAIT_SECS: u64 = 15;

#[derive(Parser)]
#[command(name = "presencectl")]
#[command(about = "Probe and drive the Overtone presence session")]
#[command(version)]
struct Cli {
    /// Discord application id (overrides OVERTONE_CLIENT_ID)
    #[arg(long, global = true)]
    client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate socket directories and the slots present in them
    Discover,

    /// Run one connect + handshake + disconnect cycle and report
    Test,

    /// Publish a now-playing activity, hold it, then clear it
    Play {
        /// Track title
        #[arg(long)]
        track: String,

        /// Artist credited in the state line
        #[arg(long)]
        artist: String,

        /// Album shown as artwork tooltip
        #[arg(long, default_value = "")]
        album: String,

        /// Track length in seconds (0 disables the progress bar)
        #[arg(long, default_value_t = 0.0)]
        duration: f64,

        /// Playback position in seconds
        #[arg(long, default_value_t = 0.0)]
        elapsed: f64,

        /// Seconds to keep the activity up before clearing
        #[arg(long, default_value_t = 30)]
        hold: u64,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let mut config = PresenceConfig::from_env();
    if let Some(client_id) = cli.client_id {
        config.client_id = client_id;
    }

    match cli.command {
        Commands::Discover => run_discover(&config),
        Commands::Test => run_test(&config),
        Commands::Play {
            track,
            artist,
            album,
            duration,
            elapsed,
            hold,
        } => {
            let playing = NowPlaying {
                track,
                artist,
                album,
                duration_secs: duration,
                elapsed_secs: elapsed,
            };
            run_play(config, playing, hold);
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("OVERTONE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_discover(config: &PresenceConfig) {
    let directories = candidate_directories(config);
    if directories.is_empty() {
        println!("no candidate socket directories found");
        std::process::exit(1);
    }
    for directory in &directories {
        println!("{}", directory.display());
        for slot in SOCKET_SLOTS {
            let path = socket_path(directory, slot);
            if path.exists() {
                println!("  discord-ipc-{} (present)", slot);
            }
        }
    }
}

fn run_test(config: &PresenceConfig) {
    match run_connection_test(config) {
        Ok(report) => println!("{}", report),
        Err(err) => {
            eprintln!("connection test failed: {}", err);
            std::process::exit(1);
        }
    }
}

fn run_play(config: PresenceConfig, playing: NowPlaying, hold: u64) {
    if !config.is_configured() {
        eprintln!("no client id configured; set OVERTONE_CLIENT_ID or pass --client-id");
        std::process::exit(1);
    }

    let fetcher = match ItunesArtworkFetcher::new() {
        Ok(fetcher) => fetcher,
        Err(err) => {
            eprintln!("could not build artwork client: {}", err);
            std::process::exit(1);
        }
    };
    let cache = Arc::new(ArtworkCache::new(Box::new(fetcher)));
    let session = PresenceSession::spawn(config, cache);

    let (state_tx, state_rx) = mpsc::channel();
    session.on_state_change(move |state| {
        let _ = state_tx.send(state);
    });
    session.enable();

    if !wait_for_state(
        &state_rx,
        ConnectionState::Connected,
        Duration::from_secs(CONNECT_WAIT_SECS),
    ) {
        eprintln!("timed out waiting for the session to connect");
        std::process::exit(1);
    }

    info!(track = %playing.track, artist = %playing.artist, "Publishing activity");
    session.publish(playing);
    thread::sleep(Duration::from_secs(hold));
    session.clear();
    session.disable();
}

fn wait_for_state(
    rx: &mpsc::Receiver<ConnectionState>,
    want: ConnectionState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(state) if state == want => return true,
            Ok(state) => info!(state = ?state, "Session state changed"),
            Err(_) => return false,
        }
    }
}
