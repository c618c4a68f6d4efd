//! The presence session.
//!
//! One worker thread owns the socket, the handshake, and every state
//! transition; the public entry points only flip the enabled flag and
//! enqueue commands, so callers never block on socket I/O. Timers are
//! deadlines computed inside the worker's receive loop rather than OS
//! timers, which makes `disable()` cancellation a matter of clearing two
//! fields. Reader threads are per-connection and tagged with an epoch so
//! a straggler from a torn-down connection cannot disturb its successor.

use std::cmp;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use overtone_presence_wire::{
    decode_frame, encode_frame, HandshakeRequest, Opcode, ProtocolError, SetActivity,
};

use crate::activity::{clear_activity, listening_activity, NowPlaying};
use crate::artwork::{cache_key, ArtworkCache, ArtworkQuery};
use crate::config::PresenceConfig;
use crate::error::{PresenceError, Result};
use crate::locator::{candidate_directories, socket_path, SOCKET_SLOTS};
use crate::reconnect::ReconnectPolicy;

/// Externally observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type StateObserver = Box<dyn Fn(ConnectionState) + Send>;

enum Command {
    Enable,
    Disable,
    Publish(NowPlaying),
    Clear,
    ArtworkResolved { key: String, url: Option<String> },
    RemoteClosed { epoch: u64 },
    Shutdown,
}

struct Shared {
    enabled: AtomicBool,
    state: Mutex<ConnectionState>,
    observers: Mutex<Vec<StateObserver>>,
}

/// Handle to the session worker. Dropping it shuts the worker down and
/// closes any live connection.
pub struct PresenceSession {
    config: PresenceConfig,
    tx: Sender<Command>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    notifier: Option<JoinHandle<()>>,
}

impl PresenceSession {
    /// Starts the worker and notifier threads. The session begins
    /// disabled and `Disconnected`.
    pub fn spawn(config: PresenceConfig, artwork: Arc<ArtworkCache>) -> Self {
        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Disconnected),
            observers: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel();
        let (state_tx, state_rx) = mpsc::channel();

        let notifier_shared = Arc::clone(&shared);
        let notifier = thread::spawn(move || notify_loop(state_rx, notifier_shared));

        let worker = {
            let config = config.clone();
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            thread::spawn(move || Worker::new(config, artwork, shared, tx, state_tx, rx).run())
        };

        Self {
            config,
            tx,
            shared,
            worker: Some(worker),
            notifier: Some(notifier),
        }
    }

    /// Current session state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// Registers a state observer. Observers run on a dedicated
    /// notification thread, never on the worker or the registering caller.
    pub fn on_state_change(&self, observer: impl Fn(ConnectionState) + Send + 'static) {
        self.shared.observers.lock().unwrap().push(Box::new(observer));
    }

    /// Turns the session on and starts a connect cycle. No-op when a
    /// cycle is already running or the session is connected.
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Command::Enable);
    }

    /// Turns the session off. The flag flips before this returns, so any
    /// deadline that fires afterwards finds the session disabled and does
    /// not connect; an in-flight connect attempt may still complete, but
    /// its socket is discarded.
    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Command::Disable);
    }

    /// Publishes a now-playing observation. Silently ignored unless the
    /// session is connected.
    pub fn publish(&self, playing: NowPlaying) {
        let _ = self.tx.send(Command::Publish(playing));
    }

    /// Clears the published activity. Silently ignored unless the session
    /// is connected.
    pub fn clear(&self) {
        let _ = self.tx.send(Command::Clear);
    }

    /// Runs one connect + handshake + disconnect probe on a fresh socket,
    /// never touching the live session. The completion callback runs on a
    /// one-off thread.
    pub fn test_connection<F>(&self, completion: F)
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        let config = self.config.clone();
        thread::spawn(move || completion(run_connection_test(&config)));
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(notifier) = self.notifier.take() {
            let _ = notifier.join();
        }
    }
}

struct Connection {
    stream: UnixStream,
    path: PathBuf,
    epoch: u64,
}

struct Worker {
    config: PresenceConfig,
    artwork: Arc<ArtworkCache>,
    shared: Arc<Shared>,
    tx: Sender<Command>,
    state_tx: Sender<ConnectionState>,
    rx: Receiver<Command>,
    conn: Option<Connection>,
    policy: ReconnectPolicy,
    epoch: u64,
    last_published: Option<(NowPlaying, String)>,
    retry_at: Option<Instant>,
    poll_at: Option<Instant>,
    pid: u32,
}

impl Worker {
    fn new(
        config: PresenceConfig,
        artwork: Arc<ArtworkCache>,
        shared: Arc<Shared>,
        tx: Sender<Command>,
        state_tx: Sender<ConnectionState>,
        rx: Receiver<Command>,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect);
        Self {
            config,
            artwork,
            shared,
            tx,
            state_tx,
            rx,
            conn: None,
            policy,
            epoch: 0,
            last_published: None,
            retry_at: None,
            poll_at: None,
            pid: std::process::id(),
        }
    }

    fn run(mut self) {
        loop {
            let command = match self.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.handle_deadlines(now);
                        continue;
                    }
                    match self.rx.recv_timeout(deadline - now) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => {
                            self.handle_deadlines(Instant::now());
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Enable => self.handle_enable(),
                Command::Disable => self.handle_disable(),
                Command::Publish(playing) => self.handle_publish(playing),
                Command::Clear => self.handle_clear(),
                Command::ArtworkResolved { key, url } => self.handle_artwork_resolved(key, url),
                Command::RemoteClosed { epoch } => self.handle_remote_closed(epoch),
                Command::Shutdown => break,
            }
        }
        self.teardown();
    }

    fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// Updates the shared state and queues the notification; observers
    /// hear about it on the notifier thread, never inline here.
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == next {
            return;
        }
        *state = next;
        drop(state);
        let _ = self.state_tx.send(next);
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.retry_at, self.poll_at) {
            (Some(retry), Some(poll)) => Some(cmp::min(retry, poll)),
            (Some(retry), None) => Some(retry),
            (None, Some(poll)) => Some(poll),
            (None, None) => None,
        }
    }

    /// Fires whichever deadlines are due. The retry deadline is one-shot;
    /// the availability poll re-arms at its fixed cadence.
    fn handle_deadlines(&mut self, now: Instant) {
        if !self.enabled() || self.state() != ConnectionState::Disconnected {
            self.retry_at = None;
            self.poll_at = None;
            return;
        }

        let mut due = false;
        if let Some(at) = self.retry_at {
            if at <= now {
                self.retry_at = None;
                due = true;
            }
        }
        if let Some(at) = self.poll_at {
            if at <= now {
                self.poll_at = Some(now + self.config.poll_interval);
                due = true;
            }
        }
        if due {
            self.try_connect();
        }
    }

    fn handle_enable(&mut self) {
        if !self.enabled() {
            return;
        }
        if self.state() != ConnectionState::Disconnected {
            return;
        }
        if !self.config.is_configured() {
            warn!("Presence enabled without a client id; staying disconnected");
            return;
        }
        self.try_connect();
    }

    fn handle_disable(&mut self) {
        self.retry_at = None;
        self.poll_at = None;
        if let Some(conn) = self.conn.take() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
        self.last_published = None;
        self.set_state(ConnectionState::Disconnected);
        info!("Presence session disabled");
    }

    /// One full connect cycle. On failure the session returns to
    /// `Disconnected` and the retry/poll deadlines are armed.
    fn try_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        match self.connect_once() {
            Some(conn) => {
                if !self.enabled() {
                    // disable() arrived while the handshake was in flight.
                    let _ = conn.stream.shutdown(Shutdown::Both);
                    info!(
                        path = %conn.path.display(),
                        "Discarding fresh connection; session was disabled mid-connect"
                    );
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                info!(path = %conn.path.display(), "Presence session connected");
                self.policy.reset();
                self.retry_at = None;
                self.poll_at = None;
                self.spawn_reader(&conn);
                self.conn = Some(conn);
                self.set_state(ConnectionState::Connected);
            }
            None => {
                self.set_state(ConnectionState::Disconnected);
                if self.enabled() {
                    self.schedule_retry();
                }
            }
        }
    }

    /// Probes every candidate directory and socket slot, stopping at the
    /// first endpoint that accepts the handshake. Individual candidate
    /// failures are expected while Discord is absent and stay at debug.
    fn connect_once(&mut self) -> Option<Connection> {
        let directories = candidate_directories(&self.config);
        if directories.is_empty() {
            debug!("No candidate socket directories; remote unavailable");
            return None;
        }
        for directory in &directories {
            for slot in SOCKET_SLOTS {
                if !self.enabled() {
                    return None;
                }
                let path = socket_path(directory, slot);
                match open_candidate(&path, &self.config.client_id, self.config.handshake_timeout) {
                    Ok(stream) => {
                        self.epoch += 1;
                        return Some(Connection {
                            stream,
                            path,
                            epoch: self.epoch,
                        });
                    }
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "Socket candidate failed");
                    }
                }
            }
        }
        None
    }

    fn schedule_retry(&mut self) {
        let delay = self.policy.next_delay();
        let now = Instant::now();
        self.retry_at = Some(now + delay);
        if self.poll_at.is_none() {
            self.poll_at = Some(now + self.config.poll_interval);
        }
        debug!(delay_secs = delay.as_secs_f64(), "Reconnect scheduled");
    }

    /// Watches the connection for remote closure on its own thread so the
    /// worker never blocks on reads. The watcher only reports back; every
    /// state change stays on the worker.
    fn spawn_reader(&self, conn: &Connection) {
        let stream = match conn.stream.try_clone() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "Could not clone stream for the close watcher");
                return;
            }
        };
        let tx = self.tx.clone();
        let epoch = conn.epoch;
        thread::spawn(move || read_loop(stream, tx, epoch));
    }

    fn handle_remote_closed(&mut self, epoch: u64) {
        if self.conn.as_ref().map(|conn| conn.epoch) != Some(epoch) {
            return; // stale watcher from an earlier connection
        }
        info!("Remote endpoint closed the session");
        self.drop_connection();
    }

    /// Discards the socket, transitions to `Disconnected`, and arms the
    /// reconnect deadlines when the session is still enabled.
    fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
        self.last_published = None;
        self.set_state(ConnectionState::Disconnected);
        if self.enabled() {
            self.schedule_retry();
        }
    }

    fn handle_publish(&mut self, playing: NowPlaying) {
        if self.conn.is_none() {
            debug!("Ignoring publish while disconnected");
            return;
        }

        let artwork = match self.artwork.query(&playing.artist, &playing.track) {
            ArtworkQuery::Hit(url) => url,
            ArtworkQuery::MissStarted => {
                self.spawn_artwork_lookup(playing.artist.clone(), playing.track.clone());
                None
            }
            ArtworkQuery::MissPending => None,
        };

        let key = cache_key(&playing.artist, &playing.track);
        let payload = listening_activity(
            &playing,
            artwork.as_deref(),
            Utc::now().timestamp_millis(),
            self.pid,
        );
        info!(track = %playing.track, artist = %playing.artist, "Publishing activity");
        self.last_published = Some((playing, key));
        self.send_payload(&payload);
    }

    fn handle_clear(&mut self) {
        if self.conn.is_none() {
            debug!("Ignoring clear while disconnected");
            return;
        }
        self.last_published = None;
        let payload = clear_activity(self.pid);
        info!("Clearing activity");
        self.send_payload(&payload);
    }

    /// Resolves artwork off the worker; the outcome comes back as a
    /// command so the freshness check and any re-publish stay serialized.
    fn spawn_artwork_lookup(&self, artist: String, track: String) {
        let cache = Arc::clone(&self.artwork);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let url = cache.fetch_and_store(&artist, &track);
            let _ = tx.send(Command::ArtworkResolved {
                key: cache_key(&artist, &track),
                url,
            });
        });
    }

    /// Re-publishes with resolved artwork, but only when the session is
    /// still connected and the track in question is still the one on
    /// display. A lookup that resolved to nothing changes nothing; the
    /// fallback asset is already on the wire.
    fn handle_artwork_resolved(&mut self, key: String, url: Option<String>) {
        if self.conn.is_none() {
            return;
        }
        let Some(url) = url else {
            return;
        };
        let playing = match self.last_published.as_ref() {
            Some((playing, current_key)) if *current_key == key => playing.clone(),
            _ => {
                debug!("Artwork resolved for a track that is no longer current");
                return;
            }
        };
        let payload = listening_activity(
            &playing,
            Some(&url),
            Utc::now().timestamp_millis(),
            self.pid,
        );
        info!(track = %playing.track, "Re-publishing with resolved artwork");
        self.send_payload(&payload);
    }

    /// Encodes and writes one payload frame. A write failure tears the
    /// connection down and arms the reconnect deadlines.
    fn send_payload(&mut self, payload: &SetActivity) {
        let frame = match encode_frame(Opcode::Frame, payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Could not encode activity payload");
                return;
            }
        };
        let result = match self.conn.as_mut() {
            Some(conn) => conn.stream.write_all(&frame),
            None => return,
        };
        if let Err(err) = result {
            warn!(error = %err, "Write failed; dropping connection");
            self.drop_connection();
        }
    }

    fn teardown(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Connects to one socket path and runs the handshake. A `Close` reply or
/// any read failure rejects the candidate; any other frame counts as the
/// acknowledgement (its body is deliberately not validated, the protocol
/// gives us nothing actionable in it).
fn open_candidate(path: &Path, client_id: &str, handshake_timeout: Duration) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(path)?;
    let frame = encode_frame(Opcode::Handshake, &HandshakeRequest::new(client_id))?;
    stream.write_all(&frame)?;
    stream.set_read_timeout(Some(handshake_timeout))?;
    match decode_frame(&mut stream) {
        Ok((Opcode::Close, body)) => Err(PresenceError::HandshakeRejected {
            path: path.to_path_buf(),
            reason: close_reason(body),
        }),
        Ok((_, _)) => {
            stream.set_read_timeout(None)?;
            Ok(stream)
        }
        Err(err) => Err(err.into()),
    }
}

fn close_reason(body: Option<Value>) -> String {
    body.as_ref()
        .and_then(|value| value.get("message"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "remote sent close".to_string())
}

/// Blocks on the cloned stream and reports remote closure back to the
/// worker. Inbound event frames are not part of our surface and are
/// dropped here, as are frames whose bodies failed to parse.
fn read_loop(mut stream: UnixStream, tx: Sender<Command>, epoch: u64) {
    loop {
        match decode_frame(&mut stream) {
            Ok((Opcode::Close, _)) => {
                let _ = tx.send(Command::RemoteClosed { epoch });
                return;
            }
            Ok((opcode, _)) => {
                debug!(opcode = ?opcode, "Ignoring inbound frame");
            }
            Err(ProtocolError::UnknownOpcode(raw)) => {
                debug!(opcode = raw, "Dropping frame with unknown opcode");
            }
            Err(_) => {
                let _ = tx.send(Command::RemoteClosed { epoch });
                return;
            }
        }
    }
}

fn notify_loop(rx: Receiver<ConnectionState>, shared: Arc<Shared>) {
    while let Ok(state) = rx.recv() {
        let observers = shared.observers.lock().unwrap();
        for observer in observers.iter() {
            observer(state);
        }
    }
}

/// One-shot diagnostics: discovery, connect, handshake, disconnect. Runs
/// on its own socket and reports the first success or the most telling
/// failure. Plain connection refusals (no Discord listening) surface as
/// [`PresenceError::RemoteUnavailable`]; an endpoint that answered but
/// rejected us is reported as what it said.
pub fn run_connection_test(config: &PresenceConfig) -> Result<String> {
    if !config.is_configured() {
        return Err(PresenceError::MissingClientId);
    }
    let directories = candidate_directories(config);
    if directories.is_empty() {
        return Err(PresenceError::RemoteUnavailable);
    }

    let mut rejection: Option<PresenceError> = None;
    for directory in &directories {
        for slot in SOCKET_SLOTS {
            let path = socket_path(directory, slot);
            match open_candidate(&path, &config.client_id, config.handshake_timeout) {
                Ok(stream) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return Ok(format!("handshake accepted on {}", path.display()));
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "Socket candidate failed");
                    if matches!(
                        err,
                        PresenceError::HandshakeRejected { .. } | PresenceError::Protocol(_)
                    ) {
                        rejection = Some(err);
                    }
                }
            }
        }
    }
    Err(rejection.unwrap_or(PresenceError::RemoteUnavailable))
}
