//! Session Registrar
//!
//! Turns "host a room" and "find a room" into directory entries and keeps
//! them alive. All timers (heartbeat, sweep, discovery) are tokio tasks owned
//! through `JoinHandle`s and aborted on teardown. Timers that write check the
//! active session token first so a stale timer never touches a newer session's
//! record.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::clock::Clock;
use crate::core::room_code::RoomCode;
use crate::directory::{Directory, RoomPatch, RoomRecord, RoomStatus};
use crate::network::session::{Notification, SessionError};

/// Attempts at finding an unused room code.
pub const MAX_CODE_ATTEMPTS: usize = 5;

/// Identifies the session that currently owns this client's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Uuid);

impl SessionToken {
    /// Fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Registrar timing.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Heartbeat period while hosting.
    pub heartbeat_interval: Duration,
    /// Records older than this since their last heartbeat are stale.
    pub liveness_window: Duration,
    /// Expired-room sweep period; `None` disables the sweep timer.
    pub sweep_interval: Option<Duration>,
    /// Records created longer ago than this are swept even if live.
    pub max_room_age: Duration,
    /// Open-room polling period for discovery.
    pub discovery_interval: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(12),
            liveness_window: Duration::from_secs(120),
            sweep_interval: Some(Duration::from_secs(60)),
            max_room_age: Duration::from_secs(24 * 60 * 60),
            discovery_interval: Duration::from_secs(5),
        }
    }
}

/// A room that resolved to a dialable host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    /// Directory record at resolution time.
    pub record: RoomRecord,
    /// WebSocket URL to dial.
    pub endpoint: String,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// DIRECTORY QUERIES
// =============================================================================

/// Directory access shared with timer tasks.
#[derive(Clone)]
struct Rooms {
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
    liveness_ms: i64,
    max_age_ms: i64,
}

impl Rooms {
    async fn list_open(&self) -> Result<Vec<RoomRecord>, SessionError> {
        let now = self.clock.now_ms();
        let rows = self.directory.list_where(&|_| true).await?;

        let mut open = Vec::new();
        for row in rows {
            if !row.is_live(now, self.liveness_ms) {
                // Opportunistic reaping; delete is idempotent
                debug!(room = %row.room_code, "Reaping expired room");
                if let Err(e) = self.directory.delete(&row.room_code).await {
                    debug!(room = %row.room_code, "Reap failed: {}", e);
                }
                continue;
            }
            if row.status == RoomStatus::Waiting {
                open.push(row);
            }
        }
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.room_code.cmp(&b.room_code)));
        Ok(open)
    }

    async fn sweep(&self) -> Result<usize, SessionError> {
        let now = self.clock.now_ms();
        let liveness_ms = self.liveness_ms;
        let max_age_ms = self.max_age_ms;
        let stale = self
            .directory
            .list_where(&move |r| !r.is_live(now, liveness_ms) || r.age_ms(now) >= max_age_ms)
            .await?;

        let mut removed = 0;
        for row in &stale {
            self.directory.delete(&row.room_code).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "Swept expired rooms");
        }
        Ok(removed)
    }
}

struct HostedRoom {
    record: RoomRecord,
    status: watch::Sender<RoomStatus>,
    heartbeat: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    sweep: Option<JoinHandle<()>>,
    discovery: Option<JoinHandle<()>>,
}

// =============================================================================
// SESSION REGISTRAR
// =============================================================================

/// Room advertisement and liveness for one client.
pub struct SessionRegistrar {
    rooms: Rooms,
    config: RegistrarConfig,
    owner: watch::Sender<Option<SessionToken>>,
    hosted: Mutex<Option<HostedRoom>>,
    timers: Mutex<Timers>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionRegistrar {
    /// Create a registrar over `directory`.
    pub fn new(directory: Arc<dyn Directory>, clock: Arc<dyn Clock>, config: RegistrarConfig) -> Self {
        let (owner, _) = watch::channel(None);
        Self {
            rooms: Rooms {
                directory,
                clock,
                liveness_ms: millis(config.liveness_window),
                max_age_ms: millis(config.max_room_age),
            },
            config,
            owner,
            hosted: Mutex::new(None),
            timers: Mutex::new(Timers::default()),
        }
    }

    /// Timing in use.
    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Backing directory.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.rooms.directory
    }

    /// Current time on the registrar's clock.
    pub fn now_ms(&self) -> i64 {
        self.rooms.clock.now_ms()
    }

    // -------------------------------------------------------------------------
    // Ownership
    // -------------------------------------------------------------------------

    /// Make `token` the active session. Fails while another session holds it.
    pub fn claim(&self, token: SessionToken) -> Result<(), SessionError> {
        let mut claimed = false;
        self.owner.send_if_modified(|current| match current {
            Some(_) => false,
            None => {
                *current = Some(token);
                claimed = true;
                true
            }
        });
        if claimed {
            debug!(session = %token, "Session claimed");
            Ok(())
        } else {
            Err(SessionError::AlreadyInSession)
        }
    }

    /// Give up ownership if `token` holds it.
    pub fn release(&self, token: SessionToken) {
        let released = self.owner.send_if_modified(|current| {
            if *current == Some(token) {
                *current = None;
                true
            } else {
                false
            }
        });
        if released {
            debug!(session = %token, "Session released");
        }
    }

    /// Active session token.
    pub fn owner(&self) -> Option<SessionToken> {
        *self.owner.borrow()
    }

    fn is_owner(&self, token: SessionToken) -> bool {
        self.owner() == Some(token)
    }

    // -------------------------------------------------------------------------
    // Hosting
    // -------------------------------------------------------------------------

    /// Pick a room code not present in the directory.
    pub async fn allocate_code(&self) -> RoomCode {
        let mut rng = rand::rngs::StdRng::from_entropy();
        self.allocate_code_with(&mut rng).await
    }

    /// [`allocate_code`](Self::allocate_code) with a caller-supplied generator.
    ///
    /// Up to [`MAX_CODE_ATTEMPTS`] candidates are checked. If the directory
    /// cannot be read the current candidate is used as is.
    pub async fn allocate_code_with<R: Rng + Send>(&self, rng: &mut R) -> RoomCode {
        let mut candidate = RoomCode::generate(rng);
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            match self.rooms.directory.get(&candidate).await {
                Ok(None) => return candidate,
                Ok(Some(_)) => {
                    debug!(room = %candidate, attempt, "Room code taken");
                    candidate = RoomCode::generate(rng);
                }
                Err(e) => {
                    warn!(room = %candidate, "Could not check room code: {}", e);
                    return candidate;
                }
            }
        }
        warn!(room = %candidate, "No free room code after {} attempts", MAX_CODE_ATTEMPTS);
        candidate
    }

    /// Advertise `code` as a `Waiting` room and start its heartbeat.
    ///
    /// A failed write is logged, not returned; the heartbeat re-advertises.
    #[instrument(skip(self, display_name, accent_color))]
    pub async fn host_room(
        &self,
        token: SessionToken,
        code: RoomCode,
        display_name: &str,
        accent_color: &str,
        endpoint: Option<String>,
    ) -> Result<RoomCode, SessionError> {
        if !self.is_owner(token) {
            return Err(SessionError::AlreadyInSession);
        }
        if lock(&self.hosted).is_some() {
            return Err(SessionError::AlreadyInSession);
        }

        let record = RoomRecord::waiting(code.clone(), display_name, accent_color, endpoint, self.rooms.clock.now_ms());
        if let Err(e) = self.rooms.directory.put(record.clone()).await {
            warn!("Could not advertise room, heartbeat will retry: {}", e);
        }

        let (status, status_rx) = watch::channel(RoomStatus::Waiting);
        let heartbeat = self.spawn_heartbeat(token, record.clone(), status_rx);

        let mut hosted = lock(&self.hosted);
        if let Some(previous) = hosted.replace(HostedRoom { record, status, heartbeat }) {
            previous.heartbeat.abort();
        }
        info!("Room hosted");
        Ok(code)
    }

    fn spawn_heartbeat(
        &self,
        token: SessionToken,
        record: RoomRecord,
        status: watch::Receiver<RoomStatus>,
    ) -> JoinHandle<()> {
        let rooms = self.rooms.clone();
        let owner = self.owner.subscribe();
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the record was just written
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if *owner.borrow() != Some(token) {
                    debug!(room = %record.room_code, "Heartbeat outlived its session, stopping");
                    break;
                }

                let current = *status.borrow();
                let now = rooms.clock.now_ms();
                match rooms.directory.patch(&record.room_code, RoomPatch::heartbeat(current, now)).await {
                    Ok(true) => debug!(room = %record.room_code, status = ?current, "Heartbeat"),
                    Ok(false) => {
                        warn!(room = %record.room_code, "Room record missing, re-advertising");
                        let mut fresh = record.clone();
                        fresh.status = current;
                        fresh.last_seen = now;
                        // Restart the age limit or the next sweep deletes it again
                        fresh.created_at = now;
                        if let Err(e) = rooms.directory.put(fresh).await {
                            warn!(room = %record.room_code, "Re-advertise failed: {}", e);
                        }
                    }
                    Err(e) => warn!(room = %record.room_code, "Heartbeat failed, will retry: {}", e),
                }
            }
        })
    }

    /// Code of the room being hosted.
    pub fn hosted_room(&self) -> Option<RoomCode> {
        lock(&self.hosted).as_ref().map(|h| h.record.room_code.clone())
    }

    /// Status of the room being hosted.
    pub fn hosted_status(&self) -> Option<RoomStatus> {
        lock(&self.hosted).as_ref().map(|h| *h.status.borrow())
    }

    /// A guest attached.
    pub async fn mark_playing(&self, code: &RoomCode) -> Result<(), SessionError> {
        self.set_status(code, RoomStatus::Playing).await
    }

    /// The guest left; the room is open again.
    pub async fn mark_waiting(&self, code: &RoomCode) -> Result<(), SessionError> {
        self.set_status(code, RoomStatus::Waiting).await
    }

    async fn set_status(&self, code: &RoomCode, status: RoomStatus) -> Result<(), SessionError> {
        {
            let hosted = lock(&self.hosted);
            match hosted.as_ref() {
                Some(room) if &room.record.room_code == code => {
                    room.status.send_replace(status);
                }
                _ => return Err(SessionError::NotHosting),
            }
        }

        let now = self.rooms.clock.now_ms();
        match self.rooms.directory.patch(code, RoomPatch::heartbeat(status, now)).await {
            Ok(true) => info!(room = %code, status = ?status, "Room status changed"),
            Ok(false) => debug!(room = %code, "Room record missing, heartbeat will restore it"),
            Err(e) => warn!(room = %code, "Status update failed, heartbeat will retry: {}", e),
        }
        Ok(())
    }

    /// Stop the heartbeat and delete the record. Best effort: a failed delete
    /// is logged and the record expires by `lastSeen`.
    #[instrument(skip(self))]
    pub async fn leave_room(&self, code: &RoomCode) -> Result<(), SessionError> {
        let room = {
            let mut hosted = lock(&self.hosted);
            if hosted.as_ref().map(|r| &r.record.room_code) == Some(code) {
                hosted.take()
            } else {
                None
            }
        };
        let Some(room) = room else {
            return Err(SessionError::NotHosting);
        };
        room.heartbeat.abort();

        if let Err(e) = self.rooms.directory.delete(code).await {
            warn!("Could not delete room, it will expire: {}", e);
        } else {
            info!("Room removed");
        }
        Ok(())
    }

    /// Stop the heartbeat without touching the directory.
    pub fn abandon_hosting(&self) {
        if let Some(room) = lock(&self.hosted).take() {
            room.heartbeat.abort();
            debug!(room = %room.record.room_code, "Hosting abandoned");
        }
    }

    // -------------------------------------------------------------------------
    // Discovery
    // -------------------------------------------------------------------------

    /// Live `Waiting` rooms, newest first. Expired rows seen along the way
    /// are deleted.
    pub async fn list_open_rooms(&self) -> Result<Vec<RoomRecord>, SessionError> {
        self.rooms.list_open().await
    }

    /// Look up a room for joining.
    pub async fn resolve_for_join(&self, code: &RoomCode) -> Result<JoinTarget, SessionError> {
        let record = self
            .rooms
            .directory
            .get(code)
            .await?
            .ok_or(SessionError::RoomNotFound)?;

        if !record.is_live(self.rooms.clock.now_ms(), self.rooms.liveness_ms) {
            debug!(room = %code, "Room expired");
            return Err(SessionError::RoomNotFound);
        }
        if record.status == RoomStatus::Playing {
            return Err(SessionError::RoomFull);
        }
        let endpoint = record.endpoint.clone().ok_or(SessionError::RoomNotFound)?;
        Ok(JoinTarget { record, endpoint })
    }

    /// Delete every record past the liveness window or older than the
    /// maximum room age. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, SessionError> {
        self.rooms.sweep().await
    }

    /// Run [`sweep_expired`](Self::sweep_expired) periodically while `token`
    /// owns the client. No-op when the sweep interval is disabled.
    pub fn start_sweeper(&self, token: SessionToken) {
        let Some(period) = self.config.sweep_interval else {
            return;
        };
        let rooms = self.rooms.clone();
        let owner = self.owner.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *owner.borrow() != Some(token) {
                    debug!("Sweeper outlived its session, stopping");
                    break;
                }
                if let Err(e) = rooms.sweep().await {
                    warn!("Sweep failed, will retry: {}", e);
                }
            }
        });

        if let Some(previous) = lock(&self.timers).sweep.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the sweep timer.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = lock(&self.timers).sweep.take() {
            handle.abort();
        }
    }

    /// Poll the open-room list and publish [`Notification::RoomsChanged`]
    /// whenever it changes. The first poll always publishes.
    pub fn start_discovery(&self, notifier: broadcast::Sender<Notification>) {
        let rooms = self.rooms.clone();
        let period = self.config.discovery_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Vec<(RoomCode, RoomStatus, String)>> = None;
            loop {
                ticker.tick().await;
                let open = match rooms.list_open().await {
                    Ok(open) => open,
                    Err(e) => {
                        debug!("Discovery poll failed: {}", e);
                        continue;
                    }
                };
                let fingerprint: Vec<_> = open
                    .iter()
                    .map(|r| (r.room_code.clone(), r.status, r.display_name.clone()))
                    .collect();
                if last.as_ref() != Some(&fingerprint) {
                    debug!(rooms = open.len(), "Open rooms changed");
                    let _ = notifier.send(Notification::RoomsChanged(open));
                    last = Some(fingerprint);
                }
            }
        });

        if let Some(previous) = lock(&self.timers).discovery.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the discovery timer.
    pub fn stop_discovery(&self) {
        if let Some(handle) = lock(&self.timers).discovery.take() {
            handle.abort();
        }
    }

    /// `true` while the discovery timer runs.
    pub fn is_discovering(&self) -> bool {
        lock(&self.timers)
            .discovery
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SessionRegistrar {
    fn drop(&mut self) {
        self.abandon_hosting();
        self.stop_sweeper();
        self.stop_discovery();
    }
}
