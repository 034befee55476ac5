//! Session and Lobby
//!
//! [`Lobby`] is the client's entry point: it lists rooms and creates at most
//! one [`Session`] at a time by hosting or joining. A session wires the
//! connection manager, the registrar and the synchronizer together and turns
//! connection events into board updates and room status changes.
//!
//! Callers drive a session by awaiting [`Session::handle_next_event`] in their
//! event loop and calling [`Session::apply_local_move`] for local input.
//! Everything observable is also published as a [`Notification`].

use std::sync::Arc;
use serde::{Serialize, Deserialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::board::{BoardState, Coord, Side};
use crate::core::clock::{Clock, SystemClock};
use crate::core::room_code::{RoomCode, RoomCodeError};
use crate::directory::{Directory, DirectoryError, RoomRecord};
use crate::network::connection::{
    ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState,
};
use crate::network::protocol::PeerMessage;
use crate::network::recent::{RecentRoom, RecentRooms};
use crate::network::registrar::{SessionRegistrar, SessionToken};
use crate::network::sync::{MoveOutcome, RemoteApply, StateSynchronizer};

/// Capacity of the notification channel.
const NOTIFICATION_CAPACITY: usize = 64;

/// Session failures surfaced to the user.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Directory could not be reached. Retried on the next timer tick.
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// No live room under that code.
    #[error("No such room")]
    RoomNotFound,

    /// The room already has a guest.
    #[error("Room is full")]
    RoomFull,

    /// Dial did not complete in time.
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// Host unreachable or refused the connection.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// This client already has an active session.
    #[error("Already in a session")]
    AlreadyInSession,

    /// Operation needs a hosted room this client does not host.
    #[error("Not hosting this room")]
    NotHosting,

    /// Room code failed to parse.
    #[error("Invalid room code: {0}")]
    InvalidRoomCode(#[from] RoomCodeError),
}

impl From<DirectoryError> for SessionError {
    fn from(e: DirectoryError) -> Self {
        SessionError::DirectoryUnavailable(e.to_string())
    }
}

impl From<ConnectionError> for SessionError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Timeout(_) => SessionError::ConnectionTimeout,
            ConnectionError::RoomFull => SessionError::RoomFull,
            ConnectionError::AlreadyOpen => SessionError::AlreadyInSession,
            ConnectionError::Refused(reason) => SessionError::ConnectionRefused(reason),
            ConnectionError::Bind(e) => SessionError::ConnectionRefused(format!("cannot listen: {e}")),
        }
    }
}

/// Upward notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Open-room list changed.
    RoomsChanged(Vec<RoomRecord>),
    /// Peer channel state changed. `Closed` here means the peer went away;
    /// the session is still alive.
    ConnectivityChanged(ConnectionState),
    /// Board changed, locally or from the peer.
    BoardChanged(BoardState),
}

/// Which end of the session this client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Created the room; plays White and moves first.
    Host,
    /// Joined the room; plays Black.
    Guest,
}

impl Role {
    /// Side played by this role.
    pub const fn local_side(self) -> Side {
        match self {
            Role::Host => Side::White,
            Role::Guest => Side::Black,
        }
    }
}

/// Releases a claimed session token unless disarmed.
struct ClaimGuard {
    registrar: Arc<SessionRegistrar>,
    token: SessionToken,
    armed: bool,
}

impl ClaimGuard {
    fn claim(registrar: &Arc<SessionRegistrar>) -> Result<Self, SessionError> {
        let token = SessionToken::new();
        registrar.claim(token)?;
        Ok(Self {
            registrar: registrar.clone(),
            token,
            armed: true,
        })
    }

    fn disarm(mut self) -> SessionToken {
        self.armed = false;
        self.token
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registrar.release(self.token);
        }
    }
}

// =============================================================================
// LOBBY
// =============================================================================

/// Room discovery and session creation for one client.
pub struct Lobby {
    config: ClientConfig,
    registrar: Arc<SessionRegistrar>,
    recent: Arc<RecentRooms>,
    notifier: broadcast::Sender<Notification>,
}

impl Lobby {
    /// Lobby over the configured directory backend and the system clock.
    pub fn new(config: ClientConfig) -> Self {
        let directory = config.directory.open();
        Self::with_parts(config, directory, Arc::new(SystemClock))
    }

    /// Lobby over an explicit directory and clock.
    pub fn with_parts(config: ClientConfig, directory: Arc<dyn Directory>, clock: Arc<dyn Clock>) -> Self {
        let registrar = Arc::new(SessionRegistrar::new(directory, clock, config.registrar_config()));
        let recent = Arc::new(RecentRooms::new(config.recent_rooms.clone()));
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            registrar,
            recent,
            notifier,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared registrar.
    pub fn registrar(&self) -> &Arc<SessionRegistrar> {
        &self.registrar
    }

    /// Rooms this client hosted or joined and has not left.
    pub async fn recent_rooms(&self) -> Result<Vec<RecentRoom>, SessionError> {
        Ok(self.recent.list().await?)
    }

    /// Receive notifications from this lobby and its sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Rooms currently open for joining.
    pub async fn list_open_rooms(&self) -> Result<Vec<RoomRecord>, SessionError> {
        self.registrar.list_open_rooms().await
    }

    /// Start publishing [`Notification::RoomsChanged`].
    pub fn start_discovery(&self) {
        self.registrar.start_discovery(self.notifier.clone());
    }

    /// Stop publishing room changes.
    pub fn stop_discovery(&self) {
        self.registrar.stop_discovery();
    }

    /// Create and advertise a room, then wait for a guest in the background.
    #[instrument(skip(self))]
    pub async fn host_room(&self, display_name: &str, accent_color: &str) -> Result<Session, SessionError> {
        let claim = ClaimGuard::claim(&self.registrar)?;

        let code = self.registrar.allocate_code().await;
        let (mut connection, events) = ConnectionManager::new(self.config.connection_config());
        let addr = connection
            .listen_for_incoming(self.config.bind_addr, code.clone())
            .await?;
        let endpoint = format!("ws://{}:{}", self.config.advertise_host, addr.port());

        self.registrar
            .host_room(claim.token, code.clone(), display_name, accent_color, Some(endpoint.clone()))
            .await?;

        let token = claim.disarm();
        self.registrar.start_sweeper(token);
        info!(room = %code, endpoint = %endpoint, "Hosting");
        self.remember(&code, Role::Host, &endpoint, display_name).await;

        let mut sync = StateSynchronizer::new(Role::Host.local_side(), connection.handle());
        let board = sync.initialize_as_host().clone();
        let session = Session {
            token,
            role: Role::Host,
            room_code: code,
            endpoint,
            registrar: self.registrar.clone(),
            recent: self.recent.clone(),
            connection,
            events,
            sync,
            notifier: self.notifier.clone(),
            peer_seen: false,
            finished: false,
        };
        session.notify(Notification::BoardChanged(board));
        Ok(session)
    }

    /// Join the room advertised under `code`.
    ///
    /// Dropping the returned future abandons the dial; the client is then free
    /// to host or join again.
    #[instrument(skip(self))]
    pub async fn join_room(&self, code: &str) -> Result<Session, SessionError> {
        let code = RoomCode::parse(code)?;
        let claim = ClaimGuard::claim(&self.registrar)?;

        let target = self.registrar.resolve_for_join(&code).await?;
        self.dial_as_guest(claim, code, target.endpoint, &target.record.display_name)
            .await
    }

    /// Rejoin a room from [`recent_rooms`](Self::recent_rooms) by dialing
    /// the remembered endpoint directly, without consulting the directory.
    /// Hosted rooms cannot be resumed: their listener went away with the
    /// session that created them, so the entry is dropped.
    #[instrument(skip(self))]
    pub async fn rejoin_recent(&self, code: &str) -> Result<Session, SessionError> {
        let code = RoomCode::parse(code)?;
        let claim = ClaimGuard::claim(&self.registrar)?;

        let entry = self.recent.get(&code).await?.ok_or(SessionError::RoomNotFound)?;
        if entry.role == Role::Host {
            info!(room = %code, "Hosted room cannot be resumed, forgetting it");
            self.recent.forget(&code).await?;
            return Err(SessionError::RoomNotFound);
        }
        self.dial_as_guest(claim, code, entry.endpoint, &entry.display_name)
            .await
    }

    async fn dial_as_guest(
        &self,
        claim: ClaimGuard,
        code: RoomCode,
        endpoint: String,
        host_name: &str,
    ) -> Result<Session, SessionError> {
        let (connection, events) = ConnectionManager::new(self.config.connection_config());
        connection.dial(&code, &endpoint).await?;

        let token = claim.disarm();
        self.registrar.start_sweeper(token);
        info!(room = %code, host = %host_name, "Joined");
        self.remember(&code, Role::Guest, &endpoint, host_name).await;

        let sync = StateSynchronizer::new(Role::Guest.local_side(), connection.handle());
        Ok(Session {
            token,
            role: Role::Guest,
            room_code: code,
            endpoint,
            registrar: self.registrar.clone(),
            recent: self.recent.clone(),
            connection,
            events,
            sync,
            notifier: self.notifier.clone(),
            peer_seen: false,
            finished: false,
        })
    }

    async fn remember(&self, code: &RoomCode, role: Role, endpoint: &str, display_name: &str) {
        let entry = RecentRoom {
            room_code: code.clone(),
            role,
            endpoint: endpoint.to_string(),
            display_name: display_name.to_string(),
            joined_at: self.registrar.now_ms(),
        };
        if let Err(e) = self.recent.remember(entry).await {
            warn!(room = %code, "Could not record recent room: {}", e);
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// One live two-party session. Role and side never change after creation.
pub struct Session {
    token: SessionToken,
    role: Role,
    room_code: RoomCode,
    /// Host: advertised endpoint. Guest: dialed endpoint.
    endpoint: String,
    registrar: Arc<SessionRegistrar>,
    recent: Arc<RecentRooms>,
    connection: ConnectionManager,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    sync: StateSynchronizer<ConnectionHandle>,
    notifier: broadcast::Sender<Notification>,
    /// A peer has been attached at least once.
    peer_seen: bool,
    finished: bool,
}

impl Session {
    /// Host or guest.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Side this client plays.
    pub fn local_side(&self) -> Side {
        self.sync.local_side()
    }

    /// Room this session belongs to.
    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    /// Host endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Peer channel state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Current board.
    pub fn board(&self) -> &BoardState {
        self.sync.board()
    }

    /// Synchronizer for this session.
    pub fn synchronizer(&self) -> &StateSynchronizer<ConnectionHandle> {
        &self.sync
    }

    fn notify(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.notifier.send(notification);
    }

    /// Move a local piece and send the result to the peer.
    pub fn apply_local_move(&mut self, from: Coord, to: Coord) -> MoveOutcome {
        let outcome = self.sync.apply_local_move(from, to);
        if outcome.is_accepted() {
            self.notify(Notification::BoardChanged(self.sync.board().clone()));
        }
        outcome
    }

    /// Wait for the next connection event and act on it. Returns the event,
    /// or `None` once the connection manager is gone.
    pub async fn handle_next_event(&mut self) -> Option<ConnectionEvent> {
        let event = self.events.recv().await?;
        self.process(&event).await;
        Some(event)
    }

    async fn process(&mut self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { peer } => {
                info!(room = %self.room_code, peer = %peer, "Peer attached");
                self.notify(Notification::ConnectivityChanged(ConnectionState::Open));
                if self.role == Role::Host {
                    if let Err(e) = self.registrar.mark_playing(&self.room_code).await {
                        warn!(room = %self.room_code, "Could not mark room playing: {}", e);
                    }
                    if self.peer_seen {
                        info!(room = %self.room_code, "Guest reattached, resyncing board");
                    }
                    self.sync.resync();
                }
                self.peer_seen = true;
            }
            ConnectionEvent::Message(PeerMessage::State { board }) => {
                if self.sync.apply_remote_state(board.clone()) == RemoteApply::Applied {
                    self.notify(Notification::BoardChanged(self.sync.board().clone()));
                }
            }
            ConnectionEvent::Message(other) => {
                debug!(room = %self.room_code, "Ignoring {} message on open channel", other.kind());
            }
            ConnectionEvent::Closed | ConnectionEvent::Error(_) => {
                let state = self.connection.state();
                info!(room = %self.room_code, state = %state, "Peer detached");
                self.notify(Notification::ConnectivityChanged(state));
                match self.role {
                    Role::Host => {
                        if let Err(e) = self.registrar.mark_waiting(&self.room_code).await {
                            warn!(room = %self.room_code, "Could not reopen room: {}", e);
                        }
                    }
                    Role::Guest => info!(room = %self.room_code, "Host unreachable, rejoin pending"),
                }
            }
        }
    }

    /// Drop the peer channel but keep the session. The peer sees a
    /// disconnect; a guest can [`rejoin`](Self::rejoin) later and a host
    /// reopens its room for the next guest.
    #[instrument(skip(self), fields(room = %self.room_code))]
    pub async fn disconnect(&mut self) {
        self.connection.close();
        self.notify(Notification::ConnectivityChanged(self.connection.state()));
        if self.role == Role::Host {
            if let Err(e) = self.registrar.mark_waiting(&self.room_code).await {
                warn!("Could not reopen room: {}", e);
            }
        }
    }

    /// Guest: dial the host again after a disconnect. The host resends its
    /// board once the channel opens. A host keeps listening on its own, so
    /// this is a no-op there.
    #[instrument(skip(self), fields(room = %self.room_code))]
    pub async fn rejoin(&mut self) -> Result<(), SessionError> {
        if self.role == Role::Host {
            debug!("Host sessions accept guests, nothing to dial");
            return Ok(());
        }
        if self.connection.state() == ConnectionState::Open {
            return Ok(());
        }
        self.notify(Notification::ConnectivityChanged(ConnectionState::Connecting));
        match self.connection.dial(&self.room_code, &self.endpoint).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.notify(Notification::ConnectivityChanged(ConnectionState::Errored));
                Err(e.into())
            }
        }
    }

    /// End the session: stop timers, close the channel, remove the room when
    /// hosting and free the client for a new session.
    #[instrument(skip(self), fields(room = %self.room_code))]
    pub async fn leave(mut self) {
        self.finished = true;
        self.registrar.stop_sweeper();
        self.connection.shutdown();
        if self.role == Role::Host {
            if let Err(e) = self.registrar.leave_room(&self.room_code).await {
                debug!("Room already gone: {}", e);
            }
        }
        if let Err(e) = self.recent.forget(&self.room_code).await {
            warn!("Could not forget recent room: {}", e);
        }
        self.registrar.release(self.token);
        self.notify(Notification::ConnectivityChanged(ConnectionState::Closed));
        info!("Session left");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Record is left to expire by lastSeen
        warn!(room = %self.room_code, "Session dropped without leaving");
        self.registrar.stop_sweeper();
        if self.role == Role::Host {
            self.registrar.abandon_hosting();
        }
        self.connection.shutdown();
        self.registrar.release(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::directory::MemoryDirectory;

    fn lobby(directory: &MemoryDirectory) -> Lobby {
        Lobby::with_parts(
            ClientConfig::default(),
            Arc::new(directory.clone()),
            Arc::new(ManualClock::new(1_000_000)),
        )
    }

    #[test]
    fn test_roles_fix_sides() {
        assert_eq!(Role::Host.local_side(), Side::White);
        assert_eq!(Role::Guest.local_side(), Side::Black);
    }

    #[test]
    fn test_connection_errors_map_to_taxonomy() {
        use std::time::Duration;
        assert!(matches!(
            SessionError::from(ConnectionError::Timeout(Duration::from_secs(1))),
            SessionError::ConnectionTimeout
        ));
        assert!(matches!(SessionError::from(ConnectionError::RoomFull), SessionError::RoomFull));
        assert!(matches!(
            SessionError::from(ConnectionError::Refused("nope".into())),
            SessionError::ConnectionRefused(_)
        ));
        assert!(matches!(
            SessionError::from(DirectoryError::Unavailable("down".into())),
            SessionError::DirectoryUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_one_session_per_client() {
        let directory = MemoryDirectory::new();
        let lobby = lobby(&directory);

        let session = lobby.host_room("first", "red").await.unwrap();
        assert_eq!(session.role(), Role::Host);
        assert_eq!(session.local_side(), Side::White);
        assert!(matches!(lobby.host_room("second", "blue").await, Err(SessionError::AlreadyInSession)));

        session.leave().await;
        assert!(directory.is_empty().await);

        let again = lobby.host_room("second", "blue").await.unwrap();
        drop(again);
        // Dropped without leave: ownership freed, record left to expire
        assert!(lobby.registrar().owner().is_none());
        assert_eq!(directory.len().await, 1);
    }

    #[tokio::test]
    async fn test_join_errors_release_claim() {
        let directory = MemoryDirectory::new();
        let lobby = lobby(&directory);

        assert!(matches!(lobby.join_room("ab").await, Err(SessionError::InvalidRoomCode(_))));
        assert!(matches!(lobby.join_room("ZZZ999").await, Err(SessionError::RoomNotFound)));
        assert!(lobby.registrar().owner().is_none());
    }

    #[tokio::test]
    async fn test_host_advertises_loopback_endpoint() {
        let directory = MemoryDirectory::new();
        let lobby = lobby(&directory);
        let session = lobby.host_room("friendly", "green").await.unwrap();

        let record = directory.get(session.room_code()).await.unwrap().unwrap();
        assert_eq!(record.endpoint.as_deref(), Some(session.endpoint()));
        assert!(session.endpoint().starts_with("ws://127.0.0.1:"));
        assert_eq!(session.board(), &BoardState::initial());
        session.leave().await;
    }
}
