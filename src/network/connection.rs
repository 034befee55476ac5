//! Peer Connection Manager
//!
//! Direct WebSocket channel between the two peers of a session.
//!
//! ```text
//!   Idle ──dial/inbound──▶ Connecting ──welcome──▶ Open ──▶ Closed | Errored
//! ```
//!
//! `Closed` and `Errored` end one channel instance. A host keeps listening for
//! the whole session, so the next guest to arrive opens a fresh instance.
//! Capacity is one guest: while a channel is open further guests are refused.
//!
//! Events for the current instance arrive in order on a single receiver,
//! one at a time. Sending is fire-and-forget and silently drops messages when
//! no channel is open.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Serialize, Deserialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::core::room_code::RoomCode;
use crate::network::protocol::{PeerMessage, RejectReason};

/// Lifecycle of the peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel and no dial in flight.
    Idle,
    /// Dial in flight.
    Connecting,
    /// Channel attached to a peer.
    Open,
    /// Channel ended normally.
    Closed,
    /// Channel or dial failed.
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Events raised by the current channel instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer attached.
    Opened {
        /// Remote address or dialed endpoint.
        peer: String,
    },
    /// A message arrived.
    Message(PeerMessage),
    /// The peer went away.
    Closed,
    /// The channel failed.
    Error(String),
}

/// Connection failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Dial or handshake did not finish in time.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Peer unreachable or refused the handshake.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Host already has a guest.
    #[error("Room is full")]
    RoomFull,

    /// A channel is already open.
    #[error("Channel already open")]
    AlreadyOpen,

    /// Listener could not be bound.
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// Connection timing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound for a whole dial, handshake included.
    pub dial_timeout: Duration,
    /// Upper bound for an inbound guest to complete the handshake.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// SHARED CHANNEL SLOT
// =============================================================================

#[derive(Default)]
struct ChannelSlot {
    /// Bumped for every claimed instance and on local close.
    generation: u64,
    /// A channel instance holds the slot.
    claimed: bool,
    outgoing: Option<mpsc::UnboundedSender<PeerMessage>>,
    reader: Option<JoinHandle<()>>,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    slot: Mutex<ChannelSlot>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, ChannelSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection {} -> {}", previous, state);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // Receiver gone means the session is being torn down.
        let _ = self.events.send(event);
    }

    /// Reserve the single channel slot.
    fn claim(&self) -> Option<u64> {
        let mut slot = self.slot();
        if slot.claimed {
            return None;
        }
        slot.claimed = true;
        slot.generation += 1;
        Some(slot.generation)
    }

    fn release(&self, generation: u64) {
        let mut slot = self.slot();
        if slot.generation == generation {
            slot.claimed = false;
        }
    }

    fn send(&self, message: PeerMessage) -> bool {
        let slot = self.slot();
        match &slot.outgoing {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                debug!("Dropping {} message: channel not open", message.kind());
                false
            }
        }
    }

    /// Reader task finished for `generation`.
    fn finish(&self, generation: u64, failure: Option<String>) {
        {
            let mut slot = self.slot();
            if slot.generation != generation || !slot.claimed {
                // Closed locally; nothing to report.
                return;
            }
            slot.claimed = false;
            slot.outgoing = None;
            slot.reader = None;
        }
        match failure {
            Some(reason) => {
                warn!("Peer channel failed: {}", reason);
                self.set_state(ConnectionState::Errored);
                self.emit(ConnectionEvent::Error(reason));
            }
            None => {
                info!("Peer channel closed");
                self.set_state(ConnectionState::Closed);
                self.emit(ConnectionEvent::Closed);
            }
        }
    }

    fn close_local(&self) -> bool {
        let (writer, reader) = {
            let mut slot = self.slot();
            if !slot.claimed {
                return false;
            }
            slot.claimed = false;
            slot.generation += 1;
            (slot.outgoing.take(), slot.reader.take())
        };
        // Dropping the sender lets the writer flush a close frame and exit.
        drop(writer);
        if let Some(reader) = reader {
            reader.abort();
        }
        self.set_state(ConnectionState::Closed);
        true
    }
}

/// Puts the manager back to `Idle` if a dial future is dropped before it settles.
struct PendingDial {
    shared: Arc<Shared>,
    settled: bool,
}

impl Drop for PendingDial {
    fn drop(&mut self) {
        if !self.settled && *self.shared.state.borrow() == ConnectionState::Connecting {
            debug!("Dial abandoned");
            self.shared.set_state(ConnectionState::Idle);
        }
    }
}

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

/// Sending half handed to the state synchronizer.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Queue a message for the peer. Returns `false` (and does nothing else)
    /// when no channel is open.
    pub fn send(&self, message: PeerMessage) -> bool {
        self.shared.send(message)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle").field("state", &self.state()).finish()
    }
}

/// Owns the listener and the current channel instance.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    config: ConnectionConfig,
    listener: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create an idle manager and the receiver its events are delivered on.
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            state,
            slot: Mutex::new(ChannelSlot::default()),
            events: events_tx,
        });
        let manager = Self {
            shared,
            config,
            listener: None,
        };
        (manager, events_rx)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Sending handle for other components.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// `true` while the listener task is running.
    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Bind `bind` and accept guests for `room_code` until stopped. Returns
    /// the bound address. Each accepted guest raises [`ConnectionEvent::Opened`].
    #[instrument(skip(self), fields(room = %room_code))]
    pub async fn listen_for_incoming(
        &mut self,
        bind: SocketAddr,
        room_code: RoomCode,
    ) -> Result<SocketAddr, ConnectionError> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        info!("Listening for guests on {}", local);

        let shared = self.shared.clone();
        let handshake_timeout = self.config.handshake_timeout;
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Inbound connection from {}", addr);
                        let shared = shared.clone();
                        let room_code = room_code.clone();
                        tokio::spawn(async move {
                            if let Err(e) = accept_guest(shared, stream, addr, room_code, handshake_timeout).await {
                                debug!("Inbound guest {} dropped: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        if let Some(previous) = self.listener.replace(handle) {
            previous.abort();
        }
        Ok(local)
    }

    /// Open a channel to the host of `room_code` at `endpoint`.
    ///
    /// One attempt, bounded by the dial timeout. Dropping the returned future
    /// abandons the attempt and returns the manager to `Idle`.
    #[instrument(skip(self), fields(room = %room_code))]
    pub async fn dial(&self, room_code: &RoomCode, endpoint: &str) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Open {
            return Err(ConnectionError::AlreadyOpen);
        }
        self.shared.set_state(ConnectionState::Connecting);
        let mut pending = PendingDial {
            shared: self.shared.clone(),
            settled: false,
        };

        let dial_timeout = self.config.dial_timeout;
        let outcome = match timeout(dial_timeout, dial_handshake(endpoint, room_code)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(dial_timeout)),
        };
        pending.settled = true;

        let ws = match outcome {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Dial to {} failed: {}", endpoint, e);
                self.shared.set_state(ConnectionState::Errored);
                self.shared.set_state(ConnectionState::Idle);
                return Err(e);
            }
        };

        let Some(generation) = self.shared.claim() else {
            // Another channel attached while the handshake was in flight
            warn!("Dial to {} completed but a channel is already attached, dropping it", endpoint);
            if self.state() == ConnectionState::Connecting {
                self.shared.set_state(ConnectionState::Idle);
            }
            return Err(ConnectionError::AlreadyOpen);
        };
        info!("Connected to {}", endpoint);
        attach(&self.shared, generation, ws, endpoint.to_string());
        Ok(())
    }

    /// Queue a message for the peer; no-op when not open.
    pub fn send(&self, message: PeerMessage) -> bool {
        self.shared.send(message)
    }

    /// Tear down the current channel. No `Closed` event is raised locally;
    /// the peer sees its channel close.
    pub fn close(&self) {
        if self.shared.close_local() {
            info!("Peer channel closed locally");
        }
    }

    /// Stop accepting guests. An open channel is left alone.
    pub fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            debug!("Listener stopped");
        }
    }

    /// Stop listening and close the channel.
    pub fn shutdown(&mut self) {
        self.stop_listening();
        self.close();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// CHANNEL PLUMBING
// =============================================================================

/// Wire a handshaken socket into the slot claimed as `generation`.
fn attach<S>(shared: &Arc<Shared>, generation: u64, ws: S, peer: String)
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<PeerMessage>();

    {
        let mut slot = shared.slot();
        if slot.generation != generation {
            return;
        }
        slot.outgoing = Some(tx);
    }
    shared.set_state(ConnectionState::Open);
    shared.emit(ConnectionEvent::Opened { peer: peer.clone() });

    // Writer: serialize in send order
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize {} message: {}", message.kind(), e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Peer write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: deliver one message at a time, in arrival order
    let reader_shared = shared.clone();
    let reader = tokio::spawn(async move {
        let failure = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match PeerMessage::from_json(&text) {
                    Ok(message) => reader_shared.emit(ConnectionEvent::Message(message)),
                    Err(e) => debug!(peer = %peer, "Ignoring malformed frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
            }
        };
        reader_shared.finish(generation, failure);
    });

    let mut slot = shared.slot();
    if slot.generation == generation && slot.claimed {
        slot.reader = Some(reader);
    } else {
        reader.abort();
    }
}

async fn accept_guest(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    room_code: RoomCode,
    handshake_timeout: Duration,
) -> Result<(), ConnectionError> {
    let mut ws = timeout(handshake_timeout, accept_async(stream))
        .await
        .map_err(|_| ConnectionError::Timeout(handshake_timeout))?
        .map_err(|e| ConnectionError::Refused(e.to_string()))?;

    let first = timeout(handshake_timeout, read_handshake(&mut ws))
        .await
        .map_err(|_| ConnectionError::Timeout(handshake_timeout))??;

    let requested = match first {
        PeerMessage::Join { room_code } => room_code,
        other => {
            return Err(ConnectionError::Refused(format!("expected join, got {}", other.kind())));
        }
    };

    if requested != room_code {
        info!("Refusing guest {}: asked for room {}", addr, requested);
        let _ = send_message(&mut ws, &PeerMessage::Rejected { reason: RejectReason::WrongRoom }).await;
        let _ = ws.close(None).await;
        return Ok(());
    }

    let Some(generation) = shared.claim() else {
        info!("Refusing guest {}: room full", addr);
        let _ = send_message(&mut ws, &PeerMessage::Rejected { reason: RejectReason::RoomFull }).await;
        let _ = ws.close(None).await;
        return Ok(());
    };

    if let Err(e) = send_message(&mut ws, &PeerMessage::Welcome { room_code }).await {
        shared.release(generation);
        return Err(e);
    }

    info!("Guest {} attached", addr);
    attach(&shared, generation, ws, addr.to_string());
    Ok(())
}

async fn dial_handshake(
    endpoint: &str,
    room_code: &RoomCode,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ConnectionError> {
    let (mut ws, _) = connect_async(endpoint)
        .await
        .map_err(|e| ConnectionError::Refused(e.to_string()))?;

    send_message(&mut ws, &PeerMessage::Join { room_code: room_code.clone() }).await?;

    match read_handshake(&mut ws).await? {
        PeerMessage::Welcome { room_code: accepted } if &accepted == room_code => Ok(ws),
        PeerMessage::Rejected { reason: RejectReason::RoomFull } => Err(ConnectionError::RoomFull),
        PeerMessage::Rejected { reason: RejectReason::WrongRoom } => Err(ConnectionError::Refused(
            "endpoint hosts a different room".to_string(),
        )),
        other => Err(ConnectionError::Refused(format!(
            "unexpected {} during handshake",
            other.kind()
        ))),
    }
}

async fn send_message<S>(ws: &mut S, message: &PeerMessage) -> Result<(), ConnectionError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = message
        .to_json()
        .map_err(|e| ConnectionError::Refused(e.to_string()))?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| ConnectionError::Refused(e.to_string()))
}

/// Next protocol message, skipping control frames.
async fn read_handshake<S>(ws: &mut S) -> Result<PeerMessage, ConnectionError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return PeerMessage::from_json(&text)
                    .map_err(|e| ConnectionError::Refused(format!("bad handshake frame: {e}")));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectionError::Refused("closed during handshake".to_string()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ConnectionError::Refused(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::board::BoardState;

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            dial_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    async fn host(room: &str) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>, String) {
        let (mut manager, events) = ConnectionManager::new(fast_config());
        let addr = manager
            .listen_for_incoming("127.0.0.1:0".parse().unwrap(), code(room))
            .await
            .unwrap();
        (manager, events, format!("ws://{addr}"))
    }

    #[tokio::test]
    async fn test_dial_opens_both_ends() {
        let (host_mgr, mut host_events, endpoint) = host("ABC123").await;
        let (guest_mgr, mut guest_events) = ConnectionManager::new(fast_config());

        guest_mgr.dial(&code("ABC123"), &endpoint).await.unwrap();
        assert_eq!(guest_mgr.state(), ConnectionState::Open);
        assert!(matches!(next_event(&mut guest_events).await, ConnectionEvent::Opened { .. }));
        assert!(matches!(next_event(&mut host_events).await, ConnectionEvent::Opened { .. }));
        assert_eq!(host_mgr.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (host_mgr, mut host_events, endpoint) = host("ABC123").await;
        let (guest_mgr, _guest_events) = ConnectionManager::new(fast_config());
        guest_mgr.dial(&code("ABC123"), &endpoint).await.unwrap();
        assert!(matches!(next_event(&mut host_events).await, ConnectionEvent::Opened { .. }));

        let mut boards = Vec::new();
        let mut board = BoardState::initial();
        for (from, to) in [((6, 4), (4, 4)), ((1, 4), (3, 4)), ((7, 6), (5, 5))] {
            let mover = board.to_move;
            board
                .apply_move(
                    crate::core::Coord::new(from.0, from.1).unwrap(),
                    crate::core::Coord::new(to.0, to.1).unwrap(),
                    mover,
                )
                .unwrap();
            boards.push(board.clone());
            assert!(guest_mgr.send(PeerMessage::State { board: board.clone() }));
        }

        for expected in boards {
            match next_event(&mut host_events).await {
                ConnectionEvent::Message(PeerMessage::State { board }) => assert_eq!(board, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
        drop(host_mgr);
    }

    #[tokio::test]
    async fn test_second_guest_is_refused() {
        let (_host_mgr, mut host_events, endpoint) = host("ABC123").await;
        let (first, _first_events) = ConnectionManager::new(fast_config());
        first.dial(&code("ABC123"), &endpoint).await.unwrap();
        assert!(matches!(next_event(&mut host_events).await, ConnectionEvent::Opened { .. }));

        let (second, _second_events) = ConnectionManager::new(fast_config());
        let result = second.dial(&code("ABC123"), &endpoint).await;
        assert!(matches!(result, Err(ConnectionError::RoomFull)));
        assert_eq!(second.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_wrong_room_is_refused() {
        let (_host_mgr, _host_events, endpoint) = host("ABC123").await;
        let (guest, _events) = ConnectionManager::new(fast_config());
        let result = guest.dial(&code("ZZZ999"), &endpoint).await;
        assert!(matches!(result, Err(ConnectionError::Refused(_))));
    }

    #[tokio::test]
    async fn test_guest_close_reaches_host_and_frees_slot() {
        let (host_mgr, mut host_events, endpoint) = host("ABC123").await;
        let (first, _first_events) = ConnectionManager::new(fast_config());
        first.dial(&code("ABC123"), &endpoint).await.unwrap();
        assert!(matches!(next_event(&mut host_events).await, ConnectionEvent::Opened { .. }));

        first.close();
        assert_eq!(first.state(), ConnectionState::Closed);
        assert_eq!(next_event(&mut host_events).await, ConnectionEvent::Closed);
        assert_eq!(host_mgr.state(), ConnectionState::Closed);

        let (second, _second_events) = ConnectionManager::new(fast_config());
        second.dial(&code("ABC123"), &endpoint).await.unwrap();
        assert!(matches!(next_event(&mut host_events).await, ConnectionEvent::Opened { .. }));
        assert_eq!(host_mgr.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_dial_loses_slot_to_incoming_guest() {
        let (host_mgr, mut host_events, endpoint) = host("ABC123").await;

        // Remote host that holds its welcome until told to send it
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_endpoint = format!("ws://{}", remote.local_addr().unwrap());
        let (welcome_tx, welcome_rx) = tokio::sync::oneshot::channel::<()>();
        let remote_host = tokio::spawn(async move {
            let (stream, _) = remote.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            assert_eq!(read_handshake(&mut ws).await.unwrap().kind(), "join");
            welcome_rx.await.unwrap();
            let _ = send_message(&mut ws, &PeerMessage::Welcome { room_code: code("XYZ789") }).await;
        });

        let (guest, _guest_events) = ConnectionManager::new(fast_config());
        let events = &mut host_events;
        let guest_attaches = async {
            guest.dial(&code("ABC123"), &endpoint).await.unwrap();
            assert!(matches!(next_event(events).await, ConnectionEvent::Opened { .. }));
            welcome_tx.send(()).unwrap();
        };
        let host_code = code("XYZ789");
        let (outcome, ()) = tokio::join!(host_mgr.dial(&host_code, &remote_endpoint), guest_attaches);

        assert!(matches!(outcome, Err(ConnectionError::AlreadyOpen)));
        // The guest that won the slot keeps it
        assert_eq!(host_mgr.state(), ConnectionState::Open);
        assert!(host_mgr.send(PeerMessage::State { board: BoardState::initial() }));
        remote_host.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_unreachable_is_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (guest, _events) = ConnectionManager::new(fast_config());
        let result = guest.dial(&code("ABC123"), &format!("ws://127.0.0.1:{port}")).await;
        assert!(matches!(result, Err(ConnectionError::Refused(_))));
        assert_eq!(guest.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_dial_times_out_on_silent_peer() {
        // Accepts TCP but never speaks WebSocket
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let (guest, _events) = ConnectionManager::new(ConnectionConfig {
            dial_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(200),
        });
        let result = guest.dial(&code("ABC123"), &format!("ws://{addr}")).await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
        assert_eq!(guest.state(), ConnectionState::Idle);
        drop(silent);
    }

    #[tokio::test]
    async fn test_abandoned_dial_returns_to_idle() {
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let (guest, _events) = ConnectionManager::new(ConnectionConfig {
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
        });

        let endpoint = format!("ws://{addr}");
        let room = code("ABC123");
        tokio::select! {
            _ = guest.dial(&room, &endpoint) => panic!("dial should not settle"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        assert_eq!(guest.state(), ConnectionState::Idle);
        drop(silent);
    }

    #[tokio::test]
    async fn test_send_without_channel_is_silent() {
        let (manager, _events) = ConnectionManager::new(fast_config());
        assert!(!manager.send(PeerMessage::State { board: BoardState::initial() }));
        assert!(!manager.handle().send(PeerMessage::State { board: BoardState::initial() }));
        manager.close();
        assert_eq!(manager.state(), ConnectionState::Idle);
    }
}
