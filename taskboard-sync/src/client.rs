//! Realtime channel client.
//!
//! Provides:
//! - Connection lifecycle with a bounded retry (fixed delay between attempts)
//! - Automatic reconnection and board re-join after a dropped link
//! - Outbound commands and card events
//! - Inbound event decoding onto the [`EventBus`]
//!
//! ```text
//!             connect()
//!                 │
//!   Disconnected ─┴─► Connecting ──ok──► Connected ──link lost──► Disconnected
//!                         │                  ▲                        │
//!                   N failures               └────ok── Reconnecting ◄─┘
//!                         ▼                               │
//!                      Offline ◄──────── N failures ──────┘
//! ```
//!
//! The transport is behind [`Connector`], so the same client runs over a
//! WebSocket or an in-process loopback.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use taskboard_core::{BoardId, CardId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::EventBus;
use crate::error::ChannelError;
use crate::protocol::{BoardRef, ChannelCommand, ChannelEvent, ChannelFrame, EditingRef};

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted; waits for an explicit `connect()`.
    Offline,
}

const LINK_BUFFER: usize = 256;

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

/// One established connection: text frames in both directions. The link
/// is lost when `incoming` closes.
pub struct ChannelLink {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<ChannelLink, ChannelError>;
}

/// WebSocket transport authenticated with a bearer token.
pub struct WsConnector {
    url: String,
    token: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<ChannelLink, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_BUFFER);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: forward text frames until the socket closes
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_BUFFER);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(ChannelLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Server side of a loopback connection.
pub struct LoopbackRemote {
    pub to_client: mpsc::Sender<String>,
    pub from_client: mpsc::Receiver<String>,
}

impl LoopbackRemote {
    pub async fn send_event(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        let text = ChannelFrame::from(event).encode()?;
        self.to_client.send(text).await.map_err(|_| ChannelError::Closed)
    }

    /// Next frame sent by the client; `None` once the client hung up.
    pub async fn next_frame(&mut self) -> Option<ChannelFrame> {
        let text = self.from_client.recv().await?;
        ChannelFrame::decode(&text).ok()
    }
}

/// In-process transport. Every successful connect hands its server side
/// out through [`LoopbackConnector::next_remote`].
pub struct LoopbackConnector {
    fail_next: AtomicU32,
    attempts: AtomicU32,
    remotes_tx: mpsc::UnboundedSender<LoopbackRemote>,
    remotes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackRemote>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            fail_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            remotes_tx,
            remotes_rx: tokio::sync::Mutex::new(remotes_rx),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn next_remote(&self) -> Option<LoopbackRemote> {
        self.remotes_rx.lock().await.recv().await
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<ChannelLink, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::ConnectFailed("loopback refused".into()));
        }

        let (to_client, incoming) = mpsc::channel(LINK_BUFFER);
        let (outgoing, from_client) = mpsc::channel(LINK_BUFFER);
        self.remotes_tx
            .send(LoopbackRemote {
                to_client,
                from_client,
            })
            .map_err(|_| ChannelError::Closed)?;
        Ok(ChannelLink { outgoing, incoming })
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

struct Inner {
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    attempts: u32,
    delay: Duration,
    state: watch::Sender<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    /// Board to re-join after a reconnect.
    joined: Mutex<Option<BoardId>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn connect_with_retry(
        &self,
        phase: ConnectionState,
    ) -> Result<ChannelLink, ChannelError> {
        for attempt in 1..=self.attempts {
            self.set_state(phase);
            match self.connector.connect().await {
                Ok(link) => {
                    log::info!("Channel connected on attempt {attempt}");
                    return Ok(link);
                }
                Err(e) => {
                    log::warn!("Channel connect attempt {attempt}/{} failed: {e}", self.attempts);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        self.set_state(ConnectionState::Offline);
        Err(ChannelError::RetriesExhausted {
            attempts: self.attempts,
        })
    }

    fn install(self: &Arc<Self>, link: ChannelLink) {
        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = Some(link.outgoing);
        self.set_state(ConnectionState::Connected);
        let reader = tokio::spawn(Inner::pump(self.clone(), link.incoming));
        if let Some(previous) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reader)
        {
            previous.abort();
        }
    }

    async fn pump(self: Arc<Self>, mut incoming: mpsc::Receiver<String>) {
        while let Some(text) = incoming.recv().await {
            match ChannelFrame::decode(&text) {
                Ok(ChannelFrame::Event(event)) => {
                    self.bus.publish(event);
                }
                Ok(ChannelFrame::Command(command)) => {
                    log::debug!("Ignoring command frame from channel: {command:?}");
                }
                Err(e) => log::warn!("Dropping undecodable channel frame: {e}"),
            }
        }
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if !self.closed.load(Ordering::SeqCst) {
            log::warn!("Channel link lost");
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// `state` is subscribed before the task starts, and its current value
    /// is checked first, so a link lost before the first poll is not missed.
    async fn supervise(self: Arc<Self>, mut state: watch::Receiver<ConnectionState>) {
        loop {
            let current = *state.borrow_and_update();
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if current == ConnectionState::Disconnected {
                match self.connect_with_retry(ConnectionState::Reconnecting).await {
                    Ok(link) => {
                        self.install(link);
                        if self.rejoin().await {
                            self.bus.resync();
                        }
                    }
                    Err(e) => log::warn!("Channel reconnect gave up: {e}"),
                }
                continue;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    }

    /// Re-join the remembered board. Returns whether there was one.
    async fn rejoin(&self) -> bool {
        let joined = self
            .joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(board_id) = joined else {
            return false;
        };
        let board = BoardRef { board_id };
        let _ = self.send(ChannelCommand::JoinBoard(board.clone()).into()).await;
        let _ = self.send(ChannelCommand::RequestOnlineUsers(board).into()).await;
        true
    }

    async fn send(&self, frame: ChannelFrame) -> Result<(), ChannelError> {
        let sender = self
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::NotConnected)?;
        let text = frame.encode()?;
        sender.send(text).await.map_err(|_| ChannelError::Closed)
    }
}

/// The realtime channel client.
///
/// Decoded events are published on the shared [`EventBus`]. Commands sent
/// while disconnected fail with [`ChannelError::NotConnected`]; the joined
/// board is remembered and re-joined on every reconnect.
pub struct ChannelClient {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
        attempts: u32,
        delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                bus,
                attempts: attempts.max(1),
                delay,
                state,
                outgoing: Mutex::new(None),
                joined: Mutex::new(None),
                reader: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect, retrying up to the configured number of attempts. After
    /// the last failure the state is [`ConnectionState::Offline`].
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        let link = self.inner.connect_with_retry(ConnectionState::Connecting).await?;
        self.inner.install(link);
        self.ensure_supervisor();
        self.inner.rejoin().await;
        Ok(())
    }

    fn ensure_supervisor(&self) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let state = self.inner.state.subscribe();
        *supervisor = Some(tokio::spawn(Inner::supervise(self.inner.clone(), state)));
    }

    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if let Some(handle) = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.set_state(ConnectionState::Disconnected);
        log::info!("Channel disconnected");
    }

    // ─── Commands ────────────────────────────────────────────────────

    /// Join a board's room. Remembered even when not connected.
    pub async fn join_board(&self, board_id: &BoardId) -> Result<(), ChannelError> {
        *self.inner.joined.lock().unwrap_or_else(PoisonError::into_inner) = Some(board_id.clone());
        self.inner
            .send(
                ChannelCommand::JoinBoard(BoardRef {
                    board_id: board_id.clone(),
                })
                .into(),
            )
            .await
    }

    pub async fn leave_board(&self, board_id: &BoardId) -> Result<(), ChannelError> {
        {
            let mut joined = self.inner.joined.lock().unwrap_or_else(PoisonError::into_inner);
            if joined.as_ref() == Some(board_id) {
                *joined = None;
            }
        }
        self.inner
            .send(
                ChannelCommand::LeaveBoard(BoardRef {
                    board_id: board_id.clone(),
                })
                .into(),
            )
            .await
    }

    pub async fn request_online_users(&self, board_id: &BoardId) -> Result<(), ChannelError> {
        self.inner
            .send(
                ChannelCommand::RequestOnlineUsers(BoardRef {
                    board_id: board_id.clone(),
                })
                .into(),
            )
            .await
    }

    pub async fn start_editing(
        &self,
        board_id: &BoardId,
        card_id: &CardId,
    ) -> Result<(), ChannelError> {
        self.inner
            .send(
                ChannelCommand::StartEditing(EditingRef {
                    board_id: board_id.clone(),
                    card_id: card_id.clone(),
                })
                .into(),
            )
            .await
    }

    pub async fn stop_editing(
        &self,
        board_id: &BoardId,
        card_id: &CardId,
    ) -> Result<(), ChannelError> {
        self.inner
            .send(
                ChannelCommand::StopEditing(EditingRef {
                    board_id: board_id.clone(),
                    card_id: card_id.clone(),
                })
                .into(),
            )
            .await
    }

    /// Announce a confirmed local change to peers.
    pub async fn publish(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        self.inner.send(event.into()).await
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if let Some(handle) = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
