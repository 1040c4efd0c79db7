//! WebSocket handler — one client connection from upgrade to teardown.
//!
//! DESIGN
//! ======
//! On upgrade the socket is split and three tasks cooperate:
//! - the upgrade task reads frames, runs them through the [`Session`], and
//!   applies the returned effects
//! - a writer task drains the outbound queue and sends keep-alive pings
//! - a join watchdog closes connections that never complete `join`
//!
//! Handlers never touch the socket. Everything the client receives goes
//! through its outbound queue, whether it comes from this connection (error
//! replies), the hub (roster), or other members (events via the backplane).
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → spawn writer + watchdog, read until close/error/deadline
//! 2. `join` → stop watchdog, register with the hub
//! 3. Exit → publish `USER_LEFT` (if registered) → unregister → drain writer

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use bytes::Bytes;
use frames::{ClientFrame, ServerFrame};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval_at, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionLimits;
use crate::frame::{self, WsError};
use crate::services::command::{Effect, Session};
use crate::services::hub::{Member, Outbound};
use crate::state::{AppState, BoardId};

const JOIN_TIMEOUT_REASON: &str = "join timeout";

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max = state.limits.max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let limits = state.limits;
    let (sink, mut stream) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(limits.outbound_capacity);
    let writer = tokio::spawn(write_loop(sink, outbound_rx, limits, client_id));

    let (joined_tx, joined_rx) = oneshot::channel::<()>();
    let (expired_tx, expired_rx) = oneshot::channel::<()>();
    let watchdog = tokio::spawn(join_watchdog(limits.join_timeout, joined_rx, expired_tx, outbound_tx.clone()));

    info!(%client_id, "ws: client connected");

    let mut conn = Connection {
        state,
        client_id,
        session: Session::new(client_id),
        outbound: outbound_tx,
        joined: Some(joined_tx),
        registered: None,
    };
    conn.read_loop(&mut stream, expired_rx).await;
    conn.teardown(watchdog, writer).await;
}

struct Connection {
    state: AppState,
    client_id: Uuid,
    session: Session,
    outbound: mpsc::Sender<Outbound>,
    /// Join-completion signal for the watchdog; taken on the first join.
    joined: Option<oneshot::Sender<()>>,
    /// Board this connection is registered on with the hub.
    registered: Option<BoardId>,
}

impl Connection {
    async fn read_loop(&mut self, stream: &mut SplitStream<WebSocket>, mut expired: oneshot::Receiver<()>) {
        let pong_wait = self.state.limits.pong_wait;
        let mut watchdog_armed = true;

        loop {
            let next = tokio::select! {
                res = &mut expired, if watchdog_armed => {
                    watchdog_armed = false;
                    if res.is_ok() {
                        break;
                    }
                    continue;
                }
                next = timeout(pong_wait, stream.next()) => next,
            };

            let msg = match next {
                Err(_) => {
                    info!(client_id = %self.client_id, "ws: read deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(client_id = %self.client_id, error = %e, "ws: read failed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Binary(bytes) => {
                    let effects = self.process_inbound(&bytes).await;
                    if !self.apply(effects).await {
                        break;
                    }
                }
                Message::Text(_) => {
                    debug!(client_id = %self.client_id, "ws: text frame rejected");
                    self.reply(&WsError::UnknownMessageType.to_frame("")).await;
                }
                Message::Close(_) => break,
                // Any inbound frame, pongs included, already refreshed the deadline.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    /// Decode one binary message and dispatch it. Undecodable input becomes
    /// an error reply to a fixed id.
    async fn process_inbound(&mut self, bytes: &[u8]) -> Vec<Effect> {
        match frames::decode_frame::<ClientFrame>(bytes) {
            Ok(req) => {
                self.session
                    .dispatch(self.state.users.as_ref(), req)
                    .await
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "ws: invalid inbound frame");
                vec![Effect::Reply(WsError::from(e).to_frame(""))]
            }
        }
    }

    /// Carry out handler effects. Returns `false` when the connection must end.
    async fn apply(&mut self, effects: Vec<Effect>) -> bool {
        for effect in effects {
            match effect {
                Effect::Reply(frame) => self.reply(&frame).await,
                Effect::Publish { board_id, event, exclude_user } => {
                    self.state
                        .hub
                        .publish(&board_id, &event, exclude_user)
                        .await;
                }
                Effect::Register { reply_to } => {
                    // The watchdog is gone only if it already fired.
                    let still_open = self
                        .joined
                        .take()
                        .is_some_and(|signal| signal.send(()).is_ok());
                    if !still_open {
                        return false;
                    }
                    self.register(reply_to).await;
                }
            }
        }
        true
    }

    async fn register(&mut self, reply_to: String) {
        let Some((user, board_id)) = self.session.joined() else {
            return;
        };
        let member = Member {
            client_id: self.client_id,
            user: user.clone(),
            board_id: board_id.to_owned(),
            outbound: self.outbound.clone(),
            cursor: self.session.cursor_watch(),
        };
        self.registered = Some(member.board_id.clone());
        self.state.hub.register(member, reply_to).await;
    }

    /// Queue a frame for this client. Blocks only this connection when full.
    async fn reply(&self, frame: &ServerFrame) {
        let bytes = match frames::encode_frame(frame) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "ws: failed to encode reply");
                return;
            }
        };
        if self.outbound.send(Outbound::Frame(bytes)).await.is_err() {
            debug!(client_id = %self.client_id, "ws: writer gone, reply dropped");
        }
    }

    async fn teardown(self, watchdog: JoinHandle<()>, writer: JoinHandle<()>) {
        let Self { state, client_id, session, outbound, registered, .. } = self;

        if let (Some(board_id), Some((user, _))) = (registered.as_deref(), session.joined()) {
            state
                .hub
                .publish(board_id, &frame::user_left(user), Some(user.id))
                .await;
        }
        state.hub.unregister(client_id, registered).await;

        watchdog.abort();
        // The writer ends once every sender (ours, the watchdog's, the hub's) is gone.
        drop(outbound);
        let _ = writer.await;

        info!(%client_id, "ws: client disconnected");
    }
}

// =============================================================================
// JOIN WATCHDOG
// =============================================================================

async fn join_watchdog(
    join_timeout: Duration,
    joined: oneshot::Receiver<()>,
    expired: oneshot::Sender<()>,
    outbound: mpsc::Sender<Outbound>,
) {
    // A join that lands together with the deadline wins.
    tokio::select! {
        biased;
        _ = joined => {}
        () = sleep(join_timeout) => {
            info!("ws: join timeout, closing connection");
            let _ = outbound
                .send(Outbound::Close { code: close_code::POLICY, reason: JOIN_TIMEOUT_REASON })
                .await;
            let _ = expired.send(());
        }
    }
}

// =============================================================================
// WRITER
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Socket(#[from] axum::Error),
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    limits: ConnectionLimits,
    client_id: Uuid,
) {
    let period = limits.ping_period();
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        let result = tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Frame(bytes)) => write(&mut sink, Message::Binary(bytes), limits.write_wait).await,
                Some(Outbound::Close { code, reason }) => {
                    let _ = write(&mut sink, close_message(code, reason), limits.write_wait).await;
                    break;
                }
                None => {
                    let _ = write(&mut sink, close_message(close_code::NORMAL, ""), limits.write_wait).await;
                    break;
                }
            },
            _ = ping.tick() => write(&mut sink, Message::Ping(Bytes::new()), limits.write_wait).await,
        };

        if let Err(e) = result {
            debug!(%client_id, error = %e, "ws: write failed");
            break;
        }
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

async fn write(sink: &mut SplitSink<WebSocket, Message>, msg: Message, wait: Duration) -> Result<(), WriteError> {
    timeout(wait, sink.send(msg))
        .await
        .map_err(|_| WriteError::Timeout)??;
    Ok(())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
