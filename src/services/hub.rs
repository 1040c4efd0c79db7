//! Hub — the single owner of live board membership on this instance.
//!
//! DESIGN
//! ======
//! The hub is an actor. One task owns the board → members table and the
//! topic → subscription registry; nothing else can reach them. Other tasks
//! talk to it through a [`HubHandle`]:
//! - `register` / `unregister` / `snapshot` go through the command inbox
//! - backplane subscriptions push [`BusMessage`]s into the delivery inbox
//!
//! Both inboxes are drained by the same `select!` loop, so every mutation
//! and every fanout is serialized without a lock.
//!
//! BACKPRESSURE
//! ============
//! Fanout uses `try_send`. A member whose outbound queue is full loses that
//! frame (logged) rather than stalling the loop for every other board.
//! Publishes issued by the hub run on their own task for the same reason.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use frames::ServerFrame;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backplane::{BusMessage, SharedBackplane, Subscription, board_from_topic, board_topic};
use crate::frame::{self, RosterEntry};
use crate::state::{BoardId, Cursor, User, UserId};

const COMMAND_INBOX_CAPACITY: usize = 1024;
const DELIVERY_INBOX_CAPACITY: usize = 1024;

// =============================================================================
// TYPES
// =============================================================================

/// One item on a client's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Compressed frame, written as a binary message.
    Frame(Bytes),
    /// Close the socket with this code and stop writing.
    Close { code: u16, reason: &'static str },
}

/// What the hub keeps per joined connection.
pub struct Member {
    pub client_id: Uuid,
    pub user: User,
    pub board_id: BoardId,
    pub outbound: mpsc::Sender<Outbound>,
    /// Read side of the connection's last cursor, reported in rosters.
    pub cursor: watch::Receiver<Option<Cursor>>,
}

/// Read-only view of hub state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubSnapshot {
    pub boards: BTreeMap<BoardId, BTreeSet<Uuid>>,
    pub topics: BTreeSet<String>,
}

#[cfg(test)]
impl HubSnapshot {
    #[must_use]
    pub fn contains(&self, board_id: &str, client_id: Uuid) -> bool {
        self.boards
            .get(board_id)
            .is_some_and(|members| members.contains(&client_id))
    }
}

enum HubCommand {
    Register { member: Member, reply_to: String },
    Unregister { client_id: Uuid, board_id: Option<BoardId> },
    Snapshot(oneshot::Sender<HubSnapshot>),
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable entry point to the hub task. Also owns outbound publishes.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    backplane: SharedBackplane,
}

impl HubHandle {
    /// Add a joined connection to its board and answer `reply_to` with the roster.
    pub async fn register(&self, member: Member, reply_to: String) {
        self.send(HubCommand::Register { member, reply_to }).await;
    }

    /// Drop a connection from its board. No-op for connections that never joined.
    pub async fn unregister(&self, client_id: Uuid, board_id: Option<BoardId>) {
        self.send(HubCommand::Unregister { client_id, board_id }).await;
    }

    /// Current membership and subscriptions. `None` once the hub has stopped.
    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot(tx)).await;
        rx.await.ok()
    }

    /// Broadcast a board event through the backplane. Failures are logged only.
    pub async fn publish(&self, board_id: &str, frame: &ServerFrame, exclude_user: Option<UserId>) {
        publish_frame(&self.backplane, board_id, frame, exclude_user).await;
    }

    async fn send(&self, cmd: HubCommand) {
        if self.commands.send(cmd).await.is_err() {
            warn!("hub: control loop has stopped");
        }
    }
}

/// Start the hub task. It runs until every handle is dropped.
pub fn spawn(backplane: SharedBackplane) -> HubHandle {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_INBOX_CAPACITY);
    let (deliveries_tx, deliveries_rx) = mpsc::channel(DELIVERY_INBOX_CAPACITY);

    let hub = Hub {
        boards: HashMap::new(),
        subs: HashMap::new(),
        backplane: backplane.clone(),
        deliveries_tx,
    };
    tokio::spawn(hub.run(commands_rx, deliveries_rx));

    HubHandle { commands: commands_tx, backplane }
}

// =============================================================================
// ACTOR
// =============================================================================

struct Hub {
    boards: HashMap<BoardId, HashMap<Uuid, Member>>,
    subs: HashMap<String, Subscription>,
    backplane: SharedBackplane,
    deliveries_tx: mpsc::Sender<BusMessage>,
}

impl Hub {
    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>, mut deliveries: mpsc::Receiver<BusMessage>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        HubCommand::Register { member, reply_to } => self.register(member, reply_to).await,
                        HubCommand::Unregister { client_id, board_id } => self.unregister(client_id, board_id).await,
                        HubCommand::Snapshot(reply) => {
                            let _ = reply.send(self.snapshot());
                        }
                    }
                }
                Some(msg) = deliveries.recv() => self.deliver(&msg),
            }
        }

        for (_, sub) in self.subs.drain() {
            self.backplane.unsubscribe(sub).await;
        }
        info!("hub: stopped");
    }

    async fn register(&mut self, member: Member, reply_to: String) {
        let board_id = member.board_id.clone();
        let client_id = member.client_id;
        let user = member.user.clone();
        let outbound = member.outbound.clone();

        self.boards
            .entry(board_id.clone())
            .or_default()
            .insert(client_id, member);
        info!(%client_id, %board_id, user_id = user.id, "hub: registered");

        self.ensure_subscription(&board_id).await;

        let roster = self.roster(&board_id, user.id);
        if let Some(bytes) = encode(&frame::join_roster(&reply_to, &roster)) {
            enqueue(&outbound, client_id, Outbound::Frame(bytes));
        }

        // Off the loop: a stalled bus must not hold up other boards.
        let backplane = self.backplane.clone();
        tokio::spawn(async move {
            publish_frame(&backplane, &board_id, &frame::user_joined(&user), Some(user.id)).await;
        });
    }

    async fn unregister(&mut self, client_id: Uuid, board_id: Option<BoardId>) {
        let Some(board_id) = board_id else {
            return;
        };
        let Some(members) = self.boards.get_mut(&board_id) else {
            return;
        };
        // Dropping the member drops the hub's sender for its outbound queue.
        if members.remove(&client_id).is_none() {
            return;
        }
        info!(%client_id, %board_id, "hub: unregistered");

        if members.is_empty() {
            self.boards.remove(&board_id);
            if let Some(sub) = self.subs.remove(&board_topic(&board_id)) {
                self.backplane.unsubscribe(sub).await;
                info!(%board_id, "hub: board empty, subscription closed");
            }
        }
    }

    fn deliver(&self, msg: &BusMessage) {
        let Some(board_id) = board_from_topic(&msg.topic) else {
            debug!(topic = %msg.topic, "hub: message outside board namespace");
            return;
        };
        let Some(members) = self.boards.get(board_id) else {
            return;
        };

        for member in members.values() {
            if Some(member.user.id) == msg.exclude_user {
                continue;
            }
            enqueue(&member.outbound, member.client_id, Outbound::Frame(msg.payload.clone()));
        }
    }

    /// Other users on `board_id`, one entry per user id. A connection that has
    /// reported a cursor wins over one that has not.
    fn roster(&self, board_id: &str, joining_user: UserId) -> Vec<RosterEntry> {
        let mut by_user: BTreeMap<UserId, RosterEntry> = BTreeMap::new();
        let Some(members) = self.boards.get(board_id) else {
            return Vec::new();
        };

        for member in members.values() {
            if member.user.id == joining_user {
                continue;
            }
            let cursor = *member.cursor.borrow();
            let entry = by_user
                .entry(member.user.id)
                .or_insert_with(|| RosterEntry { user: member.user.clone(), cursor: None });
            if entry.cursor.is_none() {
                entry.cursor = cursor;
            }
        }

        by_user.into_values().collect()
    }

    async fn ensure_subscription(&mut self, board_id: &str) {
        let topic = board_topic(board_id);
        if self.subs.contains_key(&topic) {
            return;
        }

        match self
            .backplane
            .subscribe(&topic, self.deliveries_tx.clone())
            .await
        {
            Ok(sub) => {
                debug!(%topic, "hub: subscribed");
                self.subs.insert(topic, sub);
            }
            // The member stays registered; the next join on this board retries.
            Err(e) => error!(error = %e, %topic, "hub: subscribe failed"),
        }
    }

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            boards: self
                .boards
                .iter()
                .map(|(id, members)| (id.clone(), members.keys().copied().collect()))
                .collect(),
            topics: self.subs.keys().cloned().collect(),
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn encode(frame: &ServerFrame) -> Option<Bytes> {
    match frames::encode_frame(frame) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            error!(error = %e, "hub: failed to encode frame");
            None
        }
    }
}

fn enqueue(outbound: &mpsc::Sender<Outbound>, client_id: Uuid, item: Outbound) {
    match outbound.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!(%client_id, "hub: outbound queue full, frame dropped"),
        Err(TrySendError::Closed(_)) => debug!(%client_id, "hub: outbound queue closed"),
    }
}

async fn publish_frame(backplane: &SharedBackplane, board_id: &str, frame: &ServerFrame, exclude_user: Option<UserId>) {
    let Some(payload) = encode(frame) else {
        return;
    };
    if let Err(e) = backplane
        .publish(&board_topic(board_id), payload, exclude_user)
        .await
    {
        error!(error = %e, %board_id, "hub: publish failed");
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
