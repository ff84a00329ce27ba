//! Push a `balance_done` message to connected websocket clients whenever the worker commits a
//! balancing run, so they know when to reload group assignments.
use std::time;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, warn};

use roster_common::model::DepartmentId;
use roster_common::pgqueue::BALANCE_DONE_CHANNEL;

use super::AppState;

/// Text frame sent to clients. Clients match on it verbatim.
pub const BALANCE_DONE_MESSAGE: &str = "balance_done";

/// Fan-out of committed balancing runs to every open websocket.
#[derive(Clone)]
pub struct BalanceEvents {
    sender: broadcast::Sender<DepartmentId>,
}

impl BalanceEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DepartmentId> {
        self.sender.subscribe()
    }

    /// Returns the number of sockets the event was handed to.
    pub fn publish(&self, department_id: DepartmentId) -> usize {
        // Fails only when nobody is connected.
        self.sender.send(department_id).unwrap_or(0)
    }
}

/// Connect a listener on the balance channel. Notifications sent from now on are buffered in it.
pub async fn listen_balance_done(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(BALANCE_DONE_CHANNEL).await?;

    Ok(listener)
}

/// Forward notifications from `listener` to `events` until the process stops.
/// `PgListener` reconnects on the next `recv` after a connection error.
pub async fn relay_balance_done(mut listener: PgListener, events: BalanceEvents) {
    loop {
        match listener.recv().await {
            Ok(notification) => match parse_department(notification.payload()) {
                Some(department_id) => {
                    let sockets = events.publish(department_id);
                    debug!(department_id, sockets, "relayed balance_done");
                    metrics::counter!("balance_done_relayed").increment(1);
                }
                None => warn!(
                    payload = notification.payload(),
                    "ignoring malformed balance_done payload"
                ),
            },
            Err(error) => {
                error!("balance_done listener failed: {}", error);
                tokio::time::sleep(time::Duration::from_secs(1)).await;
            }
        }
    }
}

fn parse_department(payload: &str) -> Option<DepartmentId> {
    payload.trim().parse().ok()
}

pub async fn ws(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    // Subscribe before the upgrade completes so no event falls between handshake and forwarding.
    let events = state.events.subscribe();

    upgrade.on_upgrade(move |socket| forward(socket, events))
}

async fn forward(mut socket: WebSocket, mut events: broadcast::Receiver<DepartmentId>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(department_id) => debug!(department_id, "sending balance_done"),
                // Clients reload everything on the message, so one frame covers the skipped ones.
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "websocket lagged behind"),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        }

        if socket
            .send(Message::Text(BALANCE_DONE_MESSAGE.to_owned()))
            .await
            .is_err()
        {
            break;
        }
    }
}
