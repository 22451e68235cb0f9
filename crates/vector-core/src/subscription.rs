//! C4: allocates subscription ids, attaches filters to a connection, and
//! routes incoming frames into the shared ingest queue. Grounded on the
//! teacher's `subscription_handler.rs` `client.subscribe`/
//! `handle_notifications` call shape, reimplemented against our own id
//! allocation and per-(relay, sub_id) bookkeeping instead of delegating to
//! `nostr-sdk::Client`.

use crate::connection::{ConnectionState, RelayConnection};
use crate::model::{Event, Filter};
use crate::transport::{ClientRequest, Frame};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// An item on the shared ingest queue the controller drains.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    EventAppeared(Box<Event>),
    Eose,
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Open,
    EoseSeen,
    Closed,
}

#[derive(Debug, Clone)]
struct Registration {
    filter: Filter,
    state: SubState,
    event_count: u64,
    byte_count: u64,
}

/// Random 16-hex-character subscription id, uniform over 64 bits of entropy.
pub fn new_sub_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Tracks every open `(relay, sub_id)` pair and owns the shared ingest
/// queue's producing side. A relay's connection task feeds this manager raw
/// frames; this manager is the only thing that interprets `sub_id`.
pub struct SubscriptionManager {
    registrations: Mutex<HashMap<(String, String), Registration>>,
    ingest_tx: mpsc::UnboundedSender<(String, SubscriptionEvent)>,
}

impl SubscriptionManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, SubscriptionEvent)>) {
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        (
            Self {
                registrations: Mutex::new(HashMap::new()),
                ingest_tx,
            },
            ingest_rx,
        )
    }

    /// Sends `REQ` on the relay and registers the subscription. Fails if
    /// the relay isn't connected (checked by the caller via `send`'s
    /// result, since a disconnected relay's task has already exited).
    pub fn subscribe(
        &self,
        connection: &RelayConnection,
        filter: Filter,
    ) -> Result<String, crate::error::TransportError> {
        let sub_id = new_sub_id();
        connection.send(ClientRequest::Req {
            sub_id: sub_id.clone(),
            filters: vec![filter.clone()],
        })?;
        self.registrations.lock().unwrap().insert(
            (connection.url.clone(), sub_id.clone()),
            Registration {
                filter,
                state: SubState::Open,
                event_count: 0,
                byte_count: 0,
            },
        );
        Ok(sub_id)
    }

    /// Re-sends `REQ` with the same sub ids for every registration still
    /// held against `connection`, per §4.3 ("pending subscriptions are
    /// replayed on reconnect with the same ids"). Registrations whose send
    /// fails are left in place; the next reconnect will try again.
    pub fn replay_subscriptions(&self, connection: &RelayConnection) {
        let to_replay: Vec<(String, Filter)> = {
            let regs = self.registrations.lock().unwrap();
            regs.iter()
                .filter(|((relay, _), _)| relay == &connection.url)
                .map(|((_, sub_id), reg)| (sub_id.clone(), reg.filter.clone()))
                .collect()
        };
        for (sub_id, filter) in to_replay {
            match connection.send(ClientRequest::Req {
                sub_id: sub_id.clone(),
                filters: vec![filter],
            }) {
                Ok(()) => {
                    if let Some(reg) = self
                        .registrations
                        .lock()
                        .unwrap()
                        .get_mut(&(connection.url.clone(), sub_id))
                    {
                        reg.state = SubState::Open;
                    }
                }
                Err(e) => {
                    warn!(relay = %connection.url, sub_id, error = %e, "failed to replay subscription");
                }
            }
        }
    }

    /// Watches `connection`'s state and replays its subscriptions every
    /// time it comes back to `Connected`. Meant to be spawned as its own
    /// task alongside the connection's frame dispatch task; exits once the
    /// connection's state channel is dropped.
    pub async fn watch_reconnects(&self, connection: RelayConnection) {
        let mut rx = connection.state_rx();
        let mut was_connected = connection.state() == ConnectionState::Connected;
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            let state = ConnectionState::from_tag(*rx.borrow());
            let is_connected = state == ConnectionState::Connected;
            if is_connected && !was_connected {
                self.replay_subscriptions(&connection);
            }
            was_connected = is_connected;
        }
    }

    /// Idempotent: sending `CLOSE` for an already-removed subscription is a
    /// no-op.
    pub fn stop(&self, connection: &RelayConnection, sub_id: &str) {
        let removed = self
            .registrations
            .lock()
            .unwrap()
            .remove(&(connection.url.clone(), sub_id.to_string()))
            .is_some();
        if removed {
            let _ = connection.send(ClientRequest::Close {
                sub_id: sub_id.to_string(),
            });
        }
    }

    pub fn stop_all(&self, connection: &RelayConnection) {
        let sub_ids: Vec<String> = {
            let regs = self.registrations.lock().unwrap();
            regs.keys()
                .filter(|(relay, _)| relay == &connection.url)
                .map(|(_, sub_id)| sub_id.clone())
                .collect()
        };
        for sub_id in sub_ids {
            self.stop(connection, &sub_id);
        }
    }

    /// Only the DM (`GiftWrap`) subscriptions on `connection`, per the
    /// scoped-reconcile rule of §4.6 ("only subscriptions whose filter
    /// includes GiftWrap are stopped/moved").
    pub fn stop_giftwrap_subscriptions(&self, connection: &RelayConnection) {
        let sub_ids: Vec<String> = {
            let regs = self.registrations.lock().unwrap();
            regs.iter()
                .filter(|((relay, _), reg)| {
                    relay == &connection.url
                        && reg
                            .filter
                            .kinds
                            .as_ref()
                            .is_some_and(|k| k.contains(&crate::model::Kind::GiftWrap.as_u16()))
                })
                .map(|((_, sub_id), _)| sub_id.clone())
                .collect()
        };
        for sub_id in sub_ids {
            self.stop(connection, &sub_id);
        }
    }

    /// Drives frame ingestion off a relay connection's frame channel. Spawn
    /// one of these per relay alongside its `RelayConnection`; exits when
    /// the connection task drops its sender.
    pub async fn run_relay_dispatch(&self, mut frame_rx: mpsc::UnboundedReceiver<(String, Frame)>) {
        while let Some((relay_url, frame)) = frame_rx.recv().await {
            self.dispatch_frame(&relay_url, frame);
        }
    }

    fn dispatch_frame(&self, relay_url: &str, frame: Frame) {
        match frame {
            Frame::Event { sub_id, event } => {
                if let Some(reg) = self
                    .registrations
                    .lock()
                    .unwrap()
                    .get_mut(&(relay_url.to_string(), sub_id.clone()))
                {
                    reg.event_count += 1;
                    reg.byte_count += serde_json::to_vec(&event).map(|b| b.len() as u64).unwrap_or(0);
                } else {
                    warn!(relay = relay_url, sub_id, "event for unknown subscription");
                }
                let _ = self
                    .ingest_tx
                    .send((relay_url.to_string(), SubscriptionEvent::EventAppeared(event)));
            }
            Frame::Eose { sub_id } => {
                if let Some(reg) = self
                    .registrations
                    .lock()
                    .unwrap()
                    .get_mut(&(relay_url.to_string(), sub_id))
                {
                    reg.state = SubState::EoseSeen;
                }
                let _ = self.ingest_tx.send((relay_url.to_string(), SubscriptionEvent::Eose));
            }
            Frame::Closed { sub_id, reason } => {
                if let Some(reg) = self
                    .registrations
                    .lock()
                    .unwrap()
                    .get_mut(&(relay_url.to_string(), sub_id))
                {
                    reg.state = SubState::Closed;
                }
                let _ = self
                    .ingest_tx
                    .send((relay_url.to_string(), SubscriptionEvent::Closed(reason)));
            }
            Frame::Ok { .. } | Frame::Notice { .. } => {}
        }
    }
}
