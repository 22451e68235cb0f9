//! C3: per-relay connection lifecycle, request/response multiplexing,
//! reconnection and back-off. One `RelayConnection` per relay URI; its
//! background task is the only thing in the system that touches the
//! socket, which is what lets the rest of the pool be read freely from
//! other tasks (§5). Frames read off the socket are forwarded, tagged with
//! the relay URL, to `SubscriptionManager`, which owns per-subscription
//! bookkeeping and re-packages them for the shared ingest queue. Grounded
//! on the pack's overlord/minion reference: a `Transport`-per-task loop,
//! since neither the teacher nor any other pack repo hand-rolls this (they
//! all delegate to an SDK client's relay pool).

use crate::config::BackoffConfig;
use crate::error::TransportError;
use crate::transport::{ClientRequest, Frame, Transport};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub(crate) fn from_tag(tag: u8) -> Self {
        match tag {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Idle,
        }
    }

    fn tag(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnecting => 3,
            ConnectionState::Failed => 4,
        }
    }
}

/// Exponential back-off with jitter, reset on a successful connect.
pub struct Backoff {
    attempt: u32,
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { attempt: 0, config }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay before the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.config.initial_ms.saturating_mul(1u64 << self.attempt.min(20));
        let capped_ms = base_ms.min(self.config.max_ms);
        self.attempt += 1;
        let jitter = self.config.jitter_fraction;
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_millis(((capped_ms as f64) * factor) as u64)
    }
}

/// A handle to a relay's connection task. Cheap to clone; the background
/// task is torn down when the last handle is dropped and cancellation is
/// requested, or explicitly via [`RelayConnection::disconnect`].
#[derive(Clone)]
pub struct RelayConnection {
    pub url: String,
    state_rx: watch::Receiver<u8>,
    outbound: mpsc::UnboundedSender<ClientRequest>,
    cancel: CancellationToken,
}

impl RelayConnection {
    /// Spawns the connection task and returns a handle. `send`/`disconnect`
    /// are available immediately; the socket itself connects lazily on the
    /// first `connect()` call.
    pub fn spawn<T: Transport>(
        url: String,
        connect_timeout: Duration,
        backoff_config: BackoffConfig,
        frame_tx: mpsc::UnboundedSender<(String, Frame)>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle.tag());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task_url = url.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(run_connection_task::<T>(
            task_url,
            connect_timeout,
            backoff_config,
            state_tx,
            outbound_rx,
            frame_tx,
            task_cancel,
        ));

        Self {
            url,
            state_rx,
            outbound: outbound_tx,
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_tag(*self.state_rx.borrow())
    }

    /// A clone of the raw state channel, for tasks that need to observe
    /// every transition (e.g. replaying subscriptions on reconnect) rather
    /// than just polling the current state.
    pub fn state_rx(&self) -> watch::Receiver<u8> {
        self.state_rx.clone()
    }

    /// Waits for the connection to become `Connected` or `Failed`, up to
    /// `timeout`. Idempotent: returns immediately `true` if already
    /// connected.
    pub async fn connect(&self, timeout: Duration) -> bool {
        if self.state() == ConnectionState::Connected {
            return true;
        }
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                let state = ConnectionState::from_tag(*rx.borrow());
                if state == ConnectionState::Connected {
                    return true;
                }
                if state == ConnectionState::Failed {
                    return false;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Queues a request for delivery in order. Fails only if the
    /// connection task has already exited.
    pub fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        self.outbound
            .send(request)
            .map_err(|_| TransportError::Closed)
    }
}

#[instrument(skip_all, fields(relay = %url))]
async fn run_connection_task<T: Transport>(
    url: String,
    connect_timeout: Duration,
    backoff_config: BackoffConfig,
    state_tx: watch::Sender<u8>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientRequest>,
    frame_tx: mpsc::UnboundedSender<(String, Frame)>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(backoff_config);

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }
        let _ = state_tx.send(ConnectionState::Connecting.tag());
        let transport = tokio::select! {
            result = T::connect(url.clone(), connect_timeout) => result,
            _ = cancel.cancelled() => break 'reconnect,
        };

        let mut transport = match transport {
            Ok(t) => {
                backoff.reset();
                let _ = state_tx.send(ConnectionState::Connected.tag());
                info!("connected");
                t
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                let _ = state_tx.send(ConnectionState::Failed.tag());
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'reconnect,
                    _ = cancel.cancelled() => break 'reconnect,
                }
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = state_tx.send(ConnectionState::Disconnecting.tag());
                    transport.close().await;
                    let _ = state_tx.send(ConnectionState::Idle.tag());
                    break 'reconnect;
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(request) => {
                            if let Err(e) = transport.send(&request).await {
                                warn!(error = %e, "send failed, reconnecting");
                                let _ = state_tx.send(ConnectionState::Failed.tag());
                                continue 'reconnect;
                            }
                        }
                        None => {
                            // All handles dropped; nothing left to serve.
                            transport.close().await;
                            break 'reconnect;
                        }
                    }
                }
                frame = transport.next_frame() => {
                    match frame {
                        Ok(frame) => {
                            let _ = frame_tx.send((url.clone(), frame));
                        }
                        Err(e) => {
                            debug!(error = %e, "transport closed");
                            let _ = state_tx.send(ConnectionState::Failed.tag());
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_ms: 100,
            max_ms: 1000,
            jitter_fraction: 0.0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }
}
