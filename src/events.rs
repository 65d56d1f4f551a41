//! Typed event channels between the substrate and the surface.
//!
//! Each publisher enumerates its event variants explicitly; subscribers take
//! a `broadcast::Receiver` and hold no references into the substrate, so a
//! dropped listener can never pin a tab's resources alive.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::config::TabId;

/// Raw terminal byte streams and shell exits.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Data { tab: TabId, bytes: Bytes },
    Exit { tab: TabId, code: Option<u32> },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
    /// Quality score [0..100] from the latency prober, if known.
    pub quality: Option<u8>,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PoolFull,
    PerServerCapReached,
    WaiterQueueFull,
    TransportEvicted,
}

/// Pool and reconnection lifecycle.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Status { tab: TabId, status: ConnectionStatus },
    /// A lost transport was replaced in place; dependents should migrate.
    Replaced { key: String },
    ReconnectAbandoned { key: String, reason: String },
    PoolAlert { kind: AlertKind, detail: String },
}

#[derive(Debug, Clone)]
pub enum LatencyEvent {
    Updated { tab: TabId, ms: u32, quality: u8 },
    Error { tab: TabId, reason: String },
    Disconnected { tab: TabId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress {
        id: uuid::Uuid,
        bytes: u64,
        total: Option<u64>,
        /// Bytes per second over the life of the transfer.
        rate: f64,
        eta: Option<Duration>,
    },
    Complete {
        id: uuid::Uuid,
        status: TransferStatus,
        error: Option<String>,
    },
}

/// One send side per publisher. Sends with no subscribers are fine; events
/// are fire-and-forget.
pub struct EventBus {
    terminal: broadcast::Sender<TerminalEvent>,
    connection: broadcast::Sender<ConnectionEvent>,
    latency: broadcast::Sender<LatencyEvent>,
    transfer: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (terminal, _) = broadcast::channel(capacity);
        let (connection, _) = broadcast::channel(capacity);
        let (latency, _) = broadcast::channel(capacity);
        let (transfer, _) = broadcast::channel(capacity);
        Self {
            terminal,
            connection,
            latency,
            transfer,
        }
    }

    pub fn subscribe_terminal(&self) -> broadcast::Receiver<TerminalEvent> {
        self.terminal.subscribe()
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    pub fn subscribe_latency(&self) -> broadcast::Receiver<LatencyEvent> {
        self.latency.subscribe()
    }

    pub fn subscribe_transfer(&self) -> broadcast::Receiver<TransferEvent> {
        self.transfer.subscribe()
    }

    pub fn terminal(&self, event: TerminalEvent) {
        let _ = self.terminal.send(event);
    }

    pub fn connection(&self, event: ConnectionEvent) {
        let _ = self.connection.send(event);
    }

    pub fn latency(&self, event: LatencyEvent) {
        let _ = self.latency.send(event);
    }

    pub fn transfer(&self, event: TransferEvent) {
        let _ = self.transfer.send(event);
    }

    pub fn status(&self, tab: &str, status: ConnectionStatus) {
        self.connection(ConnectionEvent::Status {
            tab: tab.to_string(),
            status,
        });
    }

    pub fn pool_alert(&self, kind: AlertKind, detail: impl Into<String>) {
        self.connection(ConnectionEvent::PoolAlert {
            kind,
            detail: detail.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe_terminal();
        let mut b = bus.subscribe_terminal();
        bus.terminal(TerminalEvent::Data {
            tab: "t1".into(),
            bytes: Bytes::from_static(b"hello"),
        });
        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                TerminalEvent::Data { tab, bytes } => {
                    assert_eq!(tab, "t1");
                    assert_eq!(&bytes[..], b"hello");
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.pool_alert(AlertKind::PoolFull, "10/10 transports in use");
    }
}
