//! Reconnection manager: exponential backoff over the pool's creation path.
//!
//! A lost transport that still has references is registered here. Attempts
//! recreate the transport with its original config; success installs the
//! replacement under the same key (references migrate in place), exhaustion
//! removes the entry and notifies every bound tab. Transports closed on
//! purpose are never restarted.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectOptions;
use crate::transport::Transport;

use super::ConnectionPool;

/// Initial scheduling for a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Retry on the backoff schedule immediately.
    AutoStart,
    /// Hold the first attempt until a network-restore event.
    Pending,
}

/// Delay before attempt `n` (1-based): base × multiplier^(n-1), capped.
pub(crate) fn backoff_delay(attempt: u32, opts: &ReconnectOptions) -> Duration {
    let factor = opts.multiplier.saturating_pow(attempt.saturating_sub(1));
    opts.base_delay
        .saturating_mul(factor)
        .min(opts.max_delay)
}

pub struct ReconnectManager {
    opts: ReconnectOptions,
    pool: OnceLock<Weak<ConnectionPool>>,
    sessions: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    restored: Arc<Notify>,
}

impl ReconnectManager {
    pub fn new(opts: ReconnectOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            pool: OnceLock::new(),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            restored: Arc::new(Notify::new()),
        })
    }

    pub(crate) fn set_pool(&self, pool: &Arc<ConnectionPool>) {
        let _ = self.pool.set(Arc::downgrade(pool));
    }

    fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool.get().and_then(Weak::upgrade)
    }

    pub async fn register(self: &Arc<Self>, transport: Arc<Transport>) {
        self.register_with(transport, ReconnectMode::AutoStart).await;
    }

    pub async fn register_with(self: &Arc<Self>, transport: Arc<Transport>, mode: ReconnectMode) {
        if transport.intentional_close() {
            debug!(key = %transport.key, "not reconnecting an intentionally closed transport");
            return;
        }
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&transport.key) {
            return;
        }
        let key = transport.key.clone();
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager.run(transport, mode).await;
        });
        sessions.insert(key, task);
    }

    /// The network came back: reset counters and wake every pending session.
    pub fn network_restored(&self) {
        info!("network restored, waking pending reconnect sessions");
        self.restored.notify_waiters();
    }

    pub async fn pending_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, task) in sessions.drain() {
            task.abort();
        }
    }

    async fn run(self: Arc<Self>, transport: Arc<Transport>, mode: ReconnectMode) {
        let key = transport.key.clone();
        let cfg = transport.config.clone();
        let mut attempt: u32 = 1;

        if mode == ReconnectMode::Pending {
            self.restored.notified().await;
        }

        loop {
            if transport.intentional_close() {
                break;
            }
            let delay = backoff_delay(attempt, &self.opts);
            debug!(key = %key, attempt, ?delay, "reconnect attempt scheduled");
            let woken = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = self.restored.notified() => true,
            };
            if woken {
                attempt = 1;
            }

            let Some(pool) = self.pool() else { break };
            let outcome = async {
                let proxy = pool.resolve_proxy(&cfg).await?;
                pool.dial(cfg.clone(), proxy.as_ref(), &key).await
            }
            .await;

            match outcome {
                Ok(replacement) => {
                    let replacement = Arc::new(replacement);
                    pool.install_replacement(&key, replacement).await;
                    break;
                }
                Err(err) => {
                    warn!(key = %key, attempt, "reconnect attempt failed: {err}");
                    if attempt >= self.opts.max_attempts {
                        pool.remove_abandoned(
                            &key,
                            &format!("gave up after {attempt} attempts: {err}"),
                        )
                        .await;
                        break;
                    }
                    attempt += 1;
                }
            }
        }

        self.sessions.lock().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectConfig, PoolOptions};
    use crate::events::ConnectionEvent;
    use crate::store::MemoryStore;
    use tokio::net::TcpListener;

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let opts = ReconnectOptions::default();
        assert_eq!(backoff_delay(1, &opts), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, &opts), Duration::from_secs(10));
        assert_eq!(backoff_delay(3, &opts), Duration::from_secs(20));
        assert_eq!(backoff_delay(4, &opts), Duration::from_secs(30));
        assert_eq!(backoff_delay(9, &opts), Duration::from_secs(30));
    }

    fn fast_opts() -> ReconnectOptions {
        ReconnectOptions {
            base_delay: Duration::from_millis(10),
            multiplier: 2,
            max_delay: Duration::from_millis(40),
            max_attempts: 3,
        }
    }

    async fn wired_pool(
        reconnect_opts: ReconnectOptions,
    ) -> (
        Arc<ConnectionPool>,
        Arc<ReconnectManager>,
        Arc<crate::events::EventBus>,
    ) {
        let events = Arc::new(crate::events::EventBus::default());
        let pool = ConnectionPool::new(
            PoolOptions::default(),
            Arc::clone(&events),
            Arc::new(MemoryStore::new()),
        );
        let manager = ReconnectManager::new(reconnect_opts);
        manager.set_pool(&pool);
        pool.set_reconnect(Arc::clone(&manager));
        (pool, manager, events)
    }

    #[tokio::test]
    async fn intentional_close_is_never_restarted() {
        let (_pool, manager, _events) = wired_pool(fast_opts()).await;
        let cfg = ConnectConfig::telnet("127.0.0.1", 9);
        let link = crate::transport::Link::Telnet(Arc::new(
            crate::telnet::TelnetLink::closed_for_tests(),
        ));
        let t = Arc::new(Transport::new(
            "telnet:127.0.0.1:9".into(),
            cfg,
            link,
            &PoolOptions::default(),
        ));
        t.mark_intentional_close();
        manager.register(t).await;
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn lost_transport_is_replaced_in_place() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let _s = stream;
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    });
                } else {
                    break;
                }
            }
        });

        let (pool, _manager, events) = wired_pool(fast_opts()).await;
        let mut rx = events.subscribe_connection();

        let cfg = ConnectConfig::telnet("127.0.0.1", port).with_tab("t1");
        let original = pool.get_connection(cfg).await.unwrap();
        assert_eq!(original.ref_count(), 1);

        // Sever the link and report the loss.
        original.telnet_link().unwrap().mark_closed();
        pool.report_lost(&original.key).await;

        // Wait for the replacement event.
        let replaced = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.unwrap() {
                    ConnectionEvent::Replaced { key } => break key,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(replaced, original.key);

        let current = pool.get_by_tab("t1").await.unwrap();
        assert!(!Arc::ptr_eq(&current, &original));
        assert_eq!(current.ref_count(), 1, "references migrated");
        assert!(current.is_healthy());
    }

    #[tokio::test]
    async fn exhausted_retries_abandon_the_key() {
        // Bind then drop a listener so the port is dead for redials.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (pool, _manager, events) = wired_pool(fast_opts()).await;
        let mut rx = events.subscribe_connection();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold until the test severs it.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(stream);
        });

        let cfg = ConnectConfig::telnet("127.0.0.1", port).with_tab("t1");
        let original = pool.get_connection(cfg).await.unwrap();

        // Kill the server and the link.
        accept.abort();
        original.telnet_link().unwrap().mark_closed();
        pool.report_lost(&original.key).await;

        let reason = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.unwrap() {
                    ConnectionEvent::ReconnectAbandoned { reason, .. } => break reason,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert!(reason.contains("3 attempts"), "{reason}");
        assert_eq!(pool.len().await, 0);
        assert!(pool.get_by_tab("t1").await.is_none());
    }
}
