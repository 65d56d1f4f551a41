//! The application context: owns every long-lived component.
//!
//! Nothing in the substrate is a global. The embedder builds one
//! `AppContext`, calls `start()` inside a tokio runtime, and tears the
//! whole thing down with `shutdown()`. Startup order is pressure → pool →
//! SFTP engine; shutdown runs the reverse, after a bounded grace period
//! for in-flight transfers.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::ContextOptions;
use crate::error::CancelKind;
use crate::events::EventBus;
use crate::latency::LatencyService;
use crate::pool::reconnect::ReconnectManager;
use crate::pool::ConnectionPool;
use crate::pressure::PressureController;
use crate::sftp::queue::SftpQueue;
use crate::sftp::session_pool::SftpSessionPool;
use crate::sftp::transfer::TransferEngine;
use crate::store::ConfigStore;

pub struct AppContext {
    pub opts: ContextOptions,
    pub events: Arc<EventBus>,
    pub store: Arc<dyn ConfigStore>,
    pub pressure: Arc<PressureController>,
    pub pool: Arc<ConnectionPool>,
    pub reconnect: Arc<ReconnectManager>,
    pub latency: Arc<LatencyService>,
    pub sessions: Arc<SftpSessionPool>,
    pub transfers: Arc<TransferEngine>,
    pub queue: Arc<SftpQueue>,
}

impl AppContext {
    pub fn new(opts: ContextOptions, store: Arc<dyn ConfigStore>) -> Arc<Self> {
        let events = Arc::new(EventBus::default());

        let pressure = PressureController::new(opts.pressure.clone());
        let pool = ConnectionPool::new(opts.pool.clone(), Arc::clone(&events), Arc::clone(&store));
        let reconnect = ReconnectManager::new(opts.reconnect.clone());
        reconnect.set_pool(&pool);
        pool.set_reconnect(Arc::clone(&reconnect));

        let latency = Arc::new(LatencyService::new(opts.latency.clone(), Arc::clone(&events)));
        let sessions = SftpSessionPool::new(opts.sftp.clone(), Arc::clone(&pool));
        let transfers = TransferEngine::new(
            opts.transfer.clone(),
            Arc::clone(&events),
            Arc::clone(&pressure),
            Arc::clone(&sessions),
        );
        let queue = SftpQueue::new(
            opts.queue.clone(),
            Arc::clone(&sessions),
            Arc::clone(&transfers),
        );
        transfers.set_queue(&queue);

        Arc::new(Self {
            opts,
            events,
            store,
            pressure,
            pool,
            reconnect,
            latency,
            sessions,
            transfers,
            queue,
        })
    }

    /// Spawn the background tasks. Must run inside a tokio runtime.
    pub fn start(&self) {
        self.pressure.start();
        self.pool.start();
        self.sessions.start();
        info!("session substrate started");
    }

    /// Deterministic teardown: wait out in-flight transfers for the grace
    /// period, drain the queues, then close sessions, pool and sampler.
    pub async fn shutdown(&self) {
        let grace: Duration = self.opts.shutdown_grace.0;
        info!(?grace, "session substrate shutting down");
        self.transfers.await_idle(grace).await;
        self.queue.cancel_all(CancelKind::Close);
        self.latency.shutdown();
        self.sessions.shutdown();
        self.reconnect.shutdown().await;
        self.pool.shutdown().await;
        self.pressure.stop();
        info!("session substrate stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn context_starts_and_shuts_down_cleanly() {
        let ctx = AppContext::new(ContextOptions::default(), Arc::new(MemoryStore::new()));
        ctx.start();
        assert_eq!(ctx.pool.len().await, 0);
        ctx.shutdown().await;
        // Idempotent enough to call twice.
        ctx.shutdown().await;
    }
}
