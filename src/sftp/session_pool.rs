//! Per-tab pool of SFTP sub-sessions over the tab's SSH transport.
//!
//! Each tab keeps at most `MaxSessionsPerTab` sub-sessions; one of them is
//! the *primary* used for browsing, the rest exist only to be borrowed by
//! transfers. A global cap bounds sessions across all tabs, and a sweeper
//! closes idle sessions and probes the remainder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use russh_sftp::client::SftpSession;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{SftpOptions, TabId};
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::transport::Transport;

pub struct SftpEntry {
    pub id: Uuid,
    pub sftp: Arc<SftpSession>,
    pub transport_key: String,
    pub created_at: Instant,
    last_used: parking_lot::Mutex<Instant>,
    /// Last successful health probe; fresh sessions skip the next probe.
    last_checked: parking_lot::Mutex<Instant>,
    busy: AtomicUsize,
    active: AtomicBool,
    /// Holds one of the transport's channel permits for the session's life.
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl SftpEntry {
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.duration_since(*self.last_used.lock())
    }
}

#[derive(Default)]
struct TabSessions {
    sessions: Vec<Arc<SftpEntry>>,
    primary: Option<Uuid>,
}

/// Decrement a busy count without wrapping below zero.
fn saturating_release(busy: &AtomicUsize) {
    let mut current = busy.load(Ordering::SeqCst);
    loop {
        if current == 0 {
            return;
        }
        match busy.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

pub struct SftpSessionPool {
    opts: SftpOptions,
    pool: Arc<ConnectionPool>,
    tabs: tokio::sync::Mutex<HashMap<TabId, TabSessions>>,
    /// Per-tab creation locks so concurrent `ensure_primary` callers
    /// coalesce on one handshake.
    locks: tokio::sync::Mutex<HashMap<TabId, Arc<tokio::sync::Mutex<()>>>>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SftpSessionPool {
    pub fn new(opts: SftpOptions, pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self {
            opts,
            pool,
            tabs: tokio::sync::Mutex::new(HashMap::new()),
            locks: tokio::sync::Mutex::new(HashMap::new()),
            sweeper: parking_lot::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.opts.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                this.sweep().await;
            }
        }));
    }

    async fn tab_lock(&self, tab: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(tab.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// The tab's primary session, creating or replacing it as needed. The
    /// health check is a quick `stat(".")`, skipped when the session was
    /// probed recently.
    pub async fn ensure_primary(&self, tab: &str) -> Result<Arc<SftpEntry>> {
        let gate = self.tab_lock(tab).await;
        let _guard = gate.lock().await;

        if let Some(primary) = self.current_primary(tab).await {
            let recently_checked =
                primary.last_checked.lock().elapsed() < self.opts.probe_timeout * 6;
            if recently_checked {
                primary.touch();
                return Ok(primary);
            }
            let probe =
                tokio::time::timeout(self.opts.probe_timeout, primary.sftp.metadata(".")).await;
            match probe {
                Ok(Ok(_)) => {
                    primary.touch();
                    *primary.last_checked.lock() = Instant::now();
                    return Ok(primary);
                }
                Ok(Err(err)) => {
                    debug!(tab, "primary sftp session failed probe: {err}");
                }
                Err(_) => {
                    debug!(tab, "primary sftp session probe timed out");
                }
            }
            self.drop_session(tab, primary.id).await;
        }

        let entry = self.create_session(tab).await?;
        let mut tabs = self.tabs.lock().await;
        let bucket = tabs.entry(tab.to_string()).or_default();
        bucket.sessions.push(Arc::clone(&entry));
        bucket.primary = Some(entry.id);
        Ok(entry)
    }

    /// Borrow a session for an operation: prefer creating a fresh one while
    /// under the per-tab cap, otherwise share the least busy. Pair with
    /// [`SftpSessionPool::release`].
    pub async fn borrow(&self, tab: &str) -> Result<Arc<SftpEntry>> {
        let gate = self.tab_lock(tab).await;
        let _guard = gate.lock().await;

        let existing = {
            let tabs = self.tabs.lock().await;
            let bucket = tabs.get(tab);
            let count = bucket.map(|b| b.sessions.len()).unwrap_or(0);
            if count >= self.opts.max_sessions_per_tab {
                bucket.and_then(|b| {
                    b.sessions
                        .iter()
                        .filter(|s| s.is_active())
                        .min_by_key(|s| s.busy_count())
                        .cloned()
                })
            } else {
                None
            }
        };

        let entry = match existing {
            Some(entry) => entry,
            None => {
                let entry = self.create_session(tab).await?;
                let mut tabs = self.tabs.lock().await;
                let bucket = tabs.entry(tab.to_string()).or_default();
                bucket.sessions.push(Arc::clone(&entry));
                if bucket.primary.is_none() {
                    bucket.primary = Some(entry.id);
                }
                entry
            }
        };
        entry.busy.fetch_add(1, Ordering::SeqCst);
        entry.touch();
        Ok(entry)
    }

    /// Return a borrowed session. Releasing an already-released session is a
    /// no-op on the busy count.
    pub fn release(&self, entry: &SftpEntry) {
        entry.touch();
        saturating_release(&entry.busy);
    }

    pub async fn close_all(&self, tab: &str) {
        let removed = {
            let mut tabs = self.tabs.lock().await;
            tabs.remove(tab)
        };
        if let Some(bucket) = removed {
            debug!(tab, sessions = bucket.sessions.len(), "closing sftp sessions");
            for session in bucket.sessions {
                session.active.store(false, Ordering::SeqCst);
            }
        }
        self.locks.lock().await.remove(tab);
    }

    pub async fn close_one(&self, tab: &str, id: Uuid) {
        self.drop_session(tab, id).await;
    }

    pub async fn total_sessions(&self) -> usize {
        let tabs = self.tabs.lock().await;
        tabs.values().map(|b| b.sessions.len()).sum()
    }

    pub async fn primary_id(&self, tab: &str) -> Option<Uuid> {
        self.tabs.lock().await.get(tab).and_then(|b| b.primary)
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
    }

    async fn current_primary(&self, tab: &str) -> Option<Arc<SftpEntry>> {
        let tabs = self.tabs.lock().await;
        let bucket = tabs.get(tab)?;
        let id = bucket.primary?;
        bucket
            .sessions
            .iter()
            .find(|s| s.id == id && s.is_active())
            .cloned()
    }

    async fn drop_session(&self, tab: &str, id: Uuid) {
        let mut tabs = self.tabs.lock().await;
        if let Some(bucket) = tabs.get_mut(tab) {
            if let Some(pos) = bucket.sessions.iter().position(|s| s.id == id) {
                let session = bucket.sessions.remove(pos);
                session.active.store(false, Ordering::SeqCst);
            }
            if bucket.primary == Some(id) {
                bucket.primary = bucket.sessions.first().map(|s| s.id);
            }
        }
    }

    async fn create_session(&self, tab: &str) -> Result<Arc<SftpEntry>> {
        self.enforce_global_cap().await;

        let transport = self
            .pool
            .get_by_tab(tab)
            .await
            .ok_or(Error::NotConnected)?;
        self.open_on(&transport).await
    }

    /// Open one SFTP sub-session over an SSH transport, waiting for the
    /// transport to become ready when it is mid-(re)connect.
    pub(crate) async fn open_on(&self, transport: &Arc<Transport>) -> Result<Arc<SftpEntry>> {
        transport.wait_ready(self.opts.ssh_ready_timeout).await?;
        let handle = transport.ssh_handle().ok_or_else(|| {
            Error::TransportNotReady("file operations require an ssh transport".into())
        })?;
        let permit = Arc::clone(&transport.channel_permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown)?;

        let channel = handle.channel_open_session().await.map_err(Error::from)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(Error::from)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(Error::from)?;
        // The library default request timeout is too short for slow links.
        sftp.set_timeout(self.opts.request_timeout.as_secs());

        debug!(key = %transport.key, "sftp sub-session opened");
        Ok(Arc::new(SftpEntry {
            id: Uuid::new_v4(),
            sftp: Arc::new(sftp),
            transport_key: transport.key.clone(),
            created_at: Instant::now(),
            last_used: parking_lot::Mutex::new(Instant::now()),
            last_checked: parking_lot::Mutex::new(Instant::now()),
            busy: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            _permit: permit,
        }))
    }

    /// Over the global cap, close the oldest-created idle sessions first.
    async fn enforce_global_cap(&self) {
        let mut tabs = self.tabs.lock().await;
        let mut total: usize = tabs.values().map(|b| b.sessions.len()).sum();
        while total >= self.opts.max_total_sessions {
            let victim = tabs
                .iter()
                .flat_map(|(tab, bucket)| {
                    bucket
                        .sessions
                        .iter()
                        .filter(|s| s.busy_count() == 0)
                        .map(move |s| (tab.clone(), s.id, s.created_at))
                })
                .min_by_key(|(_, _, created)| *created);
            let Some((tab, id, _)) = victim else {
                warn!(total, "sftp session cap reached with every session busy");
                break;
            };
            if let Some(bucket) = tabs.get_mut(&tab) {
                if let Some(pos) = bucket.sessions.iter().position(|s| s.id == id) {
                    let session = bucket.sessions.remove(pos);
                    session.active.store(false, Ordering::SeqCst);
                    debug!(tab = %tab, "evicted sftp session for global cap");
                }
                if bucket.primary == Some(id) {
                    bucket.primary = bucket.sessions.first().map(|s| s.id);
                }
            }
            total -= 1;
        }
    }

    /// Idle sweep: close sessions idle past the threshold, probe the rest
    /// with a bounded `readdir("/")`.
    async fn sweep(&self) {
        let now = Instant::now();
        let mut to_probe: Vec<(TabId, Arc<SftpEntry>)> = Vec::new();
        {
            let mut tabs = self.tabs.lock().await;
            for (tab, bucket) in tabs.iter_mut() {
                bucket.sessions.retain(|session| {
                    let expired = session.busy_count() == 0
                        && session.idle_for(now) > self.opts.session_idle_timeout;
                    if expired {
                        debug!(tab = %tab, "closing idle sftp session");
                        session.active.store(false, Ordering::SeqCst);
                    } else {
                        to_probe.push((tab.clone(), Arc::clone(session)));
                    }
                    !expired
                });
                if let Some(primary) = bucket.primary {
                    if !bucket.sessions.iter().any(|s| s.id == primary) {
                        bucket.primary = bucket.sessions.first().map(|s| s.id);
                    }
                }
            }
            tabs.retain(|_, bucket| !bucket.sessions.is_empty());
        }

        for (tab, session) in to_probe {
            let probe =
                tokio::time::timeout(self.opts.probe_timeout, session.sftp.read_dir("/")).await;
            match probe {
                Ok(Ok(_)) => {
                    *session.last_checked.lock() = Instant::now();
                }
                Ok(Err(err)) => {
                    warn!(tab = %tab, "sftp session failed health probe: {err}");
                    self.drop_session(&tab, session.id).await;
                }
                Err(_) => {
                    warn!(tab = %tab, "sftp session health probe timed out");
                    self.drop_session(&tab, session.id).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_release_is_balanced_and_saturating() {
        let busy = AtomicUsize::new(0);
        busy.fetch_add(1, Ordering::SeqCst);
        busy.fetch_add(1, Ordering::SeqCst);
        saturating_release(&busy);
        saturating_release(&busy);
        assert_eq!(busy.load(Ordering::SeqCst), 0);
        // A borrow followed by release nets zero; an extra release stays zero.
        saturating_release(&busy);
        assert_eq!(busy.load(Ordering::SeqCst), 0);
    }
}
