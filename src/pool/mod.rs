//! The connection pool: owns every live SSH and Telnet transport.
//!
//! Transports are keyed by `(host, port, user)`, or a tab-scoped variant,
//! and shared across tabs through reference counting. The pool enforces a
//! global cap and a per-server cap, evicts idle unreferenced transports
//! (oldest last-used first), queues callers in a bounded FIFO when full, and
//! runs two background sweeps: a quiet monitor pass that detects dead
//! transports, and a slower pass that closes idle ones.
//!
//! Unexpectedly closed transports that still have references are marked lost
//! and handed to the reconnection manager; the replacement is installed
//! under the same key so referring tabs migrate in place.

pub mod reconnect;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnectConfig, PoolOptions, Protocol, ProxyRef, TabId};
use crate::error::{Error, Result};
use crate::events::{AlertKind, ConnectionEvent, ConnectionStatus, EventBus};
use crate::proxy::ProxyConfig;
use crate::store::ConfigStore;
use crate::telnet::TelnetLink;
use crate::transport::{connect_ssh, Link, Transport, TransportState};
use reconnect::ReconnectManager;

/// Derive the deterministic pool key for a config. Never depends on
/// credentials.
pub fn derive_key(cfg: &ConnectConfig, proxy: Option<&ProxyConfig>) -> String {
    match cfg.protocol {
        Protocol::Telnet => match &cfg.tab_id {
            Some(tab) => format!("telnet:{}:{}:{}", cfg.host, cfg.port, tab),
            None => format!("telnet:{}:{}", cfg.host, cfg.port),
        },
        Protocol::Ssh => {
            let mut key = match &cfg.tab_id {
                Some(tab) => format!("tab:{}:{}:{}:{}", tab, cfg.host, cfg.port, cfg.username),
                None => format!("{}:{}:{}", cfg.host, cfg.port, cfg.username),
            };
            if let Some(proxy) = proxy {
                let kind = match proxy.kind {
                    crate::proxy::ProxyKind::Http => "http",
                    crate::proxy::ProxyKind::Https => "https",
                    crate::proxy::ProxyKind::Socks4 => "socks4",
                    crate::proxy::ProxyKind::Socks5 => "socks5",
                };
                key.push_str(&format!(":proxy:{}:{}:{}", proxy.host, proxy.port, kind));
            }
            key
        }
    }
}

struct PoolInner {
    transports: HashMap<String, Arc<Transport>>,
    bindings: HashMap<TabId, String>,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl PoolInner {
    fn count_for_server(&self, host: &str, port: u16, user: &str) -> usize {
        self.transports
            .values()
            .filter(|t| t.host == host && t.port == port && t.username == user)
            .count()
    }

    /// Oldest-last-used unreferenced transport, optionally limited to one
    /// server.
    fn pick_evictable(&self, server: Option<(&str, u16, &str)>) -> Option<Arc<Transport>> {
        self.transports
            .values()
            .filter(|t| !t.referenced())
            .filter(|t| match server {
                Some((host, port, user)) => {
                    t.host == host && t.port == port && t.username == user
                }
                None => true,
            })
            .min_by_key(|t| t.last_used())
            .cloned()
    }

    fn wake_one(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
    }
}

pub struct ConnectionPool {
    opts: PoolOptions,
    events: Arc<EventBus>,
    store: Arc<dyn ConfigStore>,
    inner: tokio::sync::Mutex<PoolInner>,
    /// Single-flight guards so concurrent `get_connection` calls for one key
    /// coalesce on a single handshake.
    creating: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    reconnect: OnceLock<Arc<ReconnectManager>>,
    shutting_down: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(opts: PoolOptions, events: Arc<EventBus>, store: Arc<dyn ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            opts,
            events,
            store,
            inner: tokio::sync::Mutex::new(PoolInner {
                transports: HashMap::new(),
                bindings: HashMap::new(),
                waiters: VecDeque::new(),
            }),
            creating: tokio::sync::Mutex::new(HashMap::new()),
            reconnect: OnceLock::new(),
            shutting_down: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    pub(crate) fn set_reconnect(&self, manager: Arc<ReconnectManager>) {
        let _ = self.reconnect.set(manager);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start the two background sweeps. Health checks never block
    /// `get_connection`: they take the inner lock only briefly to snapshot.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let monitor = {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(pool.opts.monitor_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    pool.monitor_pass().await;
                }
            })
        };
        let sweeper = {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(pool.opts.sweep_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    pool.sweep_pass().await;
                }
            })
        };
        tasks.push(monitor);
        tasks.push(sweeper);
    }

    // ---- acquisition -------------------------------------------------

    /// Return a healthy pooled transport for the config's key, or create
    /// one. Waits in a bounded FIFO when the pool is full.
    pub async fn get_connection(&self, cfg: ConnectConfig) -> Result<Arc<Transport>> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let proxy = self.resolve_proxy(&cfg).await?;
        let key = derive_key(&cfg, proxy.as_ref());

        loop {
            if self.is_shutting_down() {
                return Err(Error::Shutdown);
            }
            match self.try_acquire_or_reserve(&cfg, &key).await? {
                Acquired::Hit(transport) => return Ok(transport),
                Acquired::Evicted(victim) => {
                    victim.close(false).await;
                    self.events
                        .pool_alert(AlertKind::TransportEvicted, victim.key.clone());
                    continue;
                }
                Acquired::Wait(rx) => {
                    match tokio::time::timeout(self.opts.waiter_timeout, rx).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Err(Error::Shutdown),
                        Err(_) => {
                            return Err(Error::PoolExhausted(format!(
                                "no transport slot freed within {:?} (cap {})",
                                self.opts.waiter_timeout, self.opts.max_connections
                            )));
                        }
                    }
                }
                Acquired::Create => {
                    if let Some(transport) =
                        self.create_under_lock(&cfg, proxy.as_ref(), &key).await?
                    {
                        return Ok(transport);
                    }
                    // Lost the single-flight race; loop back to the fast path.
                }
            }
        }
    }

    async fn try_acquire_or_reserve(&self, cfg: &ConnectConfig, key: &str) -> Result<Acquired> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.transports.get(key).cloned() {
            match existing.state() {
                TransportState::Ready if existing.is_healthy() => {
                    existing.acquire();
                    if let Some(tab) = &cfg.tab_id {
                        existing.add_tab(tab);
                        inner.bindings.insert(tab.clone(), key.to_string());
                    }
                    debug!(key = %key, refs = existing.ref_count(), "pool hit");
                    return Ok(Acquired::Hit(existing));
                }
                TransportState::Lost => {
                    return Err(Error::TransportLost(format!("{key} is reconnecting")));
                }
                _ => {
                    if existing.referenced() {
                        return Err(Error::TransportLost(format!("{key} is unavailable")));
                    }
                    inner.transports.remove(key);
                    return Ok(Acquired::Evicted(existing));
                }
            }
        }

        // Global cap.
        if inner.transports.len() >= self.opts.max_connections {
            if let Some(victim) = inner.pick_evictable(None) {
                inner.transports.remove(&victim.key);
                return Ok(Acquired::Evicted(victim));
            }
            self.events.pool_alert(
                AlertKind::PoolFull,
                format!("{} transports, all referenced", inner.transports.len()),
            );
            return self.reserve_waiter(&mut inner);
        }

        // Per-server cap: ceil(max/2) per (host, port, user).
        let per_server = inner.count_for_server(&cfg.host, cfg.port, &cfg.username);
        if per_server >= self.opts.max_per_server() {
            if let Some(victim) =
                inner.pick_evictable(Some((cfg.host.as_str(), cfg.port, cfg.username.as_str())))
            {
                inner.transports.remove(&victim.key);
                return Ok(Acquired::Evicted(victim));
            }
            self.events.pool_alert(
                AlertKind::PerServerCapReached,
                format!("{}:{} already has {per_server} transports", cfg.host, cfg.port),
            );
            return self.reserve_waiter(&mut inner);
        }

        Ok(Acquired::Create)
    }

    fn reserve_waiter(&self, inner: &mut PoolInner) -> Result<Acquired> {
        if inner.waiters.len() >= self.opts.waiter_capacity {
            self.events.pool_alert(
                AlertKind::WaiterQueueFull,
                format!("{} waiters already queued", inner.waiters.len()),
            );
            return Err(Error::PoolExhausted(format!(
                "waiter queue full ({} queued)",
                inner.waiters.len()
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(tx);
        Ok(Acquired::Wait(rx))
    }

    /// Single-flight creation. Returns `None` when another caller created
    /// the transport first (the caller retries the fast path).
    async fn create_under_lock(
        &self,
        cfg: &ConnectConfig,
        proxy: Option<&ProxyConfig>,
        key: &str,
    ) -> Result<Option<Arc<Transport>>> {
        let gate = {
            let mut creating = self.creating.lock().await;
            Arc::clone(
                creating
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let guard = gate.lock().await;

        let result = async {
            // Someone may have finished while this caller waited on the gate.
            {
                let inner = self.inner.lock().await;
                if inner.transports.contains_key(key) {
                    return Ok(None);
                }
            }

            let transport = self.dial(cfg.clone(), proxy, key).await?;
            let transport = Arc::new(transport);
            transport.acquire();
            if let Some(tab) = &cfg.tab_id {
                transport.add_tab(tab);
            }

            let mut inner = self.inner.lock().await;
            if self.is_shutting_down() {
                drop(inner);
                transport.close(true).await;
                return Err(Error::Shutdown);
            }
            inner
                .transports
                .insert(key.to_string(), Arc::clone(&transport));
            if let Some(tab) = &cfg.tab_id {
                inner.bindings.insert(tab.clone(), key.to_string());
            }
            info!(key = %key, protocol = ?cfg.protocol, "transport established");
            Ok(Some(transport))
        }
        .await;

        drop(guard);
        self.creating.lock().await.remove(key);
        result
    }

    /// The raw creation path, shared with the reconnection manager.
    /// Per-host tuning from the config store overrides the dial defaults.
    pub(crate) async fn dial(
        &self,
        cfg: ConnectConfig,
        proxy: Option<&ProxyConfig>,
        key: &str,
    ) -> Result<Transport> {
        let opts = self.tuned_options(&cfg.host).await;
        match cfg.protocol {
            Protocol::Ssh => {
                let (link, x11_rx) = if cfg.enable_x11 {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let handle = connect_ssh(&cfg, proxy, &opts, Some(tx)).await?;
                    (Link::Ssh(Arc::new(handle)), Some(rx))
                } else {
                    let handle = connect_ssh(&cfg, proxy, &opts, None).await?;
                    (Link::Ssh(Arc::new(handle)), None)
                };
                let transport = Transport::new(key.to_string(), cfg, link, &opts);
                Ok(match x11_rx {
                    Some(rx) => transport.with_x11_rx(rx),
                    None => transport,
                })
            }
            Protocol::Telnet => {
                let link = TelnetLink::connect(&cfg.host, cfg.port, opts.connect_timeout).await?;
                Ok(Transport::new(
                    key.to_string(),
                    cfg,
                    Link::Telnet(Arc::new(link)),
                    &opts,
                ))
            }
        }
    }

    async fn tuned_options(&self, host: &str) -> PoolOptions {
        let mut opts = self.opts.clone();
        if let Ok(Some(tuning)) = self.store.host_tuning(host).await {
            if let Some(secs) = tuning.connect_timeout_secs {
                opts.connect_timeout = std::time::Duration::from_secs(secs);
            }
            if let Some(secs) = tuning.keepalive_secs {
                opts.keepalive_interval = std::time::Duration::from_secs(secs);
            }
        }
        opts
    }

    pub(crate) async fn resolve_proxy(&self, cfg: &ConnectConfig) -> Result<Option<ProxyConfig>> {
        match &cfg.proxy {
            None => Ok(None),
            Some(ProxyRef::Inline(proxy)) => Ok(Some(proxy.clone())),
            Some(ProxyRef::Named(name)) => match self.store.proxy_record(name).await? {
                Some(proxy) => Ok(Some(proxy)),
                None => Err(Error::Unknown(format!("unknown proxy record {name:?}"))),
            },
        }
    }

    // ---- release / bindings ------------------------------------------

    /// Decrement the reference taken by `get_connection`. With a tab id the
    /// binding is cleared too. A transport at zero references goes idle;
    /// closure is deferred to the idle sweep.
    pub async fn release(&self, transport: &Transport, tab: Option<&str>) {
        let mut inner = self.inner.lock().await;
        if let Some(tab) = tab {
            transport.remove_tab(tab);
            if inner.bindings.get(tab).map(String::as_str) == Some(transport.key.as_str()) {
                inner.bindings.remove(tab);
            }
        }
        let remaining = transport.release_ref();
        if remaining == 0 && !transport.has_tabs() {
            debug!(key = %transport.key, "transport idle");
            inner.wake_one();
        }
    }

    pub async fn add_tab_reference(&self, tab: &str, key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(transport) = inner.transports.get(key) {
            transport.add_tab(tab);
            inner.bindings.insert(tab.to_string(), key.to_string());
        }
    }

    pub async fn remove_tab_reference(&self, tab: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(key) = inner.bindings.remove(tab) {
            if let Some(transport) = inner.transports.get(&key) {
                transport.remove_tab(tab);
                if !transport.referenced() {
                    inner.wake_one();
                }
            }
        }
    }

    /// Exact binding lookup with a fallback scan for legacy tab-scoped keys
    /// of the form `tab:<tabId>:host:port:user[...]`.
    pub async fn get_by_tab(&self, tab: &str) -> Option<Arc<Transport>> {
        let inner = self.inner.lock().await;
        if let Some(key) = inner.bindings.get(tab) {
            if let Some(transport) = inner.transports.get(key) {
                return Some(Arc::clone(transport));
            }
        }
        let prefix = format!("tab:{tab}:");
        inner
            .transports
            .iter()
            .find(|(key, _)| key.starts_with(&prefix))
            .map(|(_, transport)| Arc::clone(transport))
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Transport>> {
        self.inner.lock().await.transports.get(key).cloned()
    }

    /// Close and drop a transport right away if nothing refers to it any
    /// more. Used on tab close for tab-scoped transports instead of waiting
    /// for the idle sweep.
    pub async fn retire_if_unreferenced(&self, key: &str) {
        let victim = {
            let mut inner = self.inner.lock().await;
            match inner.transports.get(key) {
                Some(t) if !t.referenced() => inner.transports.remove(key),
                _ => None,
            }
        };
        if let Some(victim) = victim {
            victim.close(true).await;
            self.inner.lock().await.wake_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.transports.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.transports.is_empty()
    }

    pub async fn binding_count(&self) -> usize {
        self.inner.lock().await.bindings.len()
    }

    // ---- loss / replacement ------------------------------------------

    /// Unexpected close. Referenced transports are kept under their key in
    /// `Lost` state and handed to the reconnection manager; unreferenced
    /// ones are evicted on the spot.
    pub async fn report_lost(&self, key: &str) {
        let transport = {
            let inner = self.inner.lock().await;
            inner.transports.get(key).cloned()
        };
        let Some(transport) = transport else {
            return;
        };
        if transport.intentional_close() || self.is_shutting_down() {
            return;
        }
        if transport.state() == TransportState::Lost {
            return;
        }

        if transport.referenced() {
            warn!(key = %key, refs = transport.ref_count(), "transport lost, scheduling reconnect");
            transport.set_state(TransportState::Lost);
            for tab in transport.tabs() {
                self.events.status(
                    &tab,
                    ConnectionStatus {
                        connected: false,
                        connecting: true,
                        quality: None,
                        host: transport.host.clone(),
                        port: transport.port,
                    },
                );
            }
            if let Some(manager) = self.reconnect.get() {
                manager.register(Arc::clone(&transport)).await;
            }
        } else {
            debug!(key = %key, "unreferenced transport lost, evicting");
            let mut inner = self.inner.lock().await;
            inner.transports.remove(key);
            inner.wake_one();
            drop(inner);
            transport.close(false).await;
        }
    }

    /// Install the replacement built by the reconnection manager. The new
    /// transport inherits the old one's references and bindings.
    pub(crate) async fn install_replacement(&self, key: &str, replacement: Arc<Transport>) {
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.transports.get(key) {
            replacement.inherit_refs_from(old);
            old.set_state(TransportState::Abandoned);
        }
        inner
            .transports
            .insert(key.to_string(), Arc::clone(&replacement));
        drop(inner);

        info!(key = %key, "transport replaced");
        self.events
            .connection(ConnectionEvent::Replaced { key: key.to_string() });
        for tab in replacement.tabs() {
            self.events.status(
                &tab,
                ConnectionStatus {
                    connected: true,
                    connecting: false,
                    quality: None,
                    host: replacement.host.clone(),
                    port: replacement.port,
                },
            );
        }
    }

    /// Reconnection gave up: drop the entry and tell every bound tab.
    pub(crate) async fn remove_abandoned(&self, key: &str, reason: &str) {
        let mut inner = self.inner.lock().await;
        let Some(transport) = inner.transports.remove(key) else {
            return;
        };
        inner.bindings.retain(|_, bound| bound != key);
        inner.wake_one();
        drop(inner);

        transport.set_state(TransportState::Abandoned);
        self.events.connection(ConnectionEvent::ReconnectAbandoned {
            key: key.to_string(),
            reason: reason.to_string(),
        });
        for tab in transport.tabs() {
            self.events.status(
                &tab,
                ConnectionStatus {
                    connected: false,
                    connecting: false,
                    quality: None,
                    host: transport.host.clone(),
                    port: transport.port,
                },
            );
        }
    }

    // ---- sweeps ------------------------------------------------------

    /// Monitor-grade pass: find dead transports. Cheap and quiet.
    async fn monitor_pass(&self) {
        let snapshot: Vec<Arc<Transport>> = {
            let inner = self.inner.lock().await;
            inner.transports.values().cloned().collect()
        };
        for transport in snapshot {
            if transport.state() == TransportState::Ready && !transport.is_healthy() {
                self.report_lost(&transport.key).await;
            }
        }
    }

    /// Pool-grade pass: close unreferenced transports idle past the
    /// threshold.
    async fn sweep_pass(&self) {
        let now = Instant::now();
        let idle = self.opts.idle_timeout;
        let victims: Vec<Arc<Transport>> = {
            let mut inner = self.inner.lock().await;
            let keys: Vec<String> = inner
                .transports
                .values()
                .filter(|t| t.is_evictable(now, idle))
                .map(|t| t.key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| inner.transports.remove(key))
                .collect()
        };
        for victim in victims {
            debug_assert!(!victim.referenced(), "evicting a referenced transport");
            debug!(key = %victim.key, "closing idle transport");
            victim.close(false).await;
        }
        if self.inner.lock().await.transports.is_empty() {
            debug!("pool empty after sweep");
        }
    }

    // ---- shutdown ----------------------------------------------------

    /// Stop sweeps, fail queued waiters with `Shutdown`, close every
    /// transport, drop all state.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let (transports, waiters) = {
            let mut inner = self.inner.lock().await;
            let transports: Vec<Arc<Transport>> = inner.transports.drain().map(|(_, t)| t).collect();
            let waiters: Vec<oneshot::Sender<()>> = inner.waiters.drain(..).collect();
            inner.bindings.clear();
            (transports, waiters)
        };
        // Dropping the senders fails every waiter's recv, which surfaces as
        // `Shutdown` in `get_connection`.
        drop(waiters);
        for transport in transports {
            transport.close(true).await;
        }
        info!("connection pool shut down");
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_tests(&self, transport: Arc<Transport>) {
        let mut inner = self.inner.lock().await;
        inner
            .transports
            .insert(transport.key.clone(), Arc::clone(&transport));
        for tab in transport.tabs() {
            inner.bindings.insert(tab, transport.key.clone());
        }
    }
}

enum Acquired {
    Hit(Arc<Transport>),
    Evicted(Arc<Transport>),
    Wait(oneshot::Receiver<()>),
    Create,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMethod;
    use crate::store::MemoryStore;
    use secrecy::SecretString;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn ssh_cfg(host: &str, user: &str, tab: Option<&str>) -> ConnectConfig {
        let mut cfg = ConnectConfig::password(host, 22, user, "pw");
        cfg.tab_id = tab.map(str::to_string);
        cfg
    }

    #[test]
    fn key_derivation_shapes() {
        let plain = ssh_cfg("h1", "u", None);
        assert_eq!(derive_key(&plain, None), "h1:22:u");

        let tabbed = ssh_cfg("h1", "u", Some("t9"));
        assert_eq!(derive_key(&tabbed, None), "tab:t9:h1:22:u");

        let proxy = ProxyConfig {
            kind: crate::proxy::ProxyKind::Socks5,
            host: "p1".into(),
            port: 1080,
            username: None,
            password: None,
        };
        assert_eq!(
            derive_key(&tabbed, Some(&proxy)),
            "tab:t9:h1:22:u:proxy:p1:1080:socks5"
        );

        let telnet = ConnectConfig::telnet("h2", 23);
        assert_eq!(derive_key(&telnet, None), "telnet:h2:23");
        let telnet_tab = ConnectConfig::telnet("h2", 23).with_tab("t1");
        assert_eq!(derive_key(&telnet_tab, None), "telnet:h2:23:t1");
    }

    #[test]
    fn key_ignores_credentials() {
        let a = ssh_cfg("h1", "u", None);
        let mut b = ssh_cfg("h1", "u", None);
        b.auth = AuthMethod::Password(SecretString::from("different".to_string()));
        assert_eq!(derive_key(&a, None), derive_key(&b, None));
    }

    /// A local listener that accepts and holds connections, standing in for
    /// a telnet server.
    async fn telnet_fixture() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn accept_loop(listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        // Park the socket so the link stays connected.
                        tokio::spawn(async move {
                            let _stream = stream;
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    fn pool_with(opts: PoolOptions) -> Arc<ConnectionPool> {
        ConnectionPool::new(opts, Arc::new(EventBus::default()), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn connect_reuse_and_release() {
        let (listener, port) = telnet_fixture().await;
        accept_loop(listener);
        let pool = pool_with(PoolOptions::default());

        let cfg = ConnectConfig::telnet("127.0.0.1", port).with_tab("t1");
        let first = pool.get_connection(cfg.clone()).await.unwrap();
        assert_eq!(first.ref_count(), 1);
        assert_eq!(pool.len().await, 1);

        // Same key: pool hit, no second dial.
        let second = pool.get_connection(cfg.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(pool.len().await, 1);

        pool.release(&second, None).await;
        pool.release(&first, Some("t1")).await;
        assert_eq!(first.ref_count(), 0);
        assert!(!first.has_tabs());
        assert_eq!(pool.binding_count().await, 0);
        // Idle, not closed: still pooled for reuse.
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn get_by_tab_exact_and_legacy_fallback() {
        let (listener, port) = telnet_fixture().await;
        accept_loop(listener);
        let pool = pool_with(PoolOptions::default());

        let cfg = ConnectConfig::telnet("127.0.0.1", port).with_tab("t3");
        let transport = pool.get_connection(cfg).await.unwrap();
        let found = pool.get_by_tab("t3").await.unwrap();
        assert!(Arc::ptr_eq(&transport, &found));
        assert!(pool.get_by_tab("other").await.is_none());

        // Legacy form: binding missing, key carries the tab prefix.
        let legacy_cfg = ssh_cfg("h9", "u", Some("t7"));
        let legacy_key = derive_key(&legacy_cfg, None);
        let link = crate::transport::Link::Telnet(Arc::new(TelnetLink::closed_for_tests()));
        let legacy = Arc::new(Transport::new(
            legacy_key,
            legacy_cfg,
            link,
            &PoolOptions::default(),
        ));
        pool.insert_for_tests(Arc::clone(&legacy)).await;
        let found = pool.get_by_tab("t7").await.unwrap();
        assert!(Arc::ptr_eq(&legacy, &found));
    }

    #[tokio::test]
    async fn full_pool_evicts_oldest_unreferenced() {
        // Three servers (distinct ports), cap of two transports.
        let (l1, p1) = telnet_fixture().await;
        let (l2, p2) = telnet_fixture().await;
        let (l3, p3) = telnet_fixture().await;
        accept_loop(l1);
        accept_loop(l2);
        accept_loop(l3);
        let mut opts = PoolOptions::default();
        opts.max_connections = 2;
        let pool = pool_with(opts);

        let a = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", p1).with_tab("a"))
            .await
            .unwrap();
        let b = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", p2).with_tab("b"))
            .await
            .unwrap();

        // Release `a` first so it is the oldest unreferenced.
        pool.release(&a, Some("a")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.release(&b, Some("b")).await;
        b.touch();

        let c = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", p3).with_tab("c"))
            .await
            .unwrap();
        assert_eq!(pool.len().await, 2);
        assert!(pool.get_by_tab("c").await.is_some());
        // `a` was evicted, `b` survived.
        assert!(pool.get_by_tab("a").await.is_none());
        drop((b, c));
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_waiters() {
        let (l1, p1) = telnet_fixture().await;
        let (l2, p2) = telnet_fixture().await;
        accept_loop(l1);
        accept_loop(l2);
        let mut opts = PoolOptions::default();
        opts.max_connections = 1;
        opts.waiter_timeout = Duration::from_millis(200);
        let pool = pool_with(opts);

        let held = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", p1).with_tab("a"))
            .await
            .unwrap();

        let err = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", p2).with_tab("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)), "{err}");
        drop(held);
    }

    #[tokio::test]
    async fn release_wakes_waiter() {
        let (l1, p1) = telnet_fixture().await;
        let (l2, p2) = telnet_fixture().await;
        accept_loop(l1);
        accept_loop(l2);
        let mut opts = PoolOptions::default();
        opts.max_connections = 1;
        opts.waiter_timeout = Duration::from_secs(30);
        let pool = pool_with(opts);

        let held = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", p1).with_tab("a"))
            .await
            .unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let cfg = ConnectConfig::telnet("127.0.0.1", p2).with_tab("b");
            tokio::spawn(async move { pool.get_connection(cfg).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(&held, Some("a")).await;

        let got = waiter.await.unwrap().unwrap();
        assert!(got.is_healthy());
    }

    #[tokio::test]
    async fn shutdown_rejects_and_clears() {
        let (listener, port) = telnet_fixture().await;
        accept_loop(listener);
        let pool = pool_with(PoolOptions::default());
        let t = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", port).with_tab("a"))
            .await
            .unwrap();

        pool.shutdown().await;
        assert_eq!(pool.len().await, 0);
        assert!(t.intentional_close());
        let err = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn tab_references_track_bindings() {
        let (listener, port) = telnet_fixture().await;
        accept_loop(listener);
        let pool = pool_with(PoolOptions::default());

        let t = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", port))
            .await
            .unwrap();
        assert!(pool.get_by_tab("t5").await.is_none());

        pool.add_tab_reference("t5", &t.key).await;
        assert!(pool.get_by_tab("t5").await.is_some());
        assert!(t.has_tabs());

        pool.remove_tab_reference("t5").await;
        assert!(pool.get_by_tab("t5").await.is_none());
        assert!(!t.has_tabs());
        pool.release(&t, None).await;
    }

    #[tokio::test]
    async fn lost_unreferenced_transport_is_evicted() {
        let (listener, port) = telnet_fixture().await;
        accept_loop(listener);
        let pool = pool_with(PoolOptions::default());
        let t = pool
            .get_connection(ConnectConfig::telnet("127.0.0.1", port).with_tab("a"))
            .await
            .unwrap();
        pool.release(&t, Some("a")).await;
        t.telnet_link().unwrap().mark_closed();

        pool.report_lost(&t.key).await;
        assert_eq!(pool.len().await, 0);
    }
}
