//! The pooled transport: one live SSH or Telnet connection.
//!
//! Carries the bookkeeping the pool's eviction/health logic runs on
//! (reference count, tab set, last-used stamp, state machine) plus the SSH
//! handshake path with host-key verification and optional proxy tunneling.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::client::Msg;
use russh::Channel;
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::{AuthMethod, ConnectConfig, HostKeyPolicy, PoolOptions, Protocol, TabId};
use crate::error::{Error, Result, TimeoutKind};
use crate::proxy::ProxyConfig;
use crate::telnet::TelnetLink;

/// Lifecycle of a transport. A `Transport` only exists once the dial and
/// handshake have succeeded, so it is born `Ready`; the in-flight dial is a
/// future inside the pool's creation path, bounded by the connect timeout
/// and torn down with the half-open socket on failure. `InUse`/`Idle` are
/// derived from the reference count while the stored state is `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Ready,
    InUse,
    Idle,
    Lost,
    Closing,
    Closed,
    Abandoned,
}

/// An X11 channel opened by the server, handed to the bridge.
pub struct X11Incoming {
    pub channel: Channel<Msg>,
    pub originator: String,
}

/// russh client handler: host-key policy plus X11 channel forwarding.
pub struct ClientHandler {
    host_key: HostKeyPolicy,
    x11_tx: Option<mpsc::UnboundedSender<X11Incoming>>,
}

impl ClientHandler {
    pub fn new(host_key: HostKeyPolicy, x11_tx: Option<mpsc::UnboundedSender<X11Incoming>>) -> Self {
        Self { host_key, x11_tx }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.host_key {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::Fingerprint(expected) => {
                let fp = server_public_key.fingerprint(russh::keys::HashAlg::Sha256);
                let actual = hex::encode(fp.as_bytes());
                let ok = actual == auth::normalize_hex(expected);
                if !ok {
                    warn!(expected = %expected, actual = %actual, "host key fingerprint mismatch");
                }
                Ok(ok)
            }
        }
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(tx) = &self.x11_tx {
            let _ = tx.send(X11Incoming {
                channel,
                originator: format!("{originator_address}:{originator_port}"),
            });
        }
        Ok(())
    }
}

/// The protocol-specific half of a transport.
pub enum Link {
    Ssh(Arc<russh::client::Handle<ClientHandler>>),
    Telnet(Arc<TelnetLink>),
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Ssh(_) => f.write_str("Link::Ssh(..)"),
            Link::Telnet(_) => f.write_str("Link::Telnet(..)"),
        }
    }
}

pub struct Transport {
    pub id: Uuid,
    pub key: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub created_at: Instant,
    /// Original config, kept so the reconnection manager can recreate the
    /// transport in place.
    pub config: ConnectConfig,
    /// Caps concurrent channels opened over this transport.
    pub channel_permits: Arc<Semaphore>,
    link: Link,
    last_used: parking_lot::Mutex<Instant>,
    state: parking_lot::Mutex<TransportState>,
    ready: watch::Sender<bool>,
    ref_count: AtomicUsize,
    tab_refs: parking_lot::Mutex<HashSet<TabId>>,
    intentional_close: AtomicBool,
    /// Server-opened X11 channels, taken once by the tab's acceptor.
    x11_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<X11Incoming>>>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(key: String, config: ConnectConfig, link: Link, opts: &PoolOptions) -> Self {
        let (ready, _) = watch::channel(true);
        Self {
            id: Uuid::new_v4(),
            key,
            protocol: config.protocol,
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            created_at: Instant::now(),
            config,
            channel_permits: Arc::new(Semaphore::new(opts.max_channels_per_transport)),
            link,
            last_used: parking_lot::Mutex::new(Instant::now()),
            state: parking_lot::Mutex::new(TransportState::Ready),
            ready,
            ref_count: AtomicUsize::new(0),
            tab_refs: parking_lot::Mutex::new(HashSet::new()),
            intentional_close: AtomicBool::new(false),
            x11_rx: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_x11_rx(self, rx: mpsc::UnboundedReceiver<X11Incoming>) -> Self {
        *self.x11_rx.lock() = Some(rx);
        self
    }

    /// Hand the X11 channel stream to the tab's acceptor. `None` after the
    /// first call or when X11 forwarding is off.
    pub fn take_x11_rx(&self) -> Option<mpsc::UnboundedReceiver<X11Incoming>> {
        self.x11_rx.lock().take()
    }

    // ---- bookkeeping -------------------------------------------------

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn acquire(&self) -> usize {
        self.touch();
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn release_ref(&self) -> usize {
        self.touch();
        let mut current = self.ref_count.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                warn!(key = %self.key, "release without matching acquire");
                return 0;
            }
            match self.ref_count.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Used when a replacement transport inherits the references of the one
    /// it replaces.
    pub(crate) fn inherit_refs_from(&self, old: &Transport) {
        self.ref_count.store(old.ref_count(), Ordering::SeqCst);
        let mut tabs = self.tab_refs.lock();
        for tab in old.tabs() {
            tabs.insert(tab);
        }
    }

    pub fn add_tab(&self, tab: &str) {
        self.tab_refs.lock().insert(tab.to_string());
    }

    pub fn remove_tab(&self, tab: &str) {
        self.tab_refs.lock().remove(tab);
    }

    pub fn has_tabs(&self) -> bool {
        !self.tab_refs.lock().is_empty()
    }

    pub fn tabs(&self) -> Vec<TabId> {
        self.tab_refs.lock().iter().cloned().collect()
    }

    pub fn referenced(&self) -> bool {
        self.ref_count() > 0 || self.has_tabs()
    }

    pub fn mark_intentional_close(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);
    }

    pub fn intentional_close(&self) -> bool {
        self.intentional_close.load(Ordering::SeqCst)
    }

    // ---- state -------------------------------------------------------

    pub fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
        let is_ready = state == TransportState::Ready;
        let _ = self.ready.send_replace(is_ready);
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    /// State with `InUse`/`Idle` derived from the reference count.
    pub fn effective_state(&self) -> TransportState {
        match self.state() {
            TransportState::Ready => {
                if self.referenced() {
                    TransportState::InUse
                } else {
                    TransportState::Idle
                }
            }
            other => other,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the transport reports ready, bounded by `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        if self.is_ready() && self.is_healthy() {
            return Ok(());
        }
        let mut rx = self.ready.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| Error::TransportNotReady(format!("{} not ready", self.key)))?;
        if self.is_ready() && self.is_healthy() {
            Ok(())
        } else {
            Err(Error::TransportNotReady(format!("{} not ready", self.key)))
        }
    }

    // ---- health ------------------------------------------------------

    pub fn is_healthy(&self) -> bool {
        match &self.link {
            Link::Ssh(handle) => !handle.is_closed(),
            Link::Telnet(link) => link.is_connected(),
        }
    }

    /// Eviction requires: unreferenced, no tabs, idle past the threshold.
    pub fn is_evictable(&self, now: Instant, idle_timeout: Duration) -> bool {
        !self.referenced() && now.duration_since(self.last_used()) > idle_timeout
    }

    // ---- link access -------------------------------------------------

    pub fn ssh_handle(&self) -> Option<Arc<russh::client::Handle<ClientHandler>>> {
        match &self.link {
            Link::Ssh(handle) => Some(Arc::clone(handle)),
            Link::Telnet(_) => None,
        }
    }

    pub fn telnet_link(&self) -> Option<Arc<TelnetLink>> {
        match &self.link {
            Link::Telnet(link) => Some(Arc::clone(link)),
            Link::Ssh(_) => None,
        }
    }

    /// Close the underlying connection. `intentional` excludes the transport
    /// from automatic reconnection.
    pub async fn close(&self, intentional: bool) {
        if intentional {
            self.mark_intentional_close();
        }
        self.set_state(TransportState::Closing);
        match &self.link {
            Link::Ssh(handle) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "closing", "en")
                    .await;
            }
            Link::Telnet(link) => link.close().await,
        }
        self.set_state(TransportState::Closed);
        debug!(key = %self.key, intentional, "transport closed");
    }
}

// ---- SSH connection path --------------------------------------------

/// Connect and authenticate an SSH transport, optionally through a proxy
/// tunnel. The handshake is bounded by `opts.connect_timeout`; on timeout
/// the half-open socket is dropped before the error returns.
pub(crate) async fn connect_ssh(
    cfg: &ConnectConfig,
    proxy: Option<&ProxyConfig>,
    opts: &PoolOptions,
    x11_tx: Option<mpsc::UnboundedSender<X11Incoming>>,
) -> Result<russh::client::Handle<ClientHandler>> {
    let config = Arc::new(russh::client::Config {
        keepalive_interval: Some(opts.keepalive_interval),
        keepalive_max: opts.keepalive_max,
        ..Default::default()
    });
    let handler = ClientHandler::new(cfg.host_key.clone(), x11_tx);

    debug!(host = %cfg.host, port = cfg.port, user = %cfg.username, proxied = proxy.is_some(), "ssh connecting");
    let connected = if let Some(proxy) = proxy {
        let stream = crate::proxy::dial_through(proxy, &cfg.host, cfg.port).await?;
        tokio::time::timeout(
            opts.connect_timeout,
            russh::client::connect_stream(config, stream, handler),
        )
        .await
    } else {
        tokio::time::timeout(
            opts.connect_timeout,
            russh::client::connect(config, (cfg.host.as_str(), cfg.port), handler),
        )
        .await
    };

    let mut handle = connected
        .map_err(|_| Error::Timeout(TimeoutKind::Connect))?
        .map_err(|err| classify_connect_error(err, &cfg.host, cfg.port))?;

    authenticate(&mut handle, cfg).await?;
    debug!(host = %cfg.host, port = cfg.port, user = %cfg.username, "ssh authenticated");
    Ok(handle)
}

fn classify_connect_error(err: russh::Error, host: &str, port: u16) -> Error {
    match err {
        russh::Error::IO(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            Error::HostUnreachable(format!("connection refused to {host}:{port}"))
        }
        other => Error::from(other),
    }
}

async fn authenticate(
    handle: &mut russh::client::Handle<ClientHandler>,
    cfg: &ConnectConfig,
) -> Result<()> {
    let target = format!("{}@{}:{}", cfg.username, cfg.host, cfg.port);
    let accepted = match &cfg.auth {
        AuthMethod::Password(password) => handle
            .authenticate_password(&cfg.username, password.expose_secret())
            .await
            .map_err(Error::from)?
            .success(),
        AuthMethod::Key {
            material,
            passphrase,
        } => {
            let key = auth::resolve_key(material, passphrase.as_ref()).await?;
            handle
                .authenticate_publickey(
                    &cfg.username,
                    russh::keys::PrivateKeyWithHashAlg::new(key, None),
                )
                .await
                .map_err(Error::from)?
                .success()
        }
        AuthMethod::None => handle
            .authenticate_none(&cfg.username)
            .await
            .map_err(Error::from)?
            .success(),
    };
    if accepted {
        Ok(())
    } else {
        Err(Error::AuthFailed(format!(
            "authentication rejected for {target}"
        )))
    }
}

/// Open an exec channel running `command` on the transport, respecting the
/// per-transport channel cap.
pub(crate) async fn open_exec(
    transport: &Transport,
    command: &str,
) -> Result<(Channel<Msg>, tokio::sync::OwnedSemaphorePermit)> {
    let handle = transport
        .ssh_handle()
        .ok_or_else(|| Error::TransportNotReady("exec requires an ssh transport".into()))?;
    let permit = Arc::clone(&transport.channel_permits)
        .acquire_owned()
        .await
        .map_err(|_| Error::Shutdown)?;
    let channel = handle.channel_open_session().await.map_err(Error::from)?;
    channel.exec(true, command).await.map_err(Error::from)?;
    Ok((channel, permit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectConfig;

    fn telnet_transport(refcount: usize) -> Transport {
        let cfg = ConnectConfig::telnet("h1", 23);
        let link = Link::Telnet(Arc::new(dead_link()));
        let t = Transport::new("telnet:h1:23".into(), cfg, link, &PoolOptions::default());
        for _ in 0..refcount {
            t.acquire();
        }
        t
    }

    fn dead_link() -> TelnetLink {
        // A link that was never connected; good enough for bookkeeping tests.
        TelnetLink::closed_for_tests()
    }

    #[test]
    fn refcount_pairs_acquire_and_release() {
        let t = telnet_transport(0);
        assert_eq!(t.acquire(), 1);
        assert_eq!(t.acquire(), 2);
        assert_eq!(t.release_ref(), 1);
        assert_eq!(t.release_ref(), 0);
        // Extra release is refused, not wrapped around.
        assert_eq!(t.release_ref(), 0);
        assert_eq!(t.ref_count(), 0);
    }

    #[test]
    fn eviction_requires_unreferenced_and_idle() {
        let t = telnet_transport(1);
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(!t.is_evictable(later, Duration::from_secs(60)), "referenced");

        let t = telnet_transport(0);
        t.add_tab("tab-1");
        assert!(!t.is_evictable(later, Duration::from_secs(60)), "tab ref");

        let t = telnet_transport(0);
        assert!(!t.is_evictable(Instant::now(), Duration::from_secs(60)), "not idle yet");
        assert!(t.is_evictable(later, Duration::from_secs(60)));
    }

    #[test]
    fn effective_state_tracks_references() {
        let t = telnet_transport(0);
        assert_eq!(t.effective_state(), TransportState::Idle);
        t.acquire();
        assert_eq!(t.effective_state(), TransportState::InUse);
        t.set_state(TransportState::Lost);
        assert_eq!(t.effective_state(), TransportState::Lost);
    }

    #[test]
    fn intentional_close_is_sticky() {
        let t = telnet_transport(0);
        assert!(!t.intentional_close());
        t.mark_intentional_close();
        assert!(t.intentional_close());
    }
}
