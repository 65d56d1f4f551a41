//! Option structs for every tunable in the substrate.
//!
//! Free-form option bags from the surface are replaced by small enumerated
//! structs with `Default` impls carrying the documented defaults. Components
//! take these by value at construction time.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::proxy::ProxyConfig;

pub type TabId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Telnet,
}

/// Scheduling priority for SFTP operations and transfer streams.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn value(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Authentication material for an SSH connection. Secrets are held in
/// zero-on-drop buffers and redacted from `Debug` output.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    Password(SecretString),
    Key {
        material: KeyMaterial,
        passphrase: Option<SecretString>,
    },
    None,
}

/// Private-key material: a path to read, inline text to decode, or a key
/// that has already been resolved by a previous call.
#[derive(Clone)]
pub enum KeyMaterial {
    Path(PathBuf),
    Inline(SecretString),
    Resolved(std::sync::Arc<russh::keys::PrivateKey>),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Path(path) => f.debug_tuple("Path").field(path).finish(),
            KeyMaterial::Inline(_) => f.write_str("Inline([REDACTED])"),
            KeyMaterial::Resolved(_) => f.write_str("Resolved([REDACTED])"),
        }
    }
}

/// How to verify the server host key.
#[derive(Debug, Clone, Default)]
pub enum HostKeyPolicy {
    /// Accept any host key (trust-on-first-use is the surface's concern).
    #[default]
    AcceptAny,
    /// Require a specific SHA-256 fingerprint (hex, colons/spaces tolerated).
    Fingerprint(String),
}

/// Reference to proxy parameters: inline, or a named record resolved
/// through the config store.
#[derive(Debug, Clone)]
pub enum ProxyRef {
    Named(String),
    Inline(ProxyConfig),
}

/// Initial terminal geometry and type for the pty request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TermOptions {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for TermOptions {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Everything needed to establish one connection.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub host_key: HostKeyPolicy,
    /// When set, the derived pool key is tab-scoped so this tab gets an
    /// isolated transport.
    pub tab_id: Option<TabId>,
    pub proxy: Option<ProxyRef>,
    pub enable_x11: bool,
    /// Local X display number for the bridge (TCP port 6000 + display).
    pub x11_display: u16,
    pub term: TermOptions,
}

impl ConnectConfig {
    pub fn password(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            protocol: Protocol::Ssh,
            host: host.to_string(),
            port,
            username: username.to_string(),
            auth: AuthMethod::Password(SecretString::from(password.to_string())),
            host_key: HostKeyPolicy::default(),
            tab_id: None,
            proxy: None,
            enable_x11: false,
            x11_display: 0,
            term: TermOptions::default(),
        }
    }

    pub fn telnet(host: &str, port: u16) -> Self {
        Self {
            protocol: Protocol::Telnet,
            host: host.to_string(),
            port,
            username: String::new(),
            auth: AuthMethod::None,
            host_key: HostKeyPolicy::default(),
            tab_id: None,
            proxy: None,
            enable_x11: false,
            x11_display: 0,
            term: TermOptions::default(),
        }
    }

    pub fn with_tab(mut self, tab_id: &str) -> Self {
        self.tab_id = Some(tab_id.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long a `get_connection` call waits in the FIFO queue when the
    /// pool is full before failing with `PoolExhausted`.
    pub waiter_timeout: Duration,
    pub waiter_capacity: usize,
    /// Pool-grade sweep: idle eviction and health-based teardown.
    pub sweep_interval: Duration,
    /// Monitor-grade sweep: cheap liveness/status refresh.
    pub monitor_interval: Duration,
    pub max_channels_per_transport: usize,
    /// SSH keepalive cadence and tolerated unanswered count.
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
}

impl PoolOptions {
    /// Per-`(host, port, user)` bound: ceil(max_connections / 2).
    pub fn max_per_server(&self) -> usize {
        self.max_connections.div_ceil(2)
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(15),
            waiter_timeout: Duration::from_secs(30),
            waiter_capacity: 32,
            sweep_interval: Duration::from_secs(5 * 60),
            monitor_interval: Duration::from_secs(15),
            max_channels_per_transport: 30,
            keepalive_interval: Duration::from_secs(15),
            keepalive_max: 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SftpOptions {
    pub max_sessions_per_tab: usize,
    pub max_total_sessions: usize,
    pub session_idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub ssh_ready_timeout: Duration,
    /// Deadline for the `stat(".")` / `readdir("/")` health probes.
    pub probe_timeout: Duration,
    /// russh-sftp per-request timeout (its 10 s default is too short for
    /// slow links).
    pub request_timeout: Duration,
}

impl Default for SftpOptions {
    fn default() -> Self {
        Self {
            max_sessions_per_tab: 1,
            max_total_sessions: 50,
            session_idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(90),
            ssh_ready_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub base_timeout: Duration,
    pub max_op_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay_unit: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(20),
            max_op_timeout: Duration::from_secs(10 * 60),
            max_retries: 2,
            retry_delay_unit: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub chunk_retries: u32,
    /// Progress is coalesced: emit after this many recorded chunks…
    pub progress_batch: u32,
    /// …or after this much time, whichever comes first.
    pub progress_interval: Duration,
    /// How long a paused transfer waits for a replacement transport.
    pub resume_window: Duration,
    /// Cap for bounded in-memory reads (`read` op / edit staging).
    pub max_inline_read: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            min_chunk_size: 16 * 1024,
            max_chunk_size: 512 * 1024,
            chunk_retries: 3,
            progress_batch: 20,
            progress_interval: Duration::from_millis(100),
            resume_window: Duration::from_secs(120),
            max_inline_read: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PressureOptions {
    /// Bound on bytes held in transfer chunk buffers at once.
    pub memory_cap: u64,
    /// Fraction of `memory_cap` at which pressure turns high.
    pub memory_cutoff: f64,
    /// Scheduler-load fraction at which pressure turns high.
    pub cpu_cutoff: f64,
    pub sample_interval: Duration,
    pub max_concurrent_streams: usize,
    pub max_queue_size: usize,
    /// How long a low-priority stream may be paused under high pressure
    /// before being admitted anyway.
    pub pause_cap: Duration,
}

impl Default for PressureOptions {
    fn default() -> Self {
        Self {
            memory_cap: 256 * 1024 * 1024,
            memory_cutoff: 0.8,
            cpu_cutoff: 0.9,
            sample_interval: Duration::from_secs(1),
            max_concurrent_streams: 10,
            max_queue_size: 100,
            pause_cap: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatencyOptions {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub window: usize,
}

impl Default for LatencyOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            window: 10,
        }
    }
}

/// Aggregate options for [`crate::context::AppContext`].
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub pool: PoolOptions,
    pub reconnect: ReconnectOptions,
    pub sftp: SftpOptions,
    pub queue: QueueOptions,
    pub transfer: TransferOptions,
    pub pressure: PressureOptions,
    pub latency: LatencyOptions,
    pub shutdown_grace: ShutdownGrace,
}

#[derive(Debug, Clone)]
pub struct ShutdownGrace(pub Duration);

impl Default for ShutdownGrace {
    fn default() -> Self {
        ShutdownGrace(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn per_server_bound_is_half_rounded_up() {
        let mut opts = PoolOptions::default();
        assert_eq!(opts.max_per_server(), 5);
        opts.max_connections = 7;
        assert_eq!(opts.max_per_server(), 4);
        opts.max_connections = 1;
        assert_eq!(opts.max_per_server(), 1);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let cfg = ConnectConfig::password("h", 22, "u", "hunter2");
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("hunter2"));
    }
}
