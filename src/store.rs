//! Interface to the external configuration store.
//!
//! The store owns persistence and at-rest encryption of credential and proxy
//! records; the substrate only ever sees decrypted values, treats secret
//! fields as opaque and never writes them back. An in-memory implementation
//! backs tests and embedders that manage their own persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::Result;
use crate::proxy::ProxyConfig;

/// How many identifiers the recent-connections ring keeps.
pub const MAX_RECENT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Password,
    KeyPath,
}

/// A decrypted credential record. The secret arrives already decrypted by
/// the store and is zeroed when the record drops.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: String,
    pub username: String,
    pub kind: CredentialKind,
    pub secret: SecretString,
}

/// Per-host overrides applied on top of the option-struct defaults when a
/// transport to that host is dialed.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HostTuning {
    pub connect_timeout_secs: Option<u64>,
    pub keepalive_secs: Option<u64>,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Translate a named proxy record into full proxy parameters.
    async fn proxy_record(&self, name: &str) -> Result<Option<ProxyConfig>>;

    async fn credential(&self, id: &str) -> Result<Option<CredentialRecord>>;

    async fn host_tuning(&self, host: &str) -> Result<Option<HostTuning>>;

    /// Most recent connection identifiers, newest first, at most
    /// [`MAX_RECENT`].
    async fn recent_connections(&self) -> Result<Vec<String>>;

    /// Record a successful connection; duplicates move to the front.
    async fn push_recent(&self, ident: &str) -> Result<()>;
}

/// In-memory store used by tests and self-managed embedders.
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    proxies: HashMap<String, ProxyConfig>,
    credentials: HashMap<String, CredentialRecord>,
    tuning: HashMap<String, HostTuning>,
    recents: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_proxy(&self, name: &str, proxy: ProxyConfig) {
        self.inner
            .write()
            .await
            .proxies
            .insert(name.to_string(), proxy);
    }

    pub async fn put_credential(&self, record: CredentialRecord) {
        self.inner
            .write()
            .await
            .credentials
            .insert(record.id.clone(), record);
    }

    pub async fn put_tuning(&self, host: &str, tuning: HostTuning) {
        self.inner
            .write()
            .await
            .tuning
            .insert(host.to_string(), tuning);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn proxy_record(&self, name: &str) -> Result<Option<ProxyConfig>> {
        Ok(self.inner.read().await.proxies.get(name).cloned())
    }

    async fn credential(&self, id: &str) -> Result<Option<CredentialRecord>> {
        Ok(self.inner.read().await.credentials.get(id).cloned())
    }

    async fn host_tuning(&self, host: &str) -> Result<Option<HostTuning>> {
        Ok(self.inner.read().await.tuning.get(host).cloned())
    }

    async fn recent_connections(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().await.recents.clone())
    }

    async fn push_recent(&self, ident: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.recents.retain(|r| r != ident);
        inner.recents.insert(0, ident.to_string());
        inner.recents.truncate(MAX_RECENT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyKind;

    #[tokio::test]
    async fn recents_dedupe_and_cap_at_ten() {
        let store = MemoryStore::new();
        for i in 0..12 {
            store.push_recent(&format!("host-{i}")).await.unwrap();
        }
        store.push_recent("host-5").await.unwrap();

        let recents = store.recent_connections().await.unwrap();
        assert_eq!(recents.len(), MAX_RECENT);
        assert_eq!(recents[0], "host-5");
        assert_eq!(recents.iter().filter(|r| *r == "host-5").count(), 1);
        assert!(!recents.contains(&"host-0".to_string()));
    }

    #[tokio::test]
    async fn proxy_records_resolve_by_name() {
        let store = MemoryStore::new();
        store
            .put_proxy(
                "corp",
                ProxyConfig {
                    kind: ProxyKind::Socks5,
                    host: "p1".into(),
                    port: 1080,
                    username: None,
                    password: None,
                },
            )
            .await;
        let found = store.proxy_record("corp").await.unwrap().unwrap();
        assert_eq!(found.host, "p1");
        assert!(store.proxy_record("other").await.unwrap().is_none());
    }
}
