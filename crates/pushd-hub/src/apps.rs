//! App key -> hub instance registry.

use crate::hub::AppHub;
use crate::runtime::SocketRuntime;
use pushd_core::ledger::{AttachmentStore, MemoryAttachments};
use pushd_storage::LedgerStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Clone)]
pub enum LedgerBackend {
    Memory,
    Sqlite(Arc<LedgerStore>),
}

impl LedgerBackend {
    fn attachments_for(&self, app_key: &str) -> Arc<dyn AttachmentStore> {
        match self {
            LedgerBackend::Memory => Arc::new(MemoryAttachments::new()),
            LedgerBackend::Sqlite(store) => {
                let scoped = store.scoped(app_key);
                // Rows left by a previous process belong to transports that are gone.
                if let Err(err) = scoped.clear() {
                    warn!(event = "ledger_clear_failed", app = app_key, error = %err);
                }
                Arc::new(scoped)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerBackend::Memory => "memory",
            LedgerBackend::Sqlite(_) => "sqlite",
        }
    }
}

pub struct AppRegistry {
    allowed: BTreeSet<String>,
    backend: LedgerBackend,
    activity_timeout_secs: u64,
    apps: RwLock<HashMap<String, Arc<AppHub>>>,
}

impl AppRegistry {
    /// An empty allow-list accepts any app key.
    pub fn new(
        allowed: impl IntoIterator<Item = String>,
        backend: LedgerBackend,
        activity_timeout_secs: u64,
    ) -> Self {
        Self {
            allowed: allowed
                .into_iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
            backend,
            activity_timeout_secs,
            apps: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_allowed(&self, app_key: &str) -> bool {
        !app_key.is_empty() && (self.allowed.is_empty() || self.allowed.contains(app_key))
    }

    /// Returns `None` for keys outside the allow-list.
    pub async fn get_or_create(&self, app_key: &str) -> Option<Arc<AppHub>> {
        if !self.is_allowed(app_key) {
            return None;
        }
        if let Some(app) = self.apps.read().await.get(app_key) {
            return Some(app.clone());
        }

        let mut apps = self.apps.write().await;
        let app = apps
            .entry(app_key.to_string())
            .or_insert_with(|| {
                let runtime = SocketRuntime::new(self.backend.attachments_for(app_key));
                info!(event = "app_created", app = app_key, ledger = self.backend.as_str());
                Arc::new(AppHub::new(app_key, self.activity_timeout_secs, runtime))
            })
            .clone();
        Some(app)
    }

    pub async fn apps(&self) -> Vec<Arc<AppHub>> {
        self.apps.read().await.values().cloned().collect()
    }

    /// Periodically hibernates apps that saw no traffic for `idle_after`.
    pub fn start_idle_reaper(self: Arc<Self>, idle_after: Duration) {
        if idle_after.is_zero() {
            return;
        }
        let interval = (idle_after / 2).max(Duration::from_millis(100));
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for app in registry.apps().await {
                    if app.evict_if_idle(idle_after).await {
                        info!(event = "idle_evict", app = %app.app_key());
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushd_core::ConnectionId;
    use tokio::sync::mpsc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_key_shares_one_hub() {
        let registry = AppRegistry::new(Vec::new(), LedgerBackend::Memory, 120);
        let first = registry.get_or_create("app-1").await.expect("app");
        let second = registry.get_or_create("app-1").await.expect("app");
        let other = registry.get_or_create("app-2").await.expect("app");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.apps().await.len(), 2);
        assert!(registry.get_or_create("").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn allow_list_rejects_unknown_keys() {
        let registry = AppRegistry::new(
            vec!["app-1".to_string(), " ".to_string()],
            LedgerBackend::Memory,
            120,
        );
        assert!(registry.get_or_create("app-1").await.is_some());
        assert!(registry.get_or_create("intruder").await.is_none());
        assert!(!registry.is_allowed(" "));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqlite_backend_starts_from_a_clean_ledger() {
        let store = Arc::new(LedgerStore::open_in_memory().expect("open db"));
        let stale = ConnectionId::from("old--1.1");
        store
            .save("app-1", &stale, br#"{"subscriptions":["room1"]}"#)
            .expect("seed stale row");
        store
            .save("app-2", &stale, br#"{"subscriptions":["room1"]}"#)
            .expect("seed other app");

        let registry = AppRegistry::new(Vec::new(), LedgerBackend::Sqlite(store.clone()), 120);
        let app = registry.get_or_create("app-1").await.expect("app");
        assert!(store.connection_ids("app-1").expect("ids").is_empty());
        assert_eq!(store.connection_ids("app-2").expect("ids"), vec![stale]);

        let (tx, _rx) = mpsc::channel(8);
        let accepted = app.accept(tx).await.expect("accept");
        app.subscribe(&accepted.conn_id, "room1", None)
            .await
            .expect("subscribe");
        assert_eq!(
            store.connection_ids("app-1").expect("ids"),
            vec![accepted.conn_id.clone()]
        );

        app.hibernate().await;
        assert_eq!(
            app.channel_snapshot().await.get("room1"),
            Some(&BTreeSet::from([accepted.conn_id]))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_reaper_hibernates_quiet_apps() {
        let registry = Arc::new(AppRegistry::new(Vec::new(), LedgerBackend::Memory, 120));
        let app = registry.get_or_create("app-1").await.expect("app");
        let (tx, _rx) = mpsc::channel(8);
        app.accept(tx).await.expect("accept");
        assert!(!app.is_hibernating().await);

        registry.clone().start_idle_reaper(Duration::from_millis(200));
        let mut hibernated = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if app.is_hibernating().await {
                hibernated = true;
                break;
            }
        }
        assert!(hibernated);
    }
}
