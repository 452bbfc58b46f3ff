use crate::weeder::weeder::Weeder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct WeederHandle {
    token: CancellationToken,
    registered_at: DateTime<Utc>,
}

/// Diagnostic view of one registered weeder.
#[derive(Clone, Serialize)]
pub struct WeederInfo {
    pub key: String,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    token: CancellationToken,
}

impl WeederInfo {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Keyed registry of live weeders, one per `namespace/service`.
///
/// A fresh endpoint-ready event replaces an in-flight weeder outright; the
/// displaced entry is cancelled after the swap, before the new task starts.
pub struct WeederManager {
    root: CancellationToken,
    weeders: Mutex<HashMap<String, WeederHandle>>,
}

impl WeederManager {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            weeders: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, weeder: Weeder) -> bool {
        let key = weeder.key();
        let token = self.root.child_token();
        let handle = WeederHandle {
            token: token.clone(),
            registered_at: Utc::now(),
        };
        let displaced = {
            let mut weeders = self.weeders.lock().await;
            weeders.insert(key.clone(), handle)
        };
        if let Some(previous) = displaced {
            info!(key = %key, "cancelling displaced weeder");
            previous.token.cancel();
        }
        tokio::spawn(weeder.run(token));
        true
    }

    pub async fn unregister(&self, key: &str) -> bool {
        let removed = { self.weeders.lock().await.remove(key) };
        match removed {
            Some(handle) => {
                handle.token.cancel();
                info!(key = %key, "weeder unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn get_weeder(&self, key: &str) -> Option<WeederInfo> {
        self.weeders.lock().await.get(key).map(|handle| WeederInfo {
            key: key.to_string(),
            registered_at: handle.registered_at,
            token: handle.token.clone(),
        })
    }

    pub async fn get_all_weeders(&self) -> Vec<WeederInfo> {
        self.weeders
            .lock()
            .await
            .iter()
            .map(|(key, handle)| WeederInfo {
                key: key.clone(),
                registered_at: handle.registered_at,
                token: handle.token.clone(),
            })
            .collect()
    }

    /// Cancel every live weeder; used on shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = { self.weeders.lock().await.drain().collect() };
        for (key, handle) in drained {
            debug!(key = %key, "cancelling weeder");
            handle.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_weeder_config;
    use crate::util::metrics::Metrics;
    use http::{Request, Response};
    use kube::client::Body;
    use kube::Client;
    use std::sync::Arc;

    const TEST_CONFIG: &str = r#"
watchDuration: 1h
servicesAndDependantSelectors:
  kube-apiserver:
    podSelectors:
      - matchExpressions:
          - key: role
            operator: In
            values: [controlplane]
"#;

    // The registry tests never serve a request; a disconnected mock service
    // is enough for the spawned weeders to spin in watch backoff until
    // cancelled.
    fn mock_client() -> Client {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        drop(handle);
        Client::new(mock_service, "default")
    }

    fn test_weeder(namespace: &str) -> Weeder {
        Weeder::new(
            mock_client(),
            namespace,
            "kube-apiserver",
            Arc::new(parse_weeder_config(TEST_CONFIG).unwrap()),
            Arc::new(Metrics::default()),
        )
    }

    #[tokio::test]
    async fn register_replaces_and_cancels_the_previous_weeder() {
        let manager = WeederManager::new(CancellationToken::new());
        assert!(manager.register(test_weeder("shoot--a")).await);
        let first = manager.get_weeder("shoot--a/kube-apiserver").await.unwrap();
        assert!(!first.is_cancelled());

        assert!(manager.register(test_weeder("shoot--a")).await);
        assert!(first.is_cancelled());
        assert_eq!(manager.get_all_weeders().await.len(), 1);
    }

    #[tokio::test]
    async fn keys_are_scoped_by_namespace_and_service() {
        let manager = WeederManager::new(CancellationToken::new());
        manager.register(test_weeder("shoot--a")).await;
        manager.register(test_weeder("shoot--b")).await;
        assert_eq!(manager.get_all_weeders().await.len(), 2);
        assert!(manager.get_weeder("shoot--a/kube-apiserver").await.is_some());
        assert!(manager.get_weeder("shoot--b/kube-apiserver").await.is_some());
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let manager = WeederManager::new(CancellationToken::new());
        manager.register(test_weeder("shoot--a")).await;
        manager.register(test_weeder("shoot--b")).await;
        let infos = manager.get_all_weeders().await;

        manager.shutdown().await;
        assert!(manager.get_all_weeders().await.is_empty());
        for info in infos {
            assert!(info.is_cancelled());
        }
    }
}
