use crate::prober::probe::Prober;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ProberHandle {
    token: CancellationToken,
    registered_at: DateTime<Utc>,
}

/// Diagnostic view of one registered prober.
#[derive(Clone, Serialize)]
pub struct ProberInfo {
    pub namespace: String,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    token: CancellationToken,
}

impl ProberInfo {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Keyed registry of the probe loops, one per tenant namespace.
///
/// The last registration wins: the displaced entry is swapped out under the
/// lock and cancelled after the lock is released, before the replacement's
/// task is spawned.
pub struct ProberManager {
    root: CancellationToken,
    probers: Mutex<HashMap<String, ProberHandle>>,
}

impl ProberManager {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            probers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, prober: Prober) -> bool {
        let namespace = prober.namespace().to_string();
        let token = self.root.child_token();
        let handle = ProberHandle {
            token: token.clone(),
            registered_at: Utc::now(),
        };
        let displaced = {
            let mut probers = self.probers.lock().await;
            probers.insert(namespace.clone(), handle)
        };
        if let Some(previous) = displaced {
            info!(namespace = %namespace, "cancelling displaced prober");
            previous.token.cancel();
        }
        tokio::spawn(prober.run(token));
        true
    }

    pub async fn unregister(&self, namespace: &str) -> bool {
        let removed = { self.probers.lock().await.remove(namespace) };
        match removed {
            Some(handle) => {
                handle.token.cancel();
                info!(namespace = %namespace, "prober unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn get_prober(&self, namespace: &str) -> Option<ProberInfo> {
        self.probers.lock().await.get(namespace).map(|handle| ProberInfo {
            namespace: namespace.to_string(),
            registered_at: handle.registered_at,
            token: handle.token.clone(),
        })
    }

    pub async fn get_all_probers(&self) -> Vec<ProberInfo> {
        self.probers
            .lock()
            .await
            .iter()
            .map(|(namespace, handle)| ProberInfo {
                namespace: namespace.clone(),
                registered_at: handle.registered_at,
                token: handle.token.clone(),
            })
            .collect()
    }

    /// Cancel every registered prober; used on shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = { self.probers.lock().await.drain().collect() };
        for (namespace, handle) in drained {
            debug!(namespace = %namespace, "cancelling prober");
            handle.token.cancel();
        }
    }
}
