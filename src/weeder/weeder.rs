use crate::config::WeederConfig;
use crate::util::metrics::Metrics;
use crate::weeder::watcher::PodWatcher;
use kube::{core::Selector, Client};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reaction to one endpoint-ready event: one pod watch per configured
/// selector, all sharing a single watch-duration deadline.
pub struct Weeder {
    client: Client,
    namespace: String,
    endpoint_name: String,
    config: Arc<WeederConfig>,
    metrics: Arc<Metrics>,
}

impl Weeder {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        endpoint_name: impl Into<String>,
        config: Arc<WeederConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            endpoint_name: endpoint_name.into(),
            config,
            metrics,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Registry key: one live weeder per service per namespace.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.endpoint_name)
    }

    pub async fn run(self, token: CancellationToken) {
        let Some(selectors) = self.config.services_and_dependant_selectors.get(&self.endpoint_name)
        else {
            warn!(
                namespace = %self.namespace,
                service = %self.endpoint_name,
                "no selectors configured for service, nothing to weed"
            );
            return;
        };
        let watch_token = token.child_token();
        let mut watchers = Vec::new();
        for pod_selector in &selectors.pod_selectors {
            let selector = match Selector::try_from(pod_selector.clone()) {
                Ok(selector) => selector,
                Err(err) => {
                    warn!(
                        namespace = %self.namespace,
                        service = %self.endpoint_name,
                        error = %err,
                        "unusable pod selector, skipping"
                    );
                    continue;
                }
            };
            let watcher = PodWatcher::new(
                self.client.clone(),
                self.namespace.clone(),
                self.endpoint_name.clone(),
                selector,
                self.metrics.clone(),
            );
            watchers.push(tokio::spawn(watcher.run(watch_token.child_token())));
        }
        if watchers.is_empty() {
            return;
        }
        tokio::select! {
            _ = token.cancelled() => {
                debug!(namespace = %self.namespace, service = %self.endpoint_name, "weeder cancelled");
            }
            _ = tokio::time::sleep(self.config.watch_duration()) => {
                debug!(namespace = %self.namespace, service = %self.endpoint_name, "watch duration expired");
            }
        }
        watch_token.cancel();
        for watcher in watchers {
            let _ = watcher.await;
        }
    }
}
