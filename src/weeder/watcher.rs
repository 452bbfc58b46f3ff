use crate::util::metrics::Metrics;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams},
    core::Selector,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use std::pin::pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// A pod is weeded iff at least one of its containers (init containers
/// included) sits in crash-loop back-off. Anything else recovers on its own
/// once the endpoint is back.
pub fn is_deletion_candidate(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .any(|container| {
            container
                .state
                .as_ref()
                .and_then(|state| state.waiting.as_ref())
                .and_then(|waiting| waiting.reason.as_deref())
                == Some(CRASH_LOOP_BACK_OFF)
        })
}

/// Watches the pods matching one configured selector and deletes the
/// crash-loopers so their controller recreates them promptly.
///
/// Lives exactly as long as its token: the parent weeder cancels it when the
/// watch duration expires.
pub struct PodWatcher {
    client: Client,
    namespace: String,
    service: String,
    selector: Selector,
    metrics: Arc<Metrics>,
}

impl PodWatcher {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        service: impl Into<String>,
        selector: Selector,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service: service.into(),
            selector,
            metrics,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let stream = watcher(
            api.clone(),
            watcher::Config::default().labels_from(&self.selector),
        )
        .default_backoff()
        .applied_objects();
        let mut stream = pin!(stream);
        debug!(
            namespace = %self.namespace,
            service = %self.service,
            selector = %self.selector,
            "pod watch started"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(namespace = %self.namespace, service = %self.service, "pod watch finished");
                    return;
                }
                item = stream.try_next() => match item {
                    Ok(Some(pod)) => self.weed(&api, &pod).await,
                    Ok(None) => return,
                    Err(err) => {
                        warn!(
                            namespace = %self.namespace,
                            service = %self.service,
                            error = %err,
                            "pod watch error"
                        );
                    }
                }
            }
        }
    }

    async fn weed(&self, api: &Api<Pod>, pod: &Pod) {
        let name = pod.name_any();
        // the event payload may be stale, judge the freshest status
        let latest = match api.get(&name).await {
            Ok(latest) => latest,
            Err(kube::Error::Api(response)) if response.code == 404 => return,
            Err(err) => {
                warn!(namespace = %self.namespace, pod = %name, error = %err, "failed to refresh pod");
                return;
            }
        };
        if !is_deletion_candidate(&latest) {
            return;
        }
        info!(namespace = %self.namespace, pod = %name, "deleting crash-looping pod");
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => self.metrics.observe_weeded_pod(&self.namespace, &self.service),
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(err) => {
                warn!(namespace = %self.namespace, pod = %name, error = %err, "failed to delete crash-looping pod");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus};

    fn status_with_waiting_reason(reason: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: "main".into(),
            state: Some(ContainerState {
                waiting: reason.map(|reason| ContainerStateWaiting {
                    reason: Some(reason.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(containers: Vec<ContainerStatus>, init_containers: Vec<ContainerStatus>) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(containers),
                init_container_statuses: Some(init_containers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn crash_looping_container_is_a_candidate() {
        let pod = pod(vec![status_with_waiting_reason(Some("CrashLoopBackOff"))], vec![]);
        assert!(is_deletion_candidate(&pod));
    }

    #[test]
    fn crash_looping_init_container_is_a_candidate() {
        let pod = pod(
            vec![status_with_waiting_reason(None)],
            vec![status_with_waiting_reason(Some("CrashLoopBackOff"))],
        );
        assert!(is_deletion_candidate(&pod));
    }

    #[test]
    fn running_and_differently_waiting_pods_are_left_alone() {
        assert!(!is_deletion_candidate(&pod(vec![status_with_waiting_reason(None)], vec![])));
        assert!(!is_deletion_candidate(&pod(
            vec![status_with_waiting_reason(Some("ImagePullBackOff"))],
            vec![]
        )));
        assert!(!is_deletion_candidate(&Pod::default()));
    }
}
