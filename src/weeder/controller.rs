use crate::config::WeederConfig;
use crate::util::errors::Result;
use crate::util::metrics::Metrics;
use crate::weeder::manager::WeederManager;
use crate::weeder::weeder::Weeder;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().map_or(false, |addresses| !addresses.is_empty()))
}

/// Watch the endpoints of the configured services and start a weeder
/// whenever one transitions from no ready addresses to at least one.
///
/// Readiness is tracked per `namespace/service`; the first observation of an
/// endpoint only records its state, so a watchdog restart does not weed
/// namespaces that were already healthy.
pub async fn run(
    client: Client,
    config: Arc<WeederConfig>,
    manager: Arc<WeederManager>,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) -> Result<()> {
    let endpoints: Api<Endpoints> = Api::all(client.clone());
    let mut ready: HashMap<String, bool> = HashMap::new();
    let mut events = pin!(watcher(endpoints, watcher::Config::default()).default_backoff());
    info!(
        services = ?config.services_and_dependant_selectors.keys().collect::<Vec<_>>(),
        "weeder controller watching endpoints"
    );
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                manager.shutdown().await;
                return Ok(());
            }
            event = events.try_next() => match event {
                Ok(Some(watcher::Event::Apply(observed) | watcher::Event::InitApply(observed))) => {
                    let name = observed.name_any();
                    if !config.services_and_dependant_selectors.contains_key(&name) {
                        continue;
                    }
                    let Some(namespace) = observed.namespace() else {
                        continue;
                    };
                    let key = format!("{namespace}/{name}");
                    let now_ready = has_ready_addresses(&observed);
                    let was_ready = ready.insert(key, now_ready);
                    if now_ready && was_ready == Some(false) {
                        info!(namespace = %namespace, service = %name, "endpoint recovered, starting weeder");
                        let weeder = Weeder::new(
                            client.clone(),
                            namespace,
                            name,
                            config.clone(),
                            metrics.clone(),
                        );
                        manager.register(weeder).await;
                    }
                }
                Ok(Some(watcher::Event::Delete(observed))) => {
                    let name = observed.name_any();
                    if let Some(namespace) = observed.namespace() {
                        ready.remove(&format!("{namespace}/{name}"));
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(err) => warn!(error = %err, "endpoints watch error"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    fn endpoints(addresses: Vec<EndpointAddress>, not_ready: Vec<EndpointAddress>) -> Endpoints {
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: if addresses.is_empty() { None } else { Some(addresses) },
                not_ready_addresses: if not_ready.is_empty() { None } else { Some(not_ready) },
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.into(),
            ..Default::default()
        }
    }

    #[test]
    fn ready_addresses_are_detected() {
        assert!(has_ready_addresses(&endpoints(vec![address("10.0.0.1")], vec![])));
        assert!(!has_ready_addresses(&endpoints(vec![], vec![address("10.0.0.1")])));
        assert!(!has_ready_addresses(&Endpoints::default()));
    }
}
