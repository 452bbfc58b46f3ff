use crate::config::ProberConfig;
use crate::prober::manager::ProberManager;
use crate::prober::probe::{ApiServerProber, Prober};
use crate::prober::tenant::TenantClientFactory;
use crate::scale::{FlowScaler, KubeScaleAccess, ScaleAccess};
use crate::util::errors::Result;
use crate::util::metrics::Metrics;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use std::pin::pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tenant control planes live in namespaces carrying this label.
const TENANT_NAMESPACE_SELECTOR: &str = "gardener.cloud/role=shoot";

/// Watch tenant namespaces and keep one prober per live namespace.
///
/// This is deliberately thin glue: a namespace appearing registers a prober,
/// a namespace terminating or disappearing unregisters it. Everything else
/// is the prober's business.
pub async fn run(
    client: Client,
    config: Arc<ProberConfig>,
    manager: Arc<ProberManager>,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) -> Result<()> {
    let access: Arc<dyn ScaleAccess> = Arc::new(KubeScaleAccess::new(client.clone()));
    let factory = Arc::new(TenantClientFactory::new(client.clone(), config.probe_timeout()));
    let namespaces: Api<Namespace> = Api::all(client);
    let mut events = pin!(watcher(
        namespaces,
        watcher::Config::default().labels(TENANT_NAMESPACE_SELECTOR),
    )
    .default_backoff());
    info!(selector = TENANT_NAMESPACE_SELECTOR, "prober controller watching namespaces");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                manager.shutdown().await;
                return Ok(());
            }
            event = events.try_next() => match event {
                Ok(Some(watcher::Event::Apply(namespace) | watcher::Event::InitApply(namespace))) => {
                    let name = namespace.name_any();
                    if namespace.metadata.deletion_timestamp.is_some() {
                        if manager.unregister(&name).await {
                            info!(namespace = %name, "namespace terminating, prober removed");
                        }
                    } else if manager.get_prober(&name).await.is_none() {
                        info!(namespace = %name, "tenant namespace discovered, registering prober");
                        let prober = new_prober(&name, &config, &factory, &access, &metrics);
                        manager.register(prober).await;
                    }
                }
                Ok(Some(watcher::Event::Delete(namespace))) => {
                    let name = namespace.name_any();
                    if manager.unregister(&name).await {
                        info!(namespace = %name, "namespace gone, prober removed");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(err) => warn!(error = %err, "namespace watch error"),
            }
        }
    }
}

fn new_prober(
    namespace: &str,
    config: &Arc<ProberConfig>,
    factory: &Arc<TenantClientFactory>,
    access: &Arc<dyn ScaleAccess>,
    metrics: &Arc<Metrics>,
) -> Prober {
    let internal = Arc::new(ApiServerProber::new(
        factory.clone(),
        config.internal_kubeconfig_secret_name(),
        config.probe_timeout(),
    ));
    let external = Arc::new(ApiServerProber::new(
        factory.clone(),
        config.external_kubeconfig_secret_name(),
        config.probe_timeout(),
    ));
    let scaler = Arc::new(FlowScaler::new(
        namespace,
        config.dependent_resource_infos.clone(),
        access.clone(),
        metrics.clone(),
    ));
    Prober::new(namespace, config.clone(), internal, external, scaler, metrics.clone())
}
