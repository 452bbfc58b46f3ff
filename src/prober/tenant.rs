use crate::util::errors::{Error, Result};
use crate::util::retry;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const SECRET_RETRY_ATTEMPTS: u32 = 3;
const SECRET_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Builds clients against a tenant API server from the kubeconfig kept in a
/// secret of the tenant's namespace on the management cluster.
///
/// The secret read is retried with a short backoff; a missing secret is not
/// retried, it simply does not exist yet.
pub struct TenantClientFactory {
    client: Client,
    connection_timeout: Duration,
}

impl TenantClientFactory {
    pub fn new(client: Client, connection_timeout: Duration) -> Self {
        Self {
            client,
            connection_timeout,
        }
    }

    /// General-purpose client for lookups inside the tenant.
    pub async fn create_client(
        &self,
        token: &CancellationToken,
        namespace: &str,
        secret_name: &str,
    ) -> Result<Client> {
        self.build(token, namespace, secret_name, None).await
    }

    /// Client for discovery calls, with reads bounded by the probe timeout.
    pub async fn create_discovery_client(
        &self,
        token: &CancellationToken,
        namespace: &str,
        secret_name: &str,
        read_timeout: Duration,
    ) -> Result<Client> {
        self.build(token, namespace, secret_name, Some(read_timeout)).await
    }

    async fn build(
        &self,
        token: &CancellationToken,
        namespace: &str,
        secret_name: &str,
        read_timeout: Option<Duration>,
    ) -> Result<Client> {
        let raw = self.read_kubeconfig(token, namespace, secret_name).await?;
        let kubeconfig = Kubeconfig::from_yaml(&raw)
            .map_err(|err| Error::KubeconfigError(format!("secret {namespace}/{secret_name}: {err}")))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|err| Error::KubeconfigError(format!("secret {namespace}/{secret_name}: {err}")))?;
        config.connect_timeout = Some(self.connection_timeout);
        if let Some(read_timeout) = read_timeout {
            config.read_timeout = Some(read_timeout);
        }
        Client::try_from(config).map_err(Error::from)
    }

    async fn read_kubeconfig(
        &self,
        token: &CancellationToken,
        namespace: &str,
        secret_name: &str,
    ) -> Result<String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        retry::retry(
            token,
            &format!("read kubeconfig secret {namespace}/{secret_name}"),
            SECRET_RETRY_ATTEMPTS,
            SECRET_RETRY_BACKOFF,
            || {
                let secrets = secrets.clone();
                async move {
                    let secret = secrets.get(secret_name).await.map_err(Error::from)?;
                    let data = secret.data.unwrap_or_default();
                    let value = data.get(KUBECONFIG_SECRET_KEY).ok_or_else(|| {
                        Error::Invariant(format!(
                            "secret {namespace}/{secret_name} carries no {KUBECONFIG_SECRET_KEY:?} key"
                        ))
                    })?;
                    String::from_utf8(value.0.clone()).map_err(|_| {
                        Error::Invariant(format!(
                            "secret {namespace}/{secret_name} holds a non-UTF-8 kubeconfig"
                        ))
                    })
                }
            },
            retry::retry_unless_not_found,
        )
        .await
    }
}
