use crate::config::ResourceRef;
use crate::util::errors::{Error, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
    discovery::Discovery,
    Client,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Reads and writes against the scale subresource and the annotations of an
/// arbitrary scalable resource.
///
/// Absent resources surface as [`Error::NotFound`].
#[async_trait]
pub trait ScaleAccess: Send + Sync {
    async fn get_annotations(
        &self,
        namespace: &str,
        target: &ResourceRef,
    ) -> Result<BTreeMap<String, String>>;

    /// Merge-patch the target's annotations. A `None` value removes the key.
    async fn patch_annotations(
        &self,
        namespace: &str,
        target: &ResourceRef,
        entries: BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// `spec.replicas` as reported by the scale subresource.
    async fn get_replicas(&self, namespace: &str, target: &ResourceRef) -> Result<i32>;

    /// Merge-patch `spec.replicas` through the scale subresource.
    async fn set_replicas(
        &self,
        namespace: &str,
        target: &ResourceRef,
        replicas: i32,
        write_timeout: Duration,
    ) -> Result<()>;

    /// `status.readyReplicas` of the typed object; 0 when unset.
    async fn get_ready_replicas(&self, namespace: &str, target: &ResourceRef) -> Result<i32>;
}

/// [`ScaleAccess`] against a live cluster.
///
/// Kinds are resolved to their served resource once via API discovery and
/// cached for the lifetime of the process; all traffic then goes through a
/// dynamically typed API handle.
pub struct KubeScaleAccess {
    client: Client,
    resolved: Mutex<HashMap<String, kube::core::ApiResource>>,
}

impl KubeScaleAccess {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    async fn api_for(&self, namespace: &str, target: &ResourceRef) -> Result<Api<DynamicObject>> {
        let key = format!("{}/{}", target.api_version, target.kind);
        {
            let resolved = self.resolved.lock().await;
            if let Some(resource) = resolved.get(&key) {
                return Ok(Api::namespaced_with(self.client.clone(), namespace, resource));
            }
        }
        let (group, version) = match target.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", target.api_version.as_str()),
        };
        debug!(api_version = %target.api_version, kind = %target.kind, "resolving kind via discovery");
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(Error::from)?;
        for discovered in discovery.groups() {
            for (resource, _capabilities) in discovered.recommended_resources() {
                if resource.group == group && resource.version == version && resource.kind == target.kind {
                    let api = Api::namespaced_with(self.client.clone(), namespace, &resource);
                    self.resolved.lock().await.insert(key, resource);
                    return Ok(api);
                }
            }
        }
        Err(Error::NotFound(format!(
            "no served resource maps to {}/{}",
            target.api_version, target.kind
        )))
    }
}

#[async_trait]
impl ScaleAccess for KubeScaleAccess {
    async fn get_annotations(
        &self,
        namespace: &str,
        target: &ResourceRef,
    ) -> Result<BTreeMap<String, String>> {
        let api = self.api_for(namespace, target).await?;
        let object = api.get(&target.name).await.map_err(Error::from)?;
        Ok(object.metadata.annotations.unwrap_or_default())
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        target: &ResourceRef,
        entries: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api = self.api_for(namespace, target).await?;
        let mut annotations = Map::new();
        for (key, value) in entries {
            annotations.insert(key, value.map(Value::String).unwrap_or(Value::Null));
        }
        let body = json!({ "metadata": { "annotations": annotations } });
        api.patch(&target.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn get_replicas(&self, namespace: &str, target: &ResourceRef) -> Result<i32> {
        let api = self.api_for(namespace, target).await?;
        let scale = api.get_scale(&target.name).await.map_err(Error::from)?;
        Ok(scale.spec.and_then(|spec| spec.replicas).unwrap_or(0))
    }

    async fn set_replicas(
        &self,
        namespace: &str,
        target: &ResourceRef,
        replicas: i32,
        write_timeout: Duration,
    ) -> Result<()> {
        let api = self.api_for(namespace, target).await?;
        let body = json!({ "spec": { "replicas": replicas } });
        let patch_params = PatchParams::default();
        let patch = Patch::Merge(&body);
        let write = api.patch_scale(&target.name, &patch_params, &patch);
        match timeout(write_timeout, write).await {
            Ok(written) => {
                written.map_err(Error::from)?;
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!(
                "scale write for {target} in namespace {namespace} exceeded {write_timeout:?}"
            ))),
        }
    }

    async fn get_ready_replicas(&self, namespace: &str, target: &ResourceRef) -> Result<i32> {
        let api = self.api_for(namespace, target).await?;
        let object = api.get(&target.name).await.map_err(Error::from)?;
        Ok(object.data["status"]["readyReplicas"].as_i64().unwrap_or(0) as i32)
    }
}
