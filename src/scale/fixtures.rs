//! In-memory [`ScaleAccess`] used by the scaler and flow tests.

use super::access::ScaleAccess;
use crate::config::ResourceRef;
use crate::util::errors::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tokio::time::Duration;

/// A mutating call against the fake, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Annotations(String),
    Replicas(String, i32),
}

#[derive(Default)]
struct FakeResource {
    replicas: i32,
    ready_replicas: i32,
    annotations: BTreeMap<String, String>,
    frozen_readiness: bool,
}

#[derive(Default)]
pub struct FakeScaleAccess {
    resources: Mutex<BTreeMap<String, FakeResource>>,
    writes: Mutex<Vec<Write>>,
}

impl FakeScaleAccess {
    pub async fn put(&self, name: &str, replicas: i32, annotations: &[(&str, &str)]) {
        self.resources.lock().await.insert(
            name.to_string(),
            FakeResource {
                replicas,
                ready_replicas: replicas,
                annotations: annotations
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
                frozen_readiness: false,
            },
        );
    }

    /// Readiness stops tracking the replica count; ready-waits will time out.
    pub async fn freeze_readiness(&self, name: &str) {
        if let Some(resource) = self.resources.lock().await.get_mut(name) {
            resource.frozen_readiness = true;
        }
    }

    pub async fn replicas(&self, name: &str) -> i32 {
        self.resources.lock().await.get(name).map(|r| r.replicas).unwrap_or(-1)
    }

    pub async fn annotations(&self, name: &str) -> BTreeMap<String, String> {
        self.resources
            .lock()
            .await
            .get(name)
            .map(|r| r.annotations.clone())
            .unwrap_or_default()
    }

    pub async fn writes(&self) -> Vec<Write> {
        self.writes.lock().await.clone()
    }

    fn missing(target: &ResourceRef) -> Error {
        Error::NotFound(format!("{target} not found"))
    }
}

#[async_trait]
impl ScaleAccess for FakeScaleAccess {
    async fn get_annotations(
        &self,
        _namespace: &str,
        target: &ResourceRef,
    ) -> Result<BTreeMap<String, String>> {
        self.resources
            .lock()
            .await
            .get(&target.name)
            .map(|r| r.annotations.clone())
            .ok_or_else(|| Self::missing(target))
    }

    async fn patch_annotations(
        &self,
        _namespace: &str,
        target: &ResourceRef,
        entries: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut resources = self.resources.lock().await;
        let resource = resources.get_mut(&target.name).ok_or_else(|| Self::missing(target))?;
        for (key, value) in entries {
            match value {
                Some(value) => {
                    resource.annotations.insert(key, value);
                }
                None => {
                    resource.annotations.remove(&key);
                }
            }
        }
        self.writes.lock().await.push(Write::Annotations(target.name.clone()));
        Ok(())
    }

    async fn get_replicas(&self, _namespace: &str, target: &ResourceRef) -> Result<i32> {
        self.resources
            .lock()
            .await
            .get(&target.name)
            .map(|r| r.replicas)
            .ok_or_else(|| Self::missing(target))
    }

    async fn set_replicas(
        &self,
        _namespace: &str,
        target: &ResourceRef,
        replicas: i32,
        _write_timeout: Duration,
    ) -> Result<()> {
        let mut resources = self.resources.lock().await;
        let resource = resources.get_mut(&target.name).ok_or_else(|| Self::missing(target))?;
        resource.replicas = replicas;
        if !resource.frozen_readiness {
            resource.ready_replicas = replicas;
        }
        self.writes.lock().await.push(Write::Replicas(target.name.clone(), replicas));
        Ok(())
    }

    async fn get_ready_replicas(&self, _namespace: &str, target: &ResourceRef) -> Result<i32> {
        self.resources
            .lock()
            .await
            .get(&target.name)
            .map(|r| r.ready_replicas)
            .ok_or_else(|| Self::missing(target))
    }
}
