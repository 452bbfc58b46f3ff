//! Meltdown protection: suspending and restoring the controllers that depend
//! on a tenant API server, in the order their levels prescribe.

pub mod access;
pub mod flow;
pub mod scaler;

#[cfg(test)]
pub(crate) mod fixtures;

pub use access::{KubeScaleAccess, ScaleAccess};
pub use flow::ScaleFlow;
pub use scaler::{ResourceScaler, ScalableResourceInfo, ScaleOperation};

use crate::config::DependentResourceInfo;
use crate::util::errors::Result;
use crate::util::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The scaling seam between the prober and the flow engine.
#[async_trait]
pub trait Scaler: Send + Sync {
    async fn scale_up(&self, token: &CancellationToken) -> Result<()>;
    async fn scale_down(&self, token: &CancellationToken) -> Result<()>;
}

/// Production [`Scaler`]: builds and runs a level-ordered flow over the
/// configured dependent resources of one tenant namespace.
pub struct FlowScaler {
    namespace: String,
    resource_infos: Vec<DependentResourceInfo>,
    scaler: ResourceScaler,
    metrics: Arc<Metrics>,
}

impl FlowScaler {
    pub fn new(
        namespace: impl Into<String>,
        resource_infos: Vec<DependentResourceInfo>,
        access: Arc<dyn ScaleAccess>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            scaler: ResourceScaler::new(access, namespace.clone()),
            namespace,
            resource_infos,
            metrics,
        }
    }

    async fn run(&self, token: &CancellationToken, operation: ScaleOperation) -> Result<()> {
        let _timer = self.metrics.measure_scale_flow(operation.as_str());
        let flow = ScaleFlow::build(&self.resource_infos, operation);
        let result = tokio::select! {
            _ = token.cancelled() => Err(crate::util::errors::Error::Cancelled(format!(
                "{operation} flow in namespace {} aborted by shutdown",
                self.namespace
            ))),
            result = flow.run(token, &self.scaler) => result,
        };
        if let Err(ref err) = result {
            if !err.is_cancelled() {
                self.metrics
                    .scale_flow_failure(&self.namespace, operation.as_str(), err);
            }
        }
        result
    }
}

#[async_trait]
impl Scaler for FlowScaler {
    async fn scale_up(&self, token: &CancellationToken) -> Result<()> {
        self.run(token, ScaleOperation::Up).await
    }

    async fn scale_down(&self, token: &CancellationToken) -> Result<()> {
        self.run(token, ScaleOperation::Down).await
    }
}
