use crate::config::ProberConfig;
use crate::prober::tenant::TenantClientFactory;
use crate::scale::Scaler;
use crate::util::errors::{Error, Result};
use crate::util::metrics::Metrics;
use crate::util::retry;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One health check of the tenant API server over one network path.
#[async_trait]
pub trait PathProber: Send + Sync {
    async fn probe(&self, token: &CancellationToken, namespace: &str) -> Result<()>;
}

/// Probes by building a tenant client from the path's kubeconfig secret and
/// asking the API server for its version.
pub struct ApiServerProber {
    factory: Arc<TenantClientFactory>,
    secret_name: String,
    probe_timeout: Duration,
}

impl ApiServerProber {
    pub fn new(
        factory: Arc<TenantClientFactory>,
        secret_name: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            secret_name: secret_name.into(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl PathProber for ApiServerProber {
    async fn probe(&self, token: &CancellationToken, namespace: &str) -> Result<()> {
        let client = self
            .factory
            .create_discovery_client(token, namespace, &self.secret_name, self.probe_timeout)
            .await?;
        match tokio::time::timeout(self.probe_timeout, client.apiserver_version()).await {
            Ok(version) => {
                version.map_err(Error::from)?;
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!(
                "api server probe in namespace {namespace} exceeded {:?}",
                self.probe_timeout
            ))),
        }
    }
}

/// Consecutive outcome counters for one probe path.
///
/// Success and failure streaks are mutually exclusive; recording one resets
/// the other.
#[derive(Debug, Default, Clone)]
pub struct ProbeResult {
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl ProbeResult {
    pub fn record_success(&mut self) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, err: &Error) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_error = Some(err.to_string());
    }

    pub fn is_healthy(&self, success_threshold: u32) -> bool {
        self.consecutive_successes >= success_threshold
    }

    pub fn is_unhealthy(&self, failure_threshold: u32) -> bool {
        self.consecutive_failures >= failure_threshold
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum PathHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Default)]
struct ProbeState {
    internal: ProbeResult,
    external: ProbeResult,
    last_external: PathHealth,
}

/// Long-lived probe loop for one tenant namespace.
///
/// The internal path gates the external one: only an internally healthy API
/// server has its external reachability judged, so pure tenant outages never
/// trigger meltdown protection. Crossing the external healthy/unhealthy
/// boundary is the only thing that scales dependants.
pub struct Prober {
    namespace: String,
    config: Arc<ProberConfig>,
    internal: Arc<dyn PathProber>,
    external: Arc<dyn PathProber>,
    scaler: Arc<dyn Scaler>,
    metrics: Arc<Metrics>,
}

impl Prober {
    pub fn new(
        namespace: impl Into<String>,
        config: Arc<ProberConfig>,
        internal: Arc<dyn PathProber>,
        external: Arc<dyn PathProber>,
        scaler: Arc<dyn Scaler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            config,
            internal,
            external,
            scaler,
            metrics,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn run(self, token: CancellationToken) {
        debug!(namespace = %self.namespace, "prober starting");
        if retry::sleep_for(&token, self.config.initial_delay()).await.is_err() {
            return;
        }
        let mut state = ProbeState::default();
        loop {
            if token.is_cancelled() {
                break;
            }
            self.probe_round(&token, &mut state).await;
            let interval = jittered(self.config.probe_interval(), self.config.backoff_jitter_factor());
            if retry::sleep_for(&token, interval).await.is_err() {
                break;
            }
        }
        debug!(namespace = %self.namespace, "prober stopped");
    }

    async fn probe_round(&self, token: &CancellationToken, state: &mut ProbeState) {
        match self.internal.probe(token, &self.namespace).await {
            Ok(()) => {
                self.metrics.observe_probe(&self.namespace, "internal", "success");
                state.internal.record_success();
            }
            Err(err) if err.is_cancelled() => return,
            Err(err) if err.is_not_found() => {
                // kubeconfig secret not there yet, nothing to conclude
                debug!(namespace = %self.namespace, "internal kubeconfig secret not found, skipping round");
                return;
            }
            Err(err) => {
                self.metrics.observe_probe(&self.namespace, "internal", "failure");
                warn!(namespace = %self.namespace, error = %err, "internal probe failed");
                state.internal.record_failure(&err);
            }
        }

        if state.internal.is_unhealthy(self.config.failure_threshold()) {
            info!(
                namespace = %self.namespace,
                backoff = ?self.config.internal_probe_failure_backoff_duration(),
                "internal path unhealthy, backing off before the next probe"
            );
            let _ = retry::sleep_for(token, self.config.internal_probe_failure_backoff_duration()).await;
            return;
        }
        if !state.internal.is_healthy(self.config.success_threshold()) {
            return;
        }

        match self.external.probe(token, &self.namespace).await {
            Ok(()) => {
                self.metrics.observe_probe(&self.namespace, "external", "success");
                state.external.record_success();
            }
            Err(err) if err.is_cancelled() => return,
            Err(err) if err.is_not_found() => {
                debug!(namespace = %self.namespace, "external kubeconfig secret not found, skipping round");
                return;
            }
            Err(err) => {
                self.metrics.observe_probe(&self.namespace, "external", "failure");
                warn!(namespace = %self.namespace, error = %err, "external probe failed");
                state.external.record_failure(&err);
            }
        }

        if state.external.is_healthy(self.config.success_threshold())
            && state.last_external != PathHealth::Healthy
        {
            info!(namespace = %self.namespace, "external path recovered, restoring dependants");
            match self.scaler.scale_up(token).await {
                Ok(()) => state.last_external = PathHealth::Healthy,
                Err(err) if err.is_cancelled() => {}
                Err(err) => error!(namespace = %self.namespace, error = %err, "scale-up failed"),
            }
        } else if state.external.is_unhealthy(self.config.failure_threshold())
            && state.last_external != PathHealth::Unhealthy
        {
            warn!(namespace = %self.namespace, "external path unreachable, suspending dependants");
            match self.scaler.scale_down(token).await {
                Ok(()) => state.last_external = PathHealth::Unhealthy,
                Err(err) if err.is_cancelled() => {}
                Err(err) => error!(namespace = %self.namespace, error = %err, "scale-down failed"),
            }
        }
    }
}

fn jittered(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let jitter: f64 = rand::thread_rng().gen_range(-factor..factor);
    interval.mul_f64(1.0 + jitter)
}
