//! Scripted collaborators for the prober tests.

use crate::config::ProberConfig;
use crate::prober::probe::{PathProber, Prober};
use crate::scale::Scaler;
use crate::util::errors::{Error, Result};
use crate::util::metrics::Metrics;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn test_config() -> ProberConfig {
    ProberConfig {
        internal_kubeconfig_secret_name: Some("internal-kubeconfig".into()),
        external_kubeconfig_secret_name: Some("external-kubeconfig".into()),
        probe_interval: Some(Duration::from_millis(10)),
        initial_delay: Some(Duration::from_millis(1)),
        probe_timeout: Some(Duration::from_millis(50)),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        internal_probe_failure_backoff_duration: Some(Duration::from_millis(1)),
        backoff_jitter_factor: Some(0.2),
        dependent_resource_infos: Vec::new(),
    }
}

/// Pops one scripted outcome per probe; repeats the fallback when drained.
pub struct ScriptedPathProber {
    script: Mutex<VecDeque<Result<()>>>,
    fallback_ok: bool,
    calls: AtomicU32,
}

impl ScriptedPathProber {
    pub fn script(outcomes: Vec<Result<()>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fallback_ok: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_ok() -> Self {
        Self::script(Vec::new())
    }

    pub fn always_err() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback_ok: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PathProber for ScriptedPathProber {
    async fn probe(&self, _token: &CancellationToken, namespace: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.script.lock().await.pop_front() {
            return outcome;
        }
        if self.fallback_ok {
            Ok(())
        } else {
            Err(Error::Timeout(format!("probe of namespace {namespace} timed out")))
        }
    }
}

/// Counts scale invocations; optionally fails the first one.
#[derive(Default)]
pub struct CountingScaler {
    ups: AtomicU32,
    downs: AtomicU32,
    failures_left: AtomicU32,
}

impl CountingScaler {
    pub fn failing_once() -> Self {
        Self {
            failures_left: AtomicU32::new(1),
            ..Self::default()
        }
    }

    pub fn ups(&self) -> u32 {
        self.ups.load(Ordering::SeqCst)
    }

    pub fn downs(&self) -> u32 {
        self.downs.load(Ordering::SeqCst)
    }

    fn outcome(&self) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 && self.failures_left.compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            return Err(Error::Timeout("scale flow timed out".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Scaler for CountingScaler {
    async fn scale_up(&self, _token: &CancellationToken) -> Result<()> {
        self.ups.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    async fn scale_down(&self, _token: &CancellationToken) -> Result<()> {
        self.downs.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }
}

/// A prober that sits in its initial delay until cancelled; used by the
/// manager tests where only registry semantics matter.
pub fn idle_prober(namespace: &str) -> Prober {
    let mut config = test_config();
    config.initial_delay = Some(Duration::from_secs(3600));
    Prober::new(
        namespace,
        Arc::new(config),
        Arc::new(ScriptedPathProber::always_ok()),
        Arc::new(ScriptedPathProber::always_ok()),
        Arc::new(CountingScaler::default()),
        Arc::new(Metrics::default()),
    )
}
