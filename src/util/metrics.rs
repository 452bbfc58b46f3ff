use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub probes: IntCounterVec,
    pub scale_flow_failures: IntCounterVec,
    pub scale_flow_duration: HistogramVec,
    pub weeded_pods: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let probes = IntCounterVec::new(
            opts!("watchdog_probes_total", "api server probe results"),
            &["namespace", "path", "result"],
        )
        .unwrap();
        let scale_flow_failures = IntCounterVec::new(
            opts!("watchdog_scale_flow_failures_total", "failed scale flows"),
            &["namespace", "operation", "error"],
        )
        .unwrap();
        let scale_flow_duration = HistogramVec::new(
            histogram_opts!(
                "watchdog_scale_flow_duration_seconds",
                "The duration of a scale flow in seconds",
            )
            .buckets(vec![0.1, 0.5, 1., 5., 15., 30., 60., 120.]),
            &["operation"],
        )
        .unwrap();
        let weeded_pods = IntCounterVec::new(
            opts!("watchdog_weeded_pods_total", "crash-looping pods deleted"),
            &["namespace", "service"],
        )
        .unwrap();
        Metrics {
            probes,
            scale_flow_failures,
            scale_flow_duration,
            weeded_pods,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.probes.clone()))?;
        registry.register(Box::new(self.scale_flow_failures.clone()))?;
        registry.register(Box::new(self.scale_flow_duration.clone()))?;
        registry.register(Box::new(self.weeded_pods.clone()))?;
        Ok(self)
    }

    pub fn observe_probe(&self, namespace: &str, path: &str, result: &str) {
        self.probes.with_label_values(&[namespace, path, result]).inc();
    }

    pub fn scale_flow_failure(&self, namespace: &str, operation: &str, error: &crate::util::errors::Error) {
        self.scale_flow_failures
            .with_label_values(&[namespace, operation, error.metric_label().as_ref()])
            .inc();
    }

    pub fn observe_weeded_pod(&self, namespace: &str, service: &str) {
        self.weeded_pods.with_label_values(&[namespace, service]).inc();
    }

    pub fn measure_scale_flow(&self, operation: &str) -> FlowMeasurer {
        FlowMeasurer {
            start: Instant::now(),
            metric: self.scale_flow_duration.clone(),
            operation: operation.to_string(),
        }
    }
}

/// Smart flow duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct FlowMeasurer {
    start: Instant,
    metric: HistogramVec,
    operation: String,
}

impl Drop for FlowMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.operation.as_str()])
            .observe(duration);
    }
}
