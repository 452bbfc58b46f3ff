use crate::config::ResourceRef;
use crate::scale::access::ScaleAccess;
use crate::util::errors::{Error, Result};
use crate::util::retry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Setting this to `"true"` hands the resource back to the operator; the
/// watchdog will not touch its replicas.
pub const IGNORE_SCALING_ANNOTATION: &str = "dependency-watchdog.gardener.cloud/ignore-scaling";
/// Records `spec.replicas` as it was immediately before a scale-down.
pub const REPLICAS_ANNOTATION: &str = "dependency-watchdog.gardener.cloud/replicas";
/// Marks a resource as currently suspended by meltdown protection.
pub const MELTDOWN_PROTECTION_ACTIVE_ANNOTATION: &str =
    "dependency-watchdog.gardener.cloud/meltdown-protection-active";

/// Used when no replica count was recorded before the scale-down.
pub const DEFAULT_SCALE_UP_REPLICAS: i32 = 1;

pub const DEFAULT_RESOURCE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RESOURCE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOperation {
    Up,
    Down,
}

impl ScaleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleOperation::Up => "scale-up",
            ScaleOperation::Down => "scale-down",
        }
    }
}

impl fmt::Display for ScaleOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource of a scale flow, with the level ordering and timing picked
/// for the operation at hand.
#[derive(Debug, Clone)]
pub struct ScalableResourceInfo {
    pub reference: ResourceRef,
    pub optional: bool,
    pub level: i32,
    pub initial_delay: Duration,
    pub timeout: Duration,
    pub operation: ScaleOperation,
}

/// Scales a single resource up or down.
///
/// Safe to invoke repeatedly: a resource whose replica count already points
/// in the desired direction is left alone.
#[derive(Clone)]
pub struct ResourceScaler {
    access: Arc<dyn ScaleAccess>,
    namespace: String,
    check_interval: Duration,
    check_timeout: Duration,
}

impl ResourceScaler {
    pub fn new(access: Arc<dyn ScaleAccess>, namespace: impl Into<String>) -> Self {
        Self {
            access,
            namespace: namespace.into(),
            check_interval: DEFAULT_RESOURCE_CHECK_INTERVAL,
            check_timeout: DEFAULT_RESOURCE_CHECK_TIMEOUT,
        }
    }

    pub fn with_check_bounds(mut self, interval: Duration, timeout: Duration) -> Self {
        self.check_interval = interval;
        self.check_timeout = timeout;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn scale(&self, token: &CancellationToken, info: &ScalableResourceInfo) -> Result<()> {
        retry::sleep_for(token, info.initial_delay).await?;

        let annotations = match self.access.get_annotations(&self.namespace, &info.reference).await {
            Ok(annotations) => annotations,
            Err(err) if err.is_not_found() && info.optional => {
                debug!(namespace = %self.namespace, resource = %info.reference, "optional resource absent, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if annotations.get(IGNORE_SCALING_ANNOTATION).map(String::as_str) == Some("true") {
            info!(namespace = %self.namespace, resource = %info.reference, "scaling suspended by operator annotation");
            if annotations.contains_key(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION) {
                self.remove_meltdown_marker(&info.reference).await?;
            }
            return Ok(());
        }

        let replicas = self.access.get_replicas(&self.namespace, &info.reference).await?;
        let should_scale = match info.operation {
            ScaleOperation::Up => replicas == 0,
            ScaleOperation::Down => replicas > 0,
        };
        if !should_scale {
            debug!(
                namespace = %self.namespace,
                resource = %info.reference,
                replicas,
                "replica count already points in the desired direction, nothing to do"
            );
            if info.operation == ScaleOperation::Up
                && annotations.contains_key(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION)
            {
                self.remove_meltdown_marker(&info.reference).await?;
            }
            return Ok(());
        }

        let target = match info.operation {
            ScaleOperation::Down => {
                // The recording must be acknowledged before the replica count
                // changes, otherwise a crash in between loses the restore
                // target.
                let mut entries = BTreeMap::new();
                entries.insert(REPLICAS_ANNOTATION.to_string(), Some(replicas.to_string()));
                entries.insert(
                    MELTDOWN_PROTECTION_ACTIVE_ANNOTATION.to_string(),
                    Some(String::new()),
                );
                self.access
                    .patch_annotations(&self.namespace, &info.reference, entries)
                    .await?;
                0
            }
            ScaleOperation::Up => match annotations.get(REPLICAS_ANNOTATION) {
                Some(recorded) => recorded.parse::<i32>().map_err(|_| {
                    Error::Invariant(format!(
                        "annotation {REPLICAS_ANNOTATION} on {} in namespace {} holds non-integer value {recorded:?}",
                        info.reference, self.namespace
                    ))
                })?,
                None => DEFAULT_SCALE_UP_REPLICAS,
            },
        };

        info!(
            namespace = %self.namespace,
            resource = %info.reference,
            operation = %info.operation,
            target,
            "scaling resource"
        );
        self.access
            .set_replicas(&self.namespace, &info.reference, target, info.timeout)
            .await?;

        if info.operation == ScaleOperation::Up {
            self.remove_meltdown_marker(&info.reference).await?;
        }

        let minimum_ready = match info.operation {
            ScaleOperation::Up => DEFAULT_SCALE_UP_REPLICAS,
            ScaleOperation::Down => 0,
        };
        let access = self.access.as_ref();
        let namespace = self.namespace.as_str();
        let reference = &info.reference;
        let operation = info.operation;
        let reached = retry::retry_until(token, self.check_interval, self.check_timeout, move || async move {
            match access.get_ready_replicas(namespace, reference).await {
                Ok(ready) => match operation {
                    ScaleOperation::Up => ready >= minimum_ready,
                    ScaleOperation::Down => ready <= minimum_ready,
                },
                Err(_) => false,
            }
        })
        .await;
        if token.is_cancelled() {
            return Err(Error::Cancelled(format!(
                "{} of {} in namespace {} aborted by shutdown",
                info.operation, info.reference, self.namespace
            )));
        }
        if !reached {
            return Err(Error::Timeout(format!(
                "resource {} in namespace {} did not reach minimum target ready replicas {minimum_ready} within {:?}",
                info.reference, self.namespace, self.check_timeout
            )));
        }
        Ok(())
    }

    async fn remove_meltdown_marker(&self, reference: &ResourceRef) -> Result<()> {
        let mut entries = BTreeMap::new();
        entries.insert(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION.to_string(), None);
        self.access.patch_annotations(&self.namespace, reference, entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::fixtures::{FakeScaleAccess, Write};

    fn info(name: &str, operation: ScaleOperation) -> ScalableResourceInfo {
        ScalableResourceInfo {
            reference: ResourceRef {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                name: name.into(),
            },
            optional: false,
            level: 0,
            initial_delay: Duration::ZERO,
            timeout: Duration::from_secs(5),
            operation,
        }
    }

    fn scaler(access: &Arc<FakeScaleAccess>) -> ResourceScaler {
        ResourceScaler::new(access.clone() as Arc<dyn ScaleAccess>, "shoot--test")
            .with_check_bounds(Duration::from_millis(5), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn scale_up_already_running_is_a_no_op() {
        let access = Arc::new(FakeScaleAccess::default());
        access.put("kcm", 3, &[]).await;
        let token = CancellationToken::new();

        scaler(&access).scale(&token, &info("kcm", ScaleOperation::Up)).await.unwrap();

        assert_eq!(access.replicas("kcm").await, 3);
        assert!(access.writes().await.is_empty());
    }

    #[tokio::test]
    async fn scale_down_already_stopped_is_a_no_op() {
        let access = Arc::new(FakeScaleAccess::default());
        access.put("kcm", 0, &[]).await;
        let token = CancellationToken::new();

        scaler(&access).scale(&token, &info("kcm", ScaleOperation::Down)).await.unwrap();

        assert_eq!(access.replicas("kcm").await, 0);
        assert!(access.writes().await.is_empty());
    }

    #[tokio::test]
    async fn scale_down_records_replicas_before_writing_scale() {
        let access = Arc::new(FakeScaleAccess::default());
        access.put("kcm", 2, &[]).await;
        let token = CancellationToken::new();

        scaler(&access).scale(&token, &info("kcm", ScaleOperation::Down)).await.unwrap();

        assert_eq!(access.replicas("kcm").await, 0);
        let annotations = access.annotations("kcm").await;
        assert_eq!(annotations.get(REPLICAS_ANNOTATION).map(String::as_str), Some("2"));
        assert!(annotations.contains_key(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION));
        // annotation write strictly precedes the replica write
        let writes = access.writes().await;
        assert_eq!(
            writes,
            vec![Write::Annotations("kcm".into()), Write::Replicas("kcm".into(), 0)]
        );
    }

    #[tokio::test]
    async fn scale_down_then_up_restores_recorded_replicas() {
        let access = Arc::new(FakeScaleAccess::default());
        access.put("kcm", 2, &[]).await;
        let token = CancellationToken::new();
        let scaler = scaler(&access);

        scaler.scale(&token, &info("kcm", ScaleOperation::Down)).await.unwrap();
        scaler.scale(&token, &info("kcm", ScaleOperation::Up)).await.unwrap();

        assert_eq!(access.replicas("kcm").await, 2);
        let annotations = access.annotations("kcm").await;
        assert!(!annotations.contains_key(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION));
    }

    #[tokio::test]
    async fn scale_up_without_recording_defaults_to_one() {
        let access = Arc::new(FakeScaleAccess::default());
        access.put("kcm", 0, &[]).await;
        let token = CancellationToken::new();

        scaler(&access).scale(&token, &info("kcm", ScaleOperation::Up)).await.unwrap();

        assert_eq!(access.replicas("kcm").await, DEFAULT_SCALE_UP_REPLICAS);
    }

    #[tokio::test]
    async fn scale_up_with_garbage_recording_is_an_invariant_error() {
        let access = Arc::new(FakeScaleAccess::default());
        access.put("kcm", 0, &[(REPLICAS_ANNOTATION, "two")]).await;
        let token = CancellationToken::new();

        let err = scaler(&access)
            .scale(&token, &info("kcm", ScaleOperation::Up))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert_eq!(access.replicas("kcm").await, 0);
    }

    #[tokio::test]
    async fn ignore_scaling_annotation_skips_and_clears_marker() {
        let access = Arc::new(FakeScaleAccess::default());
        access
            .put(
                "kcm",
                4,
                &[
                    (IGNORE_SCALING_ANNOTATION, "true"),
                    (MELTDOWN_PROTECTION_ACTIVE_ANNOTATION, ""),
                ],
            )
            .await;
        let token = CancellationToken::new();

        scaler(&access).scale(&token, &info("kcm", ScaleOperation::Down)).await.unwrap();

        assert_eq!(access.replicas("kcm").await, 4);
        assert!(!access
            .annotations("kcm")
            .await
            .contains_key(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION));
    }

    #[tokio::test]
    async fn skipped_scale_up_still_clears_stale_marker() {
        let access = Arc::new(FakeScaleAccess::default());
        access
            .put("kcm", 2, &[(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION, "")])
            .await;
        let token = CancellationToken::new();

        scaler(&access).scale(&token, &info("kcm", ScaleOperation::Up)).await.unwrap();

        assert_eq!(access.replicas("kcm").await, 2);
        assert!(!access
            .annotations("kcm")
            .await
            .contains_key(MELTDOWN_PROTECTION_ACTIVE_ANNOTATION));
    }

    #[tokio::test]
    async fn absent_optional_resource_is_skipped() {
        let access = Arc::new(FakeScaleAccess::default());
        let token = CancellationToken::new();
        let mut absent = info("gone", ScaleOperation::Up);
        absent.optional = true;

        scaler(&access).scale(&token, &absent).await.unwrap();
    }

    #[tokio::test]
    async fn absent_mandatory_resource_fails() {
        let access = Arc::new(FakeScaleAccess::default());
        let token = CancellationToken::new();

        let err = scaler(&access)
            .scale(&token, &info("gone", ScaleOperation::Up))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ready_wait_timeout_names_the_resource() {
        let access = Arc::new(FakeScaleAccess::default());
        access.put("kcm", 0, &[]).await;
        access.freeze_readiness("kcm").await;
        let token = CancellationToken::new();

        let err = scaler(&access)
            .scale(&token, &info("kcm", ScaleOperation::Up))
            .await
            .unwrap_err();
        match err {
            Error::Timeout(message) => {
                assert!(message.contains("Deployment/kcm"));
                assert!(message.contains("shoot--test"));
                assert!(message.contains('1'));
            }
            other => panic!("expected timeout, got {other}"),
        }
    }
}
