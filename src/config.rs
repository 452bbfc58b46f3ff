//! Configuration schemas for the two watchdog commands.
//!
//! Files are YAML. Optional fields fall back to the documented defaults;
//! validation collects every problem into one aggregated error instead of
//! failing on the first.

use crate::util::errors::{ConfigIssues, Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_INTERNAL_PROBE_FAILURE_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_JITTER_FACTOR: f64 = 0.2;
pub const DEFAULT_SCALE_INITIAL_DELAY: Duration = Duration::ZERO;
pub const DEFAULT_SCALE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WATCH_DURATION: Duration = Duration::from_secs(5 * 60);

const VALID_SELECTOR_OPERATORS: [&str; 4] = ["In", "NotIn", "Exists", "DoesNotExist"];

/// Identifies a scalable resource inside a tenant namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Level, delay and timeout for one direction of scaling.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScaleInfo {
    pub level: Option<i32>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub initial_delay: Option<Duration>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout: Option<Duration>,
}

impl ScaleInfo {
    pub fn level(&self) -> i32 {
        self.level.unwrap_or(0)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay.unwrap_or(DEFAULT_SCALE_INITIAL_DELAY)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_SCALE_TIMEOUT)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DependentResourceInfo {
    #[serde(rename = "ref")]
    pub reference: Option<ResourceRef>,
    #[serde(default)]
    pub optional: bool,
    pub scale_up: Option<ScaleInfo>,
    pub scale_down: Option<ScaleInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProberConfig {
    pub internal_kubeconfig_secret_name: Option<String>,
    pub external_kubeconfig_secret_name: Option<String>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub probe_interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub initial_delay: Option<Duration>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub probe_timeout: Option<Duration>,
    pub success_threshold: Option<u32>,
    pub failure_threshold: Option<u32>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub internal_probe_failure_backoff_duration: Option<Duration>,
    pub backoff_jitter_factor: Option<f64>,
    #[serde(default)]
    pub dependent_resource_infos: Vec<DependentResourceInfo>,
}

impl ProberConfig {
    pub fn internal_kubeconfig_secret_name(&self) -> &str {
        self.internal_kubeconfig_secret_name.as_deref().unwrap_or_default()
    }

    pub fn external_kubeconfig_secret_name(&self) -> &str {
        self.external_kubeconfig_secret_name.as_deref().unwrap_or_default()
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval.unwrap_or(DEFAULT_PROBE_INTERVAL)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY)
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn internal_probe_failure_backoff_duration(&self) -> Duration {
        self.internal_probe_failure_backoff_duration
            .unwrap_or(DEFAULT_INTERNAL_PROBE_FAILURE_BACKOFF)
    }

    pub fn backoff_jitter_factor(&self) -> f64 {
        self.backoff_jitter_factor.unwrap_or(DEFAULT_BACKOFF_JITTER_FACTOR)
    }

    fn validate(&self) -> ConfigIssues {
        let mut issues = ConfigIssues::default();
        if self.internal_kubeconfig_secret_name().is_empty() {
            issues.push("internalKubeconfigSecretName is required");
        }
        if self.external_kubeconfig_secret_name().is_empty() {
            issues.push("externalKubeconfigSecretName is required");
        }
        for (field, duration) in [
            ("probeInterval", self.probe_interval),
            ("initialDelay", self.initial_delay),
            ("probeTimeout", self.probe_timeout),
            (
                "internalProbeFailureBackoffDuration",
                self.internal_probe_failure_backoff_duration,
            ),
        ] {
            if duration == Some(Duration::ZERO) {
                issues.push(format!("{field} must be greater than zero"));
            }
        }
        for (field, threshold) in [
            ("successThreshold", self.success_threshold),
            ("failureThreshold", self.failure_threshold),
        ] {
            if threshold == Some(0) {
                issues.push(format!("{field} must be at least 1"));
            }
        }
        if let Some(factor) = self.backoff_jitter_factor {
            if factor <= 0.0 || factor >= 1.0 {
                issues.push("backoffJitterFactor must lie strictly between 0 and 1");
            }
        }
        if self.dependent_resource_infos.is_empty() {
            issues.push("dependentResourceInfos must name at least one resource");
        }
        for (i, info) in self.dependent_resource_infos.iter().enumerate() {
            let at = format!("dependentResourceInfos[{i}]");
            match &info.reference {
                None => issues.push(format!("{at}.ref is required")),
                Some(reference) => {
                    if reference.api_version.is_empty() {
                        issues.push(format!("{at}.ref.apiVersion must not be empty"));
                    }
                    if reference.kind.is_empty() {
                        issues.push(format!("{at}.ref.kind must not be empty"));
                    }
                    if reference.name.is_empty() {
                        issues.push(format!("{at}.ref.name must not be empty"));
                    }
                }
            }
            for (direction, scale) in [("scaleUp", &info.scale_up), ("scaleDown", &info.scale_down)] {
                match scale {
                    None => issues.push(format!("{at}.{direction} is required")),
                    Some(scale) => {
                        match scale.level {
                            None => issues.push(format!("{at}.{direction}.level is required")),
                            Some(level) if level < 0 => {
                                issues.push(format!("{at}.{direction}.level must not be negative"));
                            }
                            Some(_) => {}
                        }
                        for (field, duration) in
                            [("initialDelay", scale.initial_delay), ("timeout", scale.timeout)]
                        {
                            if duration == Some(Duration::ZERO) {
                                issues.push(format!(
                                    "{at}.{direction}.{field} must be greater than zero"
                                ));
                            }
                        }
                    }
                }
            }
        }
        issues
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DependantSelectors {
    #[serde(default)]
    pub pod_selectors: Vec<LabelSelector>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WeederConfig {
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub watch_duration: Option<Duration>,
    #[serde(default)]
    pub services_and_dependant_selectors: BTreeMap<String, DependantSelectors>,
}

impl WeederConfig {
    pub fn watch_duration(&self) -> Duration {
        self.watch_duration.unwrap_or(DEFAULT_WATCH_DURATION)
    }

    fn validate(&self) -> ConfigIssues {
        let mut issues = ConfigIssues::default();
        if self.watch_duration == Some(Duration::ZERO) {
            issues.push("watchDuration must be greater than zero");
        }
        if self.services_and_dependant_selectors.is_empty() {
            issues.push("servicesAndDependantSelectors must contain at least one service");
        }
        for (service, selectors) in &self.services_and_dependant_selectors {
            if selectors.pod_selectors.is_empty() {
                issues.push(format!("service {service:?} must declare at least one pod selector"));
                continue;
            }
            for (i, selector) in selectors.pod_selectors.iter().enumerate() {
                let at = format!("service {service:?} podSelectors[{i}]");
                let expressions = selector.match_expressions.as_deref().unwrap_or_default();
                if expressions.is_empty() {
                    issues.push(format!("{at} must carry at least one match expression"));
                }
                for expression in expressions {
                    if expression.key.is_empty() {
                        issues.push(format!("{at} has a match expression with an empty key"));
                    }
                    let values = expression.values.as_deref().unwrap_or_default();
                    match expression.operator.as_str() {
                        "In" | "NotIn" => {
                            if values.is_empty() {
                                issues.push(format!(
                                    "{at} operator {} requires values",
                                    expression.operator
                                ));
                            }
                        }
                        "Exists" | "DoesNotExist" => {
                            if !values.is_empty() {
                                issues.push(format!(
                                    "{at} operator {} must not carry values",
                                    expression.operator
                                ));
                            }
                        }
                        other => {
                            issues.push(format!(
                                "{at} has unsupported operator {other:?} (expected one of {})",
                                VALID_SELECTOR_OPERATORS.join(", ")
                            ));
                        }
                    }
                }
            }
        }
        issues
    }
}

pub fn load_prober_config(path: &Path) -> Result<ProberConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", path.display())))?;
    parse_prober_config(&raw)
}

pub fn parse_prober_config(raw: &str) -> Result<ProberConfig> {
    let config: ProberConfig = serde_yaml::from_str(raw).map_err(Error::YamlError)?;
    let issues = config.validate();
    if !issues.is_empty() {
        return Err(Error::Validation(issues));
    }
    Ok(config)
}

pub fn load_weeder_config(path: &Path) -> Result<WeederConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", path.display())))?;
    parse_weeder_config(&raw)
}

pub fn parse_weeder_config(raw: &str) -> Result<WeederConfig> {
    let config: WeederConfig = serde_yaml::from_str(raw).map_err(Error::YamlError)?;
    let issues = config.validate();
    if !issues.is_empty() {
        return Err(Error::Validation(issues));
    }
    Ok(config)
}
