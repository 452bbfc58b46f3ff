//! Watchdog for a multi-tenant Kubernetes hosting platform.
//!
//! Two independent cores share a management-cluster client and a config:
//! the prober suspends a tenant's dependent controllers while the tenant API
//! server is unreachable from outside (meltdown protection), and the weeder
//! deletes crash-looping pods once the service they depend on is back.

/// Configuration schemas, defaults and validation
pub mod config;

/// Probers and their per-namespace lifecycle
pub mod prober;

/// Scale flows over the dependent resources of a tenant namespace
pub mod scale;

/// Errors, retry primitives, logging and metrics
pub mod util;

/// Weeders and their per-endpoint lifecycle
pub mod weeder;

pub use util::errors::{Error, Result};
