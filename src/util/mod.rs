pub mod errors;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use errors::{Error, Result};
