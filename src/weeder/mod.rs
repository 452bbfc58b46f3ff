//! Crash-loop weeding: when a core service's endpoint comes back, the pods
//! that crash-looped while it was gone are deleted so their controllers
//! replace them promptly instead of sitting out the back-off.

pub mod controller;
pub mod manager;
pub mod watcher;
#[allow(clippy::module_inception)]
pub mod weeder;

pub use manager::{WeederInfo, WeederManager};
pub use watcher::{is_deletion_candidate, PodWatcher};
pub use weeder::Weeder;
