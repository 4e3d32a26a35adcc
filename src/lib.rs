//! A daemon that manages the full provision → install → destroy lifecycle
//! of Kubernetes clusters. Desired state comes in through the HTTP API, is
//! persisted in an embedded watchable store, and per-cluster controllers
//! reconcile each cluster toward it.

/// Persistent bucketed key-value store with watch notifications
pub mod store;

/// Cluster lifecycle controllers
pub mod controller;

/// HTTP control surface
pub mod api;

/// Cluster plan file handling
pub mod plan;

/// Infrastructure provisioning contracts and the terraform provisioner
pub mod provision;

/// Install-time operations and the ansible executor
pub mod install;

/// Errors, telemetry, and metrics
pub mod util;

pub use util::errors::{Error, Result};
