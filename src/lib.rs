//! Lattice node lifecycle - joins and removes Kubernetes workers as an EC2
//! Auto Scaling group scales
//!
//! The controller receives one lifecycle notification per invocation. A
//! launching instance is waited on, then joined with a kubeadm token issued
//! on the control node. A terminating instance's node is cordoned, drained
//! and deleted through kubectl on the control node. Every remote command runs
//! in its own SSH session with a freshly fetched key.
//!
//! # Modules
//!
//! - [`event`] - Notification parsing and transition classification
//! - [`controller`] - Dispatcher and the join/removal coordinators
//! - [`readiness`] - Bounded wait for launched instances
//! - [`naming`] - Node identity derivation
//! - [`kubeadm`] - kubeadm and kubectl command lines
//! - [`remote`] - SSH command execution
//! - [`secrets`] - SSH key retrieval
//! - [`fleet`] - EC2 and Auto Scaling API access
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod fleet;
pub mod kubeadm;
pub mod naming;
pub mod readiness;
pub mod remote;
pub mod secrets;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
