//! Reconciliation of `EksCluster` resources against AWS.

/// aws-auth ConfigMap synthesis and workload-cluster apply
pub mod awsauth;

/// Cloud client trait and AWS SDK implementation
pub mod client;

/// Connection secret publication
pub mod connection;

/// Reconciler dispatch, persistence and controller runtime wiring
pub mod controller;

/// Create / sync / delete phase handlers
pub mod phases;

/// Condition algebra over the resource status
pub mod status;

/// Custom resource types
pub mod types;
