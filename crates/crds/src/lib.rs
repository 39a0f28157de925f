//! Multi-DC CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the multi-DC cluster controller:
//! - `DatabaseCluster`: desired multi-region topology (control plane)
//! - `Datacenter`: one regional database instance (data plane)
//! - `RebuildTask`: data streaming into a newly joined datacenter (data plane)

pub mod database_cluster;
pub mod datacenter;
pub mod labels;
pub mod rebuild_task;

pub use database_cluster::*;
pub use datacenter::*;
pub use labels::*;
pub use rebuild_task::*;
