//! Multi-Context Kubernetes Client
//!
//! Addresses objects across several kubeconfig contexts: one control plane
//! holding `DatabaseCluster` objects and any number of data plane contexts
//! hosting the datacenters and their companion objects.
//!
//! # Example
//!
//! ```no_run
//! use context_client::{ClusterKey, ContextClientTrait, KubeContextClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeContextClient::connect(
//!     None,
//!     Some("control"),
//!     &["us-east".to_string(), "eu-west".to_string()],
//! )
//! .await?;
//!
//! let key = ClusterKey::new("us-east", "databases", "dc1");
//! let datacenter = client.get_datacenter(&key).await?;
//! println!("ready: {:?}", datacenter.ready_status());
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Typed per-kind operations**: get/create/patch/delete for every kind the controller owns
//! - **Error classification**: NotFound vs. transient failures, per context
//! - **test-util**: in-memory `MockContextClient` with failure injection and a write journal

pub mod client;
pub mod error;
pub mod key;
mod patch;
#[path = "trait.rs"]
pub mod context_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{IN_CLUSTER_CONTEXT, KubeContextClient};
pub use context_trait::ContextClientTrait;
pub use error::ContextError;
pub use key::{ClusterKey, ObjectKind};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockContextClient, RecordedWrite, WriteOp};
