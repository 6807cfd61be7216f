//! strata-deployer — drives one deployment's provisioning pipeline.
//!
//! The deployer owns everything that touches the execution substrate:
//! the ten-stage deploy pipeline, replica scaling, and decommissioning.
//! Each pipeline stage is idempotent and individually retryable; a failed
//! or cancelled pipeline rolls back every resource it allocated.
//!
//! # Architecture
//!
//! ```text
//! Deployer
//!   ├── StateStore (deployment records, node inventory)
//!   ├── Registry (endpoint registration)
//!   ├── ExecutionSubstrate (provision / start / stop / destroy)
//!   ├── EngineTemplateProvider (config generation)
//!   └── EndpointProber (health validation stage)
//! ```

pub mod error;
pub mod pipeline;
pub mod placement;

pub use error::{DeployError, DeployResult};
pub use pipeline::{Deployer, DeployerConfig, Stage, TransitionCallback};
pub use placement::{rank_nodes, select_node};
