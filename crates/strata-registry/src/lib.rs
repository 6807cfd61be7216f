//! strata-registry — service discovery and routing for deployments.
//!
//! Tracks routable endpoints per deployment, selects backends via a
//! per-deployment load-balancing strategy, resolves tenants to concrete
//! connection descriptors, and excludes failing endpoints through a
//! circuit-breaker discipline with half-open recovery probes.
//!
//! The read path (routing) takes a shared lock only; health updates take
//! the exclusive lock for a bounded critical section.

pub mod breaker;
pub mod registry;
pub mod strategy;

pub use breaker::{BreakerConfig, CircuitBreaker, Routability};
pub use registry::{ConnectionTarget, EndpointHealth, Registry, RegistrySnapshotEntry, RouteLease};
pub use strategy::RoutingStrategy;
