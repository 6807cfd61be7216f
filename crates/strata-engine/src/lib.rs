//! strata-engine — the seams between the control plane and the world.
//!
//! Two external collaborators are modeled as traits:
//!
//! - [`ExecutionSubstrate`] — the runtime that actually provisions, starts,
//!   stops, and destroys database processes and reports raw resource
//!   counters. Handles are opaque to the control plane.
//! - [`EngineTemplateProvider`] — a pure function from `(engine type,
//!   resource spec)` to ready-to-apply config artifacts and an init script.
//!
//! Both come with fully deterministic fake implementations used by tests
//! and by `stratad` standalone mode.

pub mod substrate;
pub mod template;

pub use substrate::{
    EndpointProber, ExecutionSubstrate, FakeSubstrate, ProbeOutcome, ProvisionSpec,
    SubstrateError, SubstrateHandle, SubstrateResult,
};
pub use template::{
    ConfigArtifact, EngineTemplate, EngineTemplateProvider, StaticTemplateProvider,
    TemplateError, TemplateResult,
};
