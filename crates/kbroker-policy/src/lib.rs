//! # kbroker-policy - Rego Policy Decisions
//!
//! Authorization for kbroker is written as a Rego module by the operator.
//! Given the claims of a verified token, the policy answers two questions:
//!
//! - may this caller be issued a nonce (`grant`)
//! - which principals may it obtain keytabs for (`principals`)
//!
//! [`PolicyDecisionPoint`] prepares the module once and renders a fresh
//! [`PolicyDecision`] per request.

pub mod decision;
pub mod engine;
pub mod error;

pub use decision::PolicyDecision;
pub use engine::{PolicyDecisionPoint, QueryBindings};
pub use error::{PolicyError, PolicyResult};
