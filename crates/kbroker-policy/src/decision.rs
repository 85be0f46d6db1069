//! Policy decisions

use serde::Serialize;
use std::collections::BTreeSet;

/// Outcome of one policy evaluation
///
/// Recomputed for every request and never cached: the rules may depend on
/// claims that change from token to token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    /// Whether the caller may be issued a nonce
    pub grant_nonce: bool,
    /// Principals the caller may obtain keytabs for
    pub authorized_principals: BTreeSet<String>,
}

impl PolicyDecision {
    /// Whether `principal` is authorized, compared verbatim
    pub fn has_principal(&self, principal: &str) -> bool {
        !principal.is_empty() && self.authorized_principals.contains(principal)
    }
}
