//! Rego policy decision point
//!
//! The rule module and query are checked once by [`PolicyDecisionPoint::build`].
//! Each [`PolicyDecisionPoint::render_decision`] evaluates a private copy of
//! the prepared engine with the token claims as `input`, so evaluations never
//! share mutable state.
//!
//! The query must bind two variables: a boolean grant signal and a
//! collection of principal names. A policy that produces no result, or
//! bindings of the wrong type, fails closed with
//! [`PolicyError::Evaluation`].
//!
//! # Example
//!
//! ```rust
//! use kbroker_policy::PolicyDecisionPoint;
//! use serde_json::json;
//!
//! let script = r#"
//! package kbroker
//!
//! import rego.v1
//!
//! default grant := false
//!
//! grant if input.iss == "https://issuer.example/"
//!
//! principals contains p if {
//!     grant
//!     some p in split(input.keytab, ",")
//! }
//! "#;
//!
//! let pdp = PolicyDecisionPoint::build(script, PolicyDecisionPoint::DEFAULT_QUERY)?;
//! let decision = pdp.render_decision(&json!({
//!     "iss": "https://issuer.example/",
//!     "keytab": "alice@EX.COM,bob@EX.COM",
//! }))?;
//!
//! assert!(decision.grant_nonce);
//! assert!(decision.has_principal("bob@EX.COM"));
//! # Ok::<(), kbroker_policy::PolicyError>(())
//! ```

use crate::decision::PolicyDecision;
use crate::error::{PolicyError, PolicyResult};
use parking_lot::Mutex;
use regorus::Engine;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{Span, debug, warn};

/// Names of the two variables the query binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBindings {
    /// Boolean: may a nonce be issued
    pub grant: String,
    /// Collection of strings: authorized principals
    pub principals: String,
}

impl Default for QueryBindings {
    fn default() -> Self {
        Self {
            grant: "grant".to_string(),
            principals: "principals".to_string(),
        }
    }
}

/// Prepared policy, ready to render decisions
pub struct PolicyDecisionPoint {
    engine: Mutex<Engine>,
    query: String,
    bindings: QueryBindings,
    span: Span,
}

impl fmt::Debug for PolicyDecisionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyDecisionPoint")
            .field("query", &self.query)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

impl PolicyDecisionPoint {
    /// Query binding `grant` and `principals` from `package kbroker`
    pub const DEFAULT_QUERY: &'static str =
        "grant = data.kbroker.grant; principals = data.kbroker.principals";

    const POLICY_PATH: &'static str = "kbroker.rego";

    /// Prepare a policy whose query binds `grant` and `principals`
    ///
    /// # Errors
    ///
    /// [`PolicyError::Compile`] when the script or query is empty or does not
    /// parse.
    pub fn build(script: &str, query: &str) -> PolicyResult<Self> {
        Self::build_with_bindings(script, query, QueryBindings::default())
    }

    /// Prepare a policy whose query binds custom variable names
    pub fn build_with_bindings(
        script: &str,
        query: &str,
        bindings: QueryBindings,
    ) -> PolicyResult<Self> {
        if script.trim().is_empty() {
            return Err(PolicyError::Compile("empty policy script".to_string()));
        }
        if query.trim().is_empty() {
            return Err(PolicyError::Compile("empty policy query".to_string()));
        }
        if bindings.grant.is_empty() || bindings.principals.is_empty() {
            return Err(PolicyError::Compile("empty binding name".to_string()));
        }

        let mut engine = Engine::new();
        engine
            .add_policy(Self::POLICY_PATH.to_string(), script.to_string())
            .map_err(|e| PolicyError::Compile(e.to_string()))?;

        // Surface query syntax errors now rather than on the first request
        let mut trial = engine.clone();
        trial.set_input(regorus::Value::new_object());
        trial
            .eval_query(query.to_string(), false)
            .map_err(|e| PolicyError::Compile(format!("query: {e}")))?;

        let span = tracing::info_span!("policy_decision_point");
        debug!(parent: &span, query, "policy prepared");

        Ok(Self {
            engine: Mutex::new(engine),
            query: query.to_string(),
            bindings,
            span,
        })
    }

    /// Log under the given span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Evaluate the policy against `input`, normally the token claims
    ///
    /// # Errors
    ///
    /// [`PolicyError::Evaluation`] when evaluation fails, yields no result,
    /// or binds values of the wrong type.
    pub fn render_decision(&self, input: &Value) -> PolicyResult<PolicyDecision> {
        let input_json =
            serde_json::to_string(input).map_err(|e| PolicyError::Evaluation(e.to_string()))?;
        let input = regorus::Value::from_json_str(&input_json)
            .map_err(|e| PolicyError::Evaluation(format!("input: {e}")))?;

        let mut engine = self.engine.lock().clone();
        engine.set_input(input);
        let results = engine
            .eval_query(self.query.clone(), false)
            .map_err(|e| PolicyError::Evaluation(e.to_string()))?;

        let mut results = results.result.into_iter();
        let Some(first) = results.next() else {
            return Err(PolicyError::Evaluation("query produced no results".to_string()));
        };
        if results.next().is_some() {
            warn!(parent: &self.span, "query produced several results, using the first");
        }

        let bindings_json = first
            .bindings
            .to_json_str()
            .map_err(|e| PolicyError::Evaluation(format!("bindings: {e}")))?;
        let bindings: Value = serde_json::from_str(&bindings_json)
            .map_err(|e| PolicyError::Evaluation(format!("bindings: {e}")))?;

        let decision = self.decision_from(&bindings)?;
        debug!(
            parent: &self.span,
            grant = decision.grant_nonce,
            principals = decision.authorized_principals.len(),
            "policy decision rendered"
        );
        Ok(decision)
    }

    fn decision_from(&self, bindings: &Value) -> PolicyResult<PolicyDecision> {
        let grant_nonce = match bindings.get(&self.bindings.grant) {
            Some(Value::Bool(grant)) => *grant,
            Some(other) => {
                return Err(PolicyError::Evaluation(format!(
                    "binding '{}' must be a boolean, got {}",
                    self.bindings.grant,
                    type_name(other)
                )));
            }
            None => {
                return Err(PolicyError::Evaluation(format!(
                    "binding '{}' missing",
                    self.bindings.grant
                )));
            }
        };

        // Sets come back from the evaluator as JSON arrays
        let authorized_principals = match bindings.get(&self.bindings.principals) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(p) => Ok(p.clone()),
                    other => Err(PolicyError::Evaluation(format!(
                        "binding '{}' must contain strings, got {}",
                        self.bindings.principals,
                        type_name(other)
                    ))),
                })
                .collect::<PolicyResult<BTreeSet<_>>>()?,
            Some(other) => {
                return Err(PolicyError::Evaluation(format!(
                    "binding '{}' must be a collection, got {}",
                    self.bindings.principals,
                    type_name(other)
                )));
            }
            None => {
                return Err(PolicyError::Evaluation(format!(
                    "binding '{}' missing",
                    self.bindings.principals
                )));
            }
        };

        Ok(PolicyDecision {
            grant_nonce,
            authorized_principals,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pdp() -> PolicyDecisionPoint {
        PolicyDecisionPoint::build(
            "package kbroker\n\nimport rego.v1\n\ndefault grant := false\n\nprincipals := []\n",
            PolicyDecisionPoint::DEFAULT_QUERY,
        )
        .unwrap()
    }

    #[test]
    fn test_decision_from_bindings() {
        let decision = pdp()
            .decision_from(&json!({"grant": true, "principals": ["b@X", "a@X", "a@X"]}))
            .unwrap();
        assert!(decision.grant_nonce);
        assert_eq!(
            decision.authorized_principals.into_iter().collect::<Vec<_>>(),
            vec!["a@X".to_string(), "b@X".to_string()]
        );
    }

    #[test]
    fn test_wrong_binding_types() {
        let pdp = pdp();
        for bindings in [
            json!({"grant": "yes", "principals": []}),
            json!({"grant": true, "principals": "a@X"}),
            json!({"grant": true, "principals": [1, 2]}),
            json!({"principals": []}),
            json!({"grant": false}),
        ] {
            assert!(
                matches!(pdp.decision_from(&bindings), Err(PolicyError::Evaluation(_))),
                "{bindings} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_inputs_do_not_build() {
        assert!(matches!(
            PolicyDecisionPoint::build("", "x = 1"),
            Err(PolicyError::Compile(_))
        ));
        assert!(matches!(
            PolicyDecisionPoint::build("package kbroker", "  "),
            Err(PolicyError::Compile(_))
        ));
    }
}
