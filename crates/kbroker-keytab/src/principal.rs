//! Kerberos principal names
//!
//! Principals take the form `localpart@REALM`. The local part follows the
//! permissive email local-part grammar, which also admits service
//! principals such as `HTTP/web01.example.com@EXAMPLE.COM`; the realm is a
//! dotted sequence of DNS-style labels.

use crate::error::PrincipalError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shortest accepted principal (`a@B` is three characters)
pub const MIN_PRINCIPAL_LEN: usize = 3;

/// Longest accepted principal
pub const MAX_PRINCIPAL_LEN: usize = 254;

static PRINCIPAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("principal pattern is valid")
});

/// Check a principal name without allocating
pub fn validate_principal(name: &str) -> Result<(), PrincipalError> {
    if name.is_empty() {
        return Err(PrincipalError::Empty);
    }
    let len = name.chars().count();
    if !(MIN_PRINCIPAL_LEN..=MAX_PRINCIPAL_LEN).contains(&len) {
        return Err(PrincipalError::Length(len));
    }
    if !PRINCIPAL_RE.is_match(name) {
        return Err(PrincipalError::Format(name.to_string()));
    }
    Ok(())
}

/// A validated principal name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Principal(String);

impl Principal {
    /// Validate and wrap a principal name
    pub fn new(name: impl Into<String>) -> Result<Self, PrincipalError> {
        let name = name.into();
        validate_principal(&name)?;
        Ok(Self(name))
    }

    /// The principal as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Principal {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Principal {
    type Err = PrincipalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Principal {
    type Error = PrincipalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.0
    }
}
