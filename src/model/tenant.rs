//! Tenant scoping primitive.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The top-level isolation boundary. Every row and every lock key is scoped
/// by a tenant; this newtype keeps that scoping visible at the type level
/// instead of passing bare `String`s around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tenant(String);

impl Tenant {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Tenant {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Tenant {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
