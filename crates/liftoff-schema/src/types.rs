//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a project. Every record lives under exactly one project.
    ProjectName
);

string_newtype!(
    /// Name of an environment within a project.
    EnvName
);

string_newtype!(
    /// Credential proving current exclusive ownership of a lock key.
    LockToken
);

impl LockToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Monotonic version token for one build/release of a service.
///
/// Deployment ids are millisecond timestamps rendered as decimal strings so
/// that they sort the same way numerically and lexically for realistic
/// clock values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId(u64);

impl DeploymentId {
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Next id after `previous`, derived from the wall clock.
    ///
    /// If the clock has not advanced past `previous` (skew, same millisecond)
    /// the result is `previous + 1`, so ids never go backwards.
    pub fn next(previous: Option<DeploymentId>) -> Self {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::next_at(now, previous)
    }

    pub fn next_at(now_ms: u64, previous: Option<DeploymentId>) -> Self {
        match previous {
            Some(prev) if prev.0 >= now_ms => Self(prev.0 + 1),
            _ => Self(now_ms),
        }
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse::<u64>()
            .map(Self)
            .map_err(|_| SchemaError::InvalidDeploymentId(value))
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.0.to_string()
    }
}

/// Validate a project, environment, resource, or service name.
///
/// Names become path segments in every backend (file tree, bucket object
/// names, API URLs), so the alphabet is deliberately narrow.
pub fn validate_name(what: &'static str, name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.len() > 63 {
        return Err(SchemaError::InvalidName {
            what,
            name: name.to_owned(),
            reason: "must be 1-63 characters",
        });
    }
    let bytes = name.as_bytes();
    if !(bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit()) {
        return Err(SchemaError::InvalidName {
            what,
            name: name.to_owned(),
            reason: "must start with a lowercase letter or digit",
        });
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-' || *b == b'_')
    {
        return Err(SchemaError::InvalidName {
            what,
            name: name.to_owned(),
            reason: "must match [a-z0-9_-]",
        });
    }
    Ok(())
}
