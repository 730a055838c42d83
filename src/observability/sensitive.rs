// SPDX-License-Identifier: Apache-2.0

//! Redaction wrapper for values that must never reach a log line or a
//! serialized diagnostic, most importantly connection strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Debug, Display, Formatter};

/// A wrapper that redacts its contents in `Debug`, `Display`, and `Serialize`.
/// Call `.expose()` at the single point where the real value is required
/// (driver connect).
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the wrapped value. Keep the call sites few and obvious.
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl Sensitive<String> {
    /// A loggable hint: the scheme (or leading token) of the wrapped string
    /// with everything after it dropped. `postgres://…` stays attributable
    /// without leaking credentials embedded in the URL.
    pub fn scheme_hint(&self) -> String {
        match self.0.split_once("://") {
            Some((scheme, _)) => format!("{}://[REDACTED]", scheme),
            None => "[REDACTED]".to_string(),
        }
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> Debug for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> Display for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Serialize> Serialize for Sensitive<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("***")
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Sensitive)
    }
}
