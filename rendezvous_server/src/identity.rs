//! Identity issuing
//!
//! Every registration receives a fresh random identity. Identities carry no
//! meaning of their own; they are only used as addressing keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identity assigned to a client at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub Uuid);

impl Identity {
    /// Issue a new identity backed by a random (v4) UUID.
    ///
    /// 122 random bits make a collision within one process run practically
    /// impossible, so the registry never needs to retry.
    pub fn issue() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for Identity {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for Identity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}
