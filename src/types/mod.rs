//! Identifiers, values and errors shared by the storage contracts and the
//! query engine.

use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
mod value;

pub use error::{ErrorClass, PinError, Result};
pub use value::Value;

/// Persistent identity of a PIN.
///
/// Identities are totally ordered; the high bit marks a node owned by a
/// remote store.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PinId(pub u64);

impl PinId {
    /// High bit marking remote ownership.
    pub const REMOTE_BIT: u64 = 1 << 63;

    /// Builds an identity owned by a remote store.
    pub const fn remote(raw: u64) -> Self {
        PinId(raw | Self::REMOTE_BIT)
    }

    /// Returns true when the identity is owned by a remote store.
    pub const fn is_remote(self) -> bool {
        self.0 & Self::REMOTE_BIT != 0
    }
}

/// Property identifier resolved by the catalog.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PropId(pub u32);

/// Class (named family of PINs) identifier.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClassId(pub u32);

/// Cached storage address of a PIN body.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageAddr {
    /// Page number holding the body.
    pub page: u32,
    /// Slot within the page.
    pub slot: u16,
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_remote() {
            write!(f, "@{}", self.0 & !Self::REMOTE_BIT)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for PropId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.slot)
    }
}

impl From<u64> for PinId {
    fn from(value: u64) -> Self {
        PinId(value)
    }
}

impl From<u32> for PropId {
    fn from(value: u32) -> Self {
        PropId(value)
    }
}

impl From<u32> for ClassId {
    fn from(value: u32) -> Self {
        ClassId(value)
    }
}
