//! Strongly-typed identifiers.
//!
//! Ids that the engine itself mints (job store jobs, generated packages) are
//! ULIDs wrapped in `Id<T>`. The marker type only exists at compile time, so a
//! `JobId` can never be passed where a `PackageId` is expected.
//!
//! Queue entry ids are different: they are assigned by each backend and are
//! opaque strings, see [`crate::domain::EntryId`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait providing the display prefix of an id type.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    /// Accepts both the prefixed display form and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Package {}

impl IdMarker for Package {
    fn prefix() -> &'static str {
        "pkg-"
    }
}

/// Identifier of a job in the durable job store.
pub type JobId = Id<Job>;

/// Identifier of a package minted by a package builder.
pub type PackageId = Id<Package>;
