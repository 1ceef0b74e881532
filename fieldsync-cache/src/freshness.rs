//! Freshness contracts for cache reads.
//!
//! Reads never hand out a bare value: a [`CacheRead`] always carries the
//! entry's stale flag, so a collaborator cannot render cached data without
//! being told whether it is due for refetch.

use chrono::Utc;
use fieldsync_core::Timestamp;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::sequence::Sequence;

/// Staleness tolerance of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Return the last known value even while it is stale
    /// (stale-while-revalidate).
    #[default]
    AllowStale,

    /// Return the value only if it is not marked stale.
    Fresh,

    /// Return the value if it is not stale and was fetched within the bound.
    MaxAge(Duration),
}

impl Freshness {
    pub fn accepts(&self, is_stale: bool, fetched_at: Option<Timestamp>) -> bool {
        match self {
            Freshness::AllowStale => true,
            Freshness::Fresh => !is_stale,
            Freshness::MaxAge(max_age) => !is_stale && age_of(fetched_at) <= *max_age,
        }
    }
}

/// Result of a cache read, carrying freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    fetched_at: Option<Timestamp>,
    is_stale: bool,
    sequence: Sequence,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, fetched_at: Option<Timestamp>, is_stale: bool, sequence: Sequence) -> Self {
        Self {
            value,
            fetched_at,
            is_stale,
            sequence,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Whether the value may no longer reflect server truth.
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn is_fresh(&self) -> bool {
        !self.is_stale
    }

    /// When the value was last written, `None` if it was never fetched.
    pub fn fetched_at(&self) -> Option<Timestamp> {
        self.fetched_at
    }

    /// Time since the value was written.
    pub fn age(&self) -> Duration {
        age_of(self.fetched_at)
    }

    /// The write that produced this value.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            is_stale: self.is_stale,
            sequence: self.sequence,
        }
    }
}

impl CacheRead<serde_json::Value> {
    /// Decode the JSON value into a typed entity.
    pub fn decode<T: DeserializeOwned>(self) -> Result<CacheRead<T>, serde_json::Error> {
        let value = serde_json::from_value(self.value)?;
        Ok(CacheRead {
            value,
            fetched_at: self.fetched_at,
            is_stale: self.is_stale,
            sequence: self.sequence,
        })
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

fn age_of(fetched_at: Option<Timestamp>) -> Duration {
    match fetched_at {
        Some(at) => Utc::now()
            .signed_duration_since(at)
            .to_std()
            .unwrap_or(Duration::ZERO),
        None => Duration::MAX,
    }
}
