//! Fetch functions attached to cache entries.

use async_trait::async_trait;
use fieldsync_core::{CacheKey, RequestError};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::fmt;

/// Loads the authoritative value of one cache entry over the request path.
///
/// A fetcher is registered with an entry when a collaborator observes it and
/// is re-executed whenever the entry is refetched.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, RequestError>;
}

/// Adapter turning a closure into a [`QueryFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F>
where
    F: Fn(CacheKey) -> BoxFuture<'static, Result<Value, RequestError>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnFetcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFetcher").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> QueryFetcher for FnFetcher<F>
where
    F: Fn(CacheKey) -> BoxFuture<'static, Result<Value, RequestError>> + Send + Sync,
{
    async fn fetch(&self, key: &CacheKey) -> Result<Value, RequestError> {
        (self.f)(key.clone()).await
    }
}
