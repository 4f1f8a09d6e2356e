//! Remote fetch collaborator: the trait workers and scans call through, the normalized
//! response and failure types, and the `reqwest`-backed implementation.

mod error_mapping;
pub mod http;
pub mod retry;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::EntityId;

pub use http::{global_rate_limiter, GlobalRateLimiter, HttpFetcher, DEFAULT_GLOBAL_RPS};
pub use retry::{RetryPolicy, RetryTerminal};

/// One upstream record together with the entity ids that appear in it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub key: i64,
    pub participants: Vec<EntityId>,
    pub payload: serde_json::Value,
}

impl RemoteItem {
    pub fn involves(&self, entity_id: EntityId) -> bool {
        self.participants.contains(&entity_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    Found(RemoteItem),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    RateLimited,
    UpstreamUnavailable,
    Unauthorized,
    MalformedResponse,
    Other,
}

/// Normalized transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Only transient transport trouble is worth an immediate retry. A rate-limit
    /// rejection is handed back to the governor instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Network | FetchErrorKind::UpstreamUnavailable
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == FetchErrorKind::RateLimited
    }
}

/// Fetches one item of an endpoint category by key.
pub trait RemoteFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        category: &'a str,
        key: i64,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchError>>;
}

impl<T> RemoteFetcher for Arc<T>
where
    T: RemoteFetcher + ?Sized,
{
    fn fetch<'a>(
        &'a self,
        category: &'a str,
        key: i64,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
        (**self).fetch(category, key)
    }
}
