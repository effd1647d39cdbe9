//! Capture store capability boundary
//!
//! The proxy, replay engine and control-plane API only see this trait, so
//! alternate backends (the in-memory store in tests) can be substituted for
//! PostgreSQL without touching the engine.

use async_trait::async_trait;

use super::models::{CapturedPair, CapturedRequest, CapturedResponse};
use crate::error::StoreError;

#[async_trait]
pub trait CaptureStore: Send + Sync {
    /// Insert a request row and assign its identity
    async fn insert_request(&self, request: &mut CapturedRequest) -> Result<(), StoreError>;

    /// Insert a response row and assign its identity
    ///
    /// Header values that fail strict serialization are stored in a degraded
    /// representation; the insert itself must not fail because of them.
    async fn insert_response(&self, response: &mut CapturedResponse) -> Result<(), StoreError>;

    /// Fetch a request by id
    async fn request_by_id(&self, id: i64) -> Result<CapturedRequest, StoreError>;

    /// Fetch a request joined with its response; NotFound when either side is missing
    async fn pair_by_id(&self, id: i64) -> Result<CapturedPair, StoreError>;

    /// All complete pairs, ordered by request id
    async fn all_pairs(&self) -> Result<Vec<CapturedPair>, StoreError>;
}

/// Persist a request and its response as one joined pair
///
/// The response's `request_id` is filled from the freshly assigned request
/// identity before it is inserted.
pub async fn capture_pair(
    store: &dyn CaptureStore,
    mut request: CapturedRequest,
    mut response: CapturedResponse,
) -> Result<CapturedPair, StoreError> {
    store.insert_request(&mut request).await?;
    response.request_id = request.id;
    store.insert_response(&mut response).await?;
    Ok(CapturedPair { request, response })
}
