//! In-memory capture store
//!
//! Mirrors the PostgreSQL store's observable semantics, including the header
//! serialization fallback, so tests exercise the same behavior the engine
//! sees in production.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::models::{CapturedPair, CapturedRequest, CapturedResponse, RawHeaders};
use super::store::CaptureStore;
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<Vec<CapturedRequest>>,
    responses: RwLock<Vec<CapturedResponse>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total row count across both tables
    pub fn row_count(&self) -> usize {
        self.requests.read().len() + self.responses.read().len()
    }
}

#[async_trait]
impl CaptureStore for MemoryStore {
    async fn insert_request(&self, request: &mut CapturedRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write();
        request.id = requests.len() as i64 + 1;
        requests.push(request.clone());
        Ok(())
    }

    async fn insert_response(&self, response: &mut CapturedResponse) -> Result<(), StoreError> {
        // Same encode/decode round trip the SQL store performs, so degraded
        // header rows look identical across backends.
        let stored = response.headers.encode_for_storage();

        let mut responses = self.responses.write();
        response.id = responses.len() as i64 + 1;

        let mut row = response.clone();
        row.headers = RawHeaders::decode_stored(&stored);
        responses.push(row);
        Ok(())
    }

    async fn request_by_id(&self, id: i64) -> Result<CapturedRequest, StoreError> {
        self.requests
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn pair_by_id(&self, id: i64) -> Result<CapturedPair, StoreError> {
        let request = self.request_by_id(id).await?;
        let response = self
            .responses
            .read()
            .iter()
            .find(|r| r.request_id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;

        Ok(CapturedPair { request, response })
    }

    async fn all_pairs(&self) -> Result<Vec<CapturedPair>, StoreError> {
        let requests = self.requests.read();
        let responses = self.responses.read();

        let mut pairs = Vec::new();
        for request in requests.iter() {
            if let Some(response) = responses.iter().find(|r| r.request_id == request.id) {
                pairs.push(CapturedPair {
                    request: request.clone(),
                    response: response.clone(),
                });
            }
        }
        Ok(pairs)
    }
}
