//! PostgreSQL capture store
//!
//! Connection pooling via deadpool; each trait call is a single transactional
//! statement. Headers and params are stored as JSON text so the schema stays
//! the flat `requests`/`responses` shape joined on `responses.request_id`.

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::info;

use super::models::{CapturedPair, CapturedRequest, CapturedResponse, FieldMap, RawHeaders};
use super::store::CaptureStore;
use crate::config::DatabaseConfig;
use crate::error::StoreError;

const PAIR_COLUMNS: &str = "r.id, r.method, r.scheme, r.host, r.path, r.headers, r.body, r.params, \
     rp.id, rp.request_id, rp.code, rp.message, rp.headers, rp.body";

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Connect, verify the connection and ensure the schema exists
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut pg_config = PoolConfig::new();
        pg_config.url = Some(config.url.clone());
        pg_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pg_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(pool_size = config.pool_size, "capture store connected");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let client = self.client().await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS requests (\
                     id BIGSERIAL PRIMARY KEY,\
                     method TEXT NOT NULL,\
                     scheme TEXT NOT NULL,\
                     host TEXT NOT NULL,\
                     path TEXT NOT NULL,\
                     headers TEXT NOT NULL,\
                     body TEXT NOT NULL,\
                     params TEXT NOT NULL\
                 )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS responses (\
                     id BIGSERIAL PRIMARY KEY,\
                     request_id BIGINT NOT NULL REFERENCES requests(id),\
                     code INT NOT NULL,\
                     message TEXT NOT NULL,\
                     headers TEXT NOT NULL,\
                     body TEXT NOT NULL\
                 )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_responses_request_id \
                 ON responses(request_id)",
                &[],
            )
            .await?;

        Ok(())
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

fn decode_field_map(text: &str) -> FieldMap {
    serde_json::from_str(text).unwrap_or_default()
}

fn request_from_columns(row: &Row, offset: usize) -> CapturedRequest {
    let scheme: String = row.get(offset + 2);
    let headers: String = row.get(offset + 5);
    let params: String = row.get(offset + 7);

    CapturedRequest {
        id: row.get(offset),
        method: row.get(offset + 1),
        scheme: scheme.parse().unwrap_or(super::models::Scheme::Http),
        host: row.get(offset + 3),
        path: row.get(offset + 4),
        headers: decode_field_map(&headers),
        body: row.get(offset + 6),
        params: decode_field_map(&params),
    }
}

fn response_from_columns(row: &Row, offset: usize) -> CapturedResponse {
    let code: i32 = row.get(offset + 2);
    let headers: String = row.get(offset + 4);

    CapturedResponse {
        id: row.get(offset),
        request_id: row.get(offset + 1),
        code: code as u16,
        message: row.get(offset + 3),
        headers: RawHeaders::decode_stored(&headers),
        body: row.get(offset + 5),
    }
}

fn pair_from_row(row: &Row) -> CapturedPair {
    CapturedPair {
        request: request_from_columns(row, 0),
        response: response_from_columns(row, 8),
    }
}

#[async_trait]
impl CaptureStore for PostgresStore {
    async fn insert_request(&self, request: &mut CapturedRequest) -> Result<(), StoreError> {
        let headers = serde_json::to_string(&request.headers)?;
        let params = serde_json::to_string(&request.params)?;

        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO requests(method, scheme, host, path, headers, body, params) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 RETURNING id",
                &[
                    &request.method,
                    &request.scheme.as_str(),
                    &request.host,
                    &request.path,
                    &headers,
                    &request.body,
                    &params,
                ],
            )
            .await?;

        request.id = row.get(0);
        Ok(())
    }

    async fn insert_response(&self, response: &mut CapturedResponse) -> Result<(), StoreError> {
        // Degrades rather than fails when header values are not valid UTF-8.
        let headers = response.headers.encode_for_storage();

        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO responses(request_id, code, message, headers, body) \
                 VALUES ($1, $2, $3, $4, $5) \
                 RETURNING id",
                &[
                    &response.request_id,
                    &(response.code as i32),
                    &response.message,
                    &headers,
                    &response.body,
                ],
            )
            .await?;

        response.id = row.get(0);
        Ok(())
    }

    async fn request_by_id(&self, id: i64) -> Result<CapturedRequest, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, method, scheme, host, path, headers, body, params \
                 FROM requests WHERE id = $1",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound(id))?;

        Ok(request_from_columns(&row, 0))
    }

    async fn pair_by_id(&self, id: i64) -> Result<CapturedPair, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {PAIR_COLUMNS} FROM requests r \
                     JOIN responses rp ON r.id = rp.request_id \
                     WHERE r.id = $1"
                ),
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound(id))?;

        Ok(pair_from_row(&row))
    }

    async fn all_pairs(&self) -> Result<Vec<CapturedPair>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {PAIR_COLUMNS} FROM requests r \
                     JOIN responses rp ON r.id = rp.request_id \
                     ORDER BY r.id"
                ),
                &[],
            )
            .await?;

        Ok(rows.iter().map(pair_from_row).collect())
    }
}
