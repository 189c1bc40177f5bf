//! Postgres-backed storage for captured requests and responses.
//!
//! Queries use sqlx's runtime API (`sqlx::query`/`query_as`) rather than
//! the `query!` compile-time macros, since there is no database reachable
//! at build time to check against.

use crate::config::DbConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::model::{CapturedRequest, CapturedResponse, RequestRecord, ValueMap};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id SERIAL PRIMARY KEY,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    get_params JSONB NOT NULL,
    headers JSONB NOT NULL,
    cookies JSONB NOT NULL,
    post_params JSONB NOT NULL,
    raw TEXT NOT NULL,
    is_https BOOLEAN NOT NULL
);

CREATE TABLE IF NOT EXISTS responses (
    id SERIAL PRIMARY KEY,
    request_id INTEGER NOT NULL REFERENCES requests(id),
    code INTEGER NOT NULL,
    message TEXT NOT NULL,
    headers JSONB NOT NULL,
    body TEXT NOT NULL
);
"#;

/// Connect to Postgres and ensure the schema exists.
pub async fn connect(config: &DbConfig) -> ProxyResult<PgPool> {
    info!(host = %config.host, db = %config.db_name, "connecting to postgres");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.connect_string())
        .await?;

    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    Ok(pool)
}

/// Request/response capture storage, backed by a Postgres pool.
#[derive(Clone)]
pub struct CaptureStore {
    pool: PgPool,
}

impl CaptureStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a captured request, returning its assigned id.
    pub async fn insert_request(&self, req: &CapturedRequest) -> ProxyResult<i64> {
        let row = sqlx::query(
            "INSERT INTO requests(method, path, get_params, headers, cookies, post_params, raw, is_https) \
             VALUES($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
        )
        .bind(&req.method)
        .bind(&req.path)
        .bind(serde_json::to_value(&req.get_params).map_err(|e| ProxyError::Internal(e.to_string()))?)
        .bind(serde_json::to_value(&req.headers).map_err(|e| ProxyError::Internal(e.to_string()))?)
        .bind(serde_json::to_value(&req.cookies).map_err(|e| ProxyError::Internal(e.to_string()))?)
        .bind(serde_json::to_value(&req.post_params).map_err(|e| ProxyError::Internal(e.to_string()))?)
        .bind(&req.raw)
        .bind(req.is_https)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i32, _>("id")? as i64)
    }

    /// Insert a captured response, tied to the request it answers.
    pub async fn insert_response(&self, request_id: i64, resp: &CapturedResponse) -> ProxyResult<()> {
        let result = sqlx::query(
            "INSERT INTO responses(request_id, code, message, headers, body) VALUES($1, $2, $3, $4, $5)",
        )
        .bind(request_id as i32)
        .bind(resp.code as i32)
        .bind(&resp.message)
        .bind(serde_json::to_value(&resp.headers).map_err(|e| ProxyError::Internal(e.to_string()))?)
        .bind(&resp.body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(ProxyError::Internal("inserting response affected no rows".into()));
        }
        Ok(())
    }

    /// All captured requests, oldest first.
    pub async fn get_all_requests(&self) -> ProxyResult<Vec<RequestRecord>> {
        let rows = sqlx::query(
            "SELECT id, method, path, get_params, headers, cookies, post_params, raw, is_https \
             FROM requests ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// A single captured request by id, or `None` if it doesn't exist.
    pub async fn get_request_by_id(&self, id: i64) -> ProxyResult<Option<RequestRecord>> {
        let row = sqlx::query(
            "SELECT id, method, path, get_params, headers, cookies, post_params, raw, is_https \
             FROM requests WHERE id = $1",
        )
        .bind(id as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> ProxyResult<RequestRecord> {
    let get_params: serde_json::Value = row.try_get("get_params")?;
    let headers: serde_json::Value = row.try_get("headers")?;
    let cookies: serde_json::Value = row.try_get("cookies")?;
    let post_params: serde_json::Value = row.try_get("post_params")?;

    Ok(RequestRecord {
        id: row.try_get::<i32, _>("id")? as i64,
        request: CapturedRequest {
            method: row.try_get("method")?,
            path: row.try_get("path")?,
            get_params: serde_json::from_value::<ValueMap>(get_params)
                .map_err(|e| ProxyError::Internal(e.to_string()))?,
            headers: serde_json::from_value::<ValueMap>(headers)
                .map_err(|e| ProxyError::Internal(e.to_string()))?,
            cookies: serde_json::from_value(cookies).map_err(|e| ProxyError::Internal(e.to_string()))?,
            post_params: serde_json::from_value::<ValueMap>(post_params)
                .map_err(|e| ProxyError::Internal(e.to_string()))?,
            raw: row.try_get("raw")?,
            is_https: row.try_get("is_https")?,
        },
    })
}
