//! Store adapter (spec §4.2, §6 "Persisted schema").
//!
//! Grounded in `examples/original_source/internal/api/repository/requests/repository_request.go`:
//! same four operations, same JSON-column encoding of mapping-valued
//! fields, same two-table shape. Reimplemented against `sqlx`'s Postgres
//! driver (the pack's closest analogue to `pgx`) instead of hand-rolled
//! row scanning, and against `async_trait`-free native async trait methods
//! (stable since Rust 1.75).

use crate::canonical::{MultiMap, Request, Response};
use crate::error::StoreError;
use indexmap::IndexMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

#[derive(FromRow)]
struct RequestRow {
    id: i64,
    method: String,
    host: String,
    path: String,
    headers: Json<MultiMap>,
    query_params: Json<MultiMap>,
    post_params: Json<MultiMap>,
    cookies: Json<IndexMap<String, String>>,
    body: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<RequestRow> for Request {
    fn from(row: RequestRow) -> Self {
        Request {
            id: Some(row.id),
            method: row.method,
            // the schema does not persist scheme; every stored request was
            // observed as either the plain leg (http) or a rewritten MITM
            // leg target (https) — recoverable from whether `host` carries
            // a CONNECT-style authority is not reliable, so callers that
            // care (replay, scan) treat the host as authoritative and this
            // defaults to "http", matching `MakeRequest`'s own scheme choice.
            scheme: "http".to_string(),
            host: row.host,
            path: row.path,
            query_params: row.query_params.0,
            headers: row.headers.0,
            cookies: row.cookies.0,
            form_params: row.post_params.0,
            body: row.body,
            created_at: row.created_at,
        }
    }
}

/// The four store operations (spec §4.2), kept as a trait so the control
/// API and the proxy engine depend on a narrow contract rather than a
/// concrete `sqlx::PgPool`.
pub trait Store: Send + Sync {
    fn save_request(
        &self,
        request: &Request,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    fn save_response(
        &self,
        response: &Response,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    fn list_requests(&self) -> impl std::future::Future<Output = Result<Vec<Request>, StoreError>> + Send;

    fn get_request(&self, id: i64) -> impl std::future::Future<Output = Result<Request, StoreError>> + Send;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(connection_string: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(connection_string)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the two-table schema from spec §6. Idempotent; safe to call
    /// on every startup the way the original relies on a pre-provisioned
    /// database (this crate does not assume a migrations runner is wired
    /// up externally, so it owns `CREATE TABLE IF NOT EXISTS`).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request (
                id BIGSERIAL PRIMARY KEY,
                method TEXT NOT NULL,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                headers JSONB NOT NULL,
                query_params JSONB NOT NULL,
                post_params JSONB NOT NULL,
                cookies JSONB NOT NULL,
                body TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS response (
                id BIGSERIAL PRIMARY KEY,
                request_id BIGINT NOT NULL REFERENCES request(id),
                status_code INT NOT NULL,
                http_version TEXT NOT NULL DEFAULT 'HTTP/1.1',
                headers JSONB NOT NULL,
                body TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl Store for PgStore {
    async fn save_request(&self, request: &Request) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"INSERT INTO request (method, host, path, headers, query_params, post_params, cookies, body)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id"#,
        )
        .bind(&request.method)
        .bind(&request.host)
        .bind(&request.path)
        .bind(Json(&request.headers))
        .bind(Json(&request.query_params))
        .bind(Json(&request.form_params))
        .bind(Json(&request.cookies))
        .bind(&request.body)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn save_response(&self, response: &Response) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"INSERT INTO response (request_id, status_code, headers, body)
               VALUES ($1, $2, $3, $4) RETURNING id"#,
        )
        .bind(response.request_id)
        .bind(response.status_code as i32)
        .bind(Json(&response.headers))
        .bind(&response.body)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn list_requests(&self) -> Result<Vec<Request>, StoreError> {
        let rows: Vec<RequestRow> = sqlx::query_as(
            r#"SELECT id, method, host, path, headers, query_params, post_params, cookies, body, created_at
               FROM request ORDER BY created_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }

        Ok(rows.into_iter().map(Request::from).collect())
    }

    async fn get_request(&self, id: i64) -> Result<Request, StoreError> {
        let row: Option<RequestRow> = sqlx::query_as(
            r#"SELECT id, method, host, path, headers, query_params, post_params, cookies, body, created_at
               FROM request WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Request::from).ok_or(StoreError::NotFound)
    }
}
