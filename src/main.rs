/*!
tablesmith HTTP server

Serves the routes the browser client calls. Every handler resolves the
current session, turns its body into a `LogicalOperation` and hands it to the
engine; responses are the refreshed `Snapshot`.

```bash
tablesmith --host 127.0.0.1 --port 5000
curl -F "db=@chinook.db" http://localhost:5000/upload
curl http://localhost:5000/api/tables
curl -o out.db http://localhost:5000/api/download
```
*/

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tablesmith::{
    CreateTableRequest, DeleteRowRequest, DeleteTableRequest, Engine, EngineConfig, ErrorCode,
    InsertRowRequest, KeyPolicy, LogicalOperation, Snapshot, TablesmithError,
};

/// Name given to exported files.
const EXPORT_FILE_NAME: &str = "modified_database.db";

#[derive(Parser)]
#[command(name = "tablesmith")]
#[command(about = "Upload, browse and edit a SQLite database over HTTP")]
struct Cli {
    /// Host address to bind to
    #[arg(long, env = "TABLESMITH_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind to
    #[arg(long, env = "TABLESMITH_PORT", default_value = "5000")]
    port: u16,

    /// Directory for working copies
    #[arg(long, env = "TABLESMITH_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Maximum upload size in megabytes
    #[arg(long, env = "TABLESMITH_UPLOAD_LIMIT_MB", default_value = "50")]
    upload_limit_mb: usize,

    /// Session inactivity timeout in minutes
    #[arg(long, env = "TABLESMITH_SESSION_TIMEOUT_MINS", default_value = "30")]
    session_timeout_mins: u64,

    /// Session cleanup check interval in seconds
    #[arg(long, default_value = "60")]
    session_cleanup_interval: u64,

    /// How long a statement waits on a locked working copy, in milliseconds
    #[arg(long, env = "TABLESMITH_BUSY_TIMEOUT_MS", default_value = "5000")]
    busy_timeout_ms: u64,

    /// Enforce foreign key constraints on the working copy
    #[arg(long, env = "TABLESMITH_FOREIGN_KEYS")]
    foreign_keys: bool,

    /// Identity column policy for deletes: first_column or declared
    #[arg(long, env = "TABLESMITH_KEY_POLICY", default_value = "first_column")]
    key_policy: KeyPolicy,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            max_upload_bytes: self.upload_limit_mb * 1024 * 1024,
            session_idle_ttl: Duration::from_secs(self.session_timeout_mins * 60),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            enforce_foreign_keys: self.foreign_keys,
            key_policy: self.key_policy,
            ..EngineConfig::default()
        };
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir = dir.clone();
        }
        config
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

struct ApiError(TablesmithError);

impl From<TablesmithError> for ApiError {
    fn from(err: TablesmithError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::CorruptUpload | ErrorCode::InvalidOperation => StatusCode::BAD_REQUEST,
            ErrorCode::TableNotFound => StatusCode::NOT_FOUND,
            ErrorCode::NoActiveSession => StatusCode::CONFLICT,
            ErrorCode::StorageUnreadable => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Storage | ErrorCode::Io => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        let body = ErrorBody { error: self.0.to_string(), code: code.as_str() };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ColumnsResponse {
    columns: Vec<String>,
}

/// POST /upload - multipart field `db`
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Snapshot>> {
    let mut file_data = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| TablesmithError::CorruptUpload(e.to_string()))?
    {
        if field.name() == Some("db") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| TablesmithError::CorruptUpload(e.to_string()))?;
            file_data = Some(bytes);
        }
    }
    let file_data =
        file_data.ok_or_else(|| TablesmithError::CorruptUpload("no file provided".into()))?;

    let (_, snapshot) = state.engine.upload(&file_data).await?;
    Ok(Json(snapshot))
}

/// GET /api/tables
async fn tables_handler(State(state): State<AppState>) -> ApiResult<Json<Snapshot>> {
    let handle = state.engine.current_session().await?;
    Ok(Json(state.engine.snapshot(handle).await?))
}

/// GET /api/table-schema/:table
async fn table_schema_handler(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> ApiResult<Json<ColumnsResponse>> {
    let handle = state.engine.current_session().await?;
    let columns = state.engine.table_columns(handle, &table).await?;
    Ok(Json(ColumnsResponse { columns }))
}

async fn apply(state: &AppState, operation: LogicalOperation) -> ApiResult<Json<Snapshot>> {
    let handle = state.engine.current_session().await?;
    Ok(Json(state.engine.apply(handle, &operation).await?))
}

/// POST /api/create-table
async fn create_table_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateTableRequest>,
) -> ApiResult<Json<Snapshot>> {
    apply(&state, req.try_into()?).await
}

/// POST /api/insert-row
async fn insert_row_handler(
    State(state): State<AppState>,
    Json(req): Json<InsertRowRequest>,
) -> ApiResult<Json<Snapshot>> {
    apply(&state, req.try_into()?).await
}

/// POST /api/delete-row
async fn delete_row_handler(
    State(state): State<AppState>,
    Json(req): Json<DeleteRowRequest>,
) -> ApiResult<Json<Snapshot>> {
    apply(&state, req.try_into()?).await
}

/// POST /api/delete-table
async fn delete_table_handler(
    State(state): State<AppState>,
    Json(req): Json<DeleteTableRequest>,
) -> ApiResult<Json<Snapshot>> {
    apply(&state, req.try_into()?).await
}

/// GET /api/download
async fn download_handler(State(state): State<AppState>) -> ApiResult<Response> {
    let handle = state.engine.current_session().await?;
    let bytes = state.engine.export(handle).await?;
    let disposition = format!("attachment; filename=\"{EXPORT_FILE_NAME}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// Background task retiring idle sessions
async fn cleanup_idle_sessions(engine: Arc<Engine>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        if let Some(handle) = engine.expire_idle_session().await {
            info!(session = %handle, "idle session cleaned up");
        }
    }
}

fn router(state: AppState, upload_limit_bytes: usize) -> Router {
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/api/tables", get(tables_handler))
        .route("/api/table-schema/:table", get(table_schema_handler))
        .route("/api/create-table", post(create_table_handler))
        .route("/api/insert-row", post(insert_row_handler))
        .route("/api/delete-row", post(delete_row_handler))
        .route("/api/delete-table", post(delete_table_handler))
        .route("/api/download", get(download_handler))
        // multipart framing needs a little room above the file itself
        .layer(DefaultBodyLimit::max(upload_limit_bytes + 64 * 1024))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablesmith=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config();
    let upload_limit_bytes = config.max_upload_bytes;
    info!(scratch_dir = %config.scratch_dir.display(), "starting");

    let engine = Arc::new(Engine::new(config));
    tokio::spawn(cleanup_idle_sessions(Arc::clone(&engine), cli.session_cleanup_interval));

    let app = router(AppState { engine: Arc::clone(&engine) }, upload_limit_bytes);
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tower::util::ServiceExt;

    const LIMIT: usize = 1024 * 1024;

    fn create_test_app(dir: &tempfile::TempDir) -> Router {
        let config = EngineConfig::default().with_scratch_dir(dir.path());
        router(AppState { engine: Arc::new(Engine::new(config)) }, LIMIT)
    }

    async fn users_db(dir: &tempfile::TempDir) -> Vec<u8> {
        let path = dir.path().join("fixture.sqlite");
        let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
        for sql in [
            "CREATE TABLE users (id INTEGER, name TEXT)",
            "INSERT INTO users (id, name) VALUES (1, 'Ann'), (2, 'Bob')",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        pool.close().await;
        std::fs::read(&path).unwrap()
    }

    /// Helper to create a multipart body for file upload
    fn create_multipart_body(content: &[u8]) -> (String, Vec<u8>) {
        let boundary = "----TestBoundary1234567890";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"db\"; filename=\"users.db\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        (boundary.to_string(), body)
    }

    fn upload_request(content: &[u8]) -> Request<Body> {
        let (boundary, body) = create_multipart_body(content);
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header("Content-Type", format!("multipart/form-data; boundary={}", boundary))
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_requests_before_upload_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_test_app(&dir);

        let response = app.clone().oneshot(get_request("/api/tables")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["code"], "no_active_session");

        let response = app.oneshot(get_request("/api/download")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_upload_and_edit() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_test_app(&dir);
        let db = users_db(&dir).await;

        let response = app.clone().oneshot(upload_request(&db)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tables"], json!(["users"]));
        assert_eq!(json["data"]["users"][0], json!({"id": 1, "name": "Ann"}));

        let response = app
            .clone()
            .oneshot(json_request("/api/insert-row", json!({"table": "users", "row": {"id": 3, "name": "Eve"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["users"].as_array().unwrap().len(), 3);

        let response = app
            .clone()
            .oneshot(json_request("/api/delete-row", json!({"table": "users", "pk": "id", "value": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["users"][0]["name"], "Bob");

        let response = app.oneshot(get_request("/api/table-schema/users")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"columns": ["id", "name"]}));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_test_app(&dir);

        let response = app.clone().oneshot(upload_request(b"not a database")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "corrupt_upload");

        let db = users_db(&dir).await;
        let response = app.clone().oneshot(upload_request(&db)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request(
                "/api/create-table",
                json!({"name": "bad name;", "columns": [{"name": "a", "type": "TEXT"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_operation");

        let response = app.clone().oneshot(get_request("/api/table-schema/ghosts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "table_not_found");

        let response = app
            .oneshot(json_request("/api/delete-table", json!({"tableName": "ghosts"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_returns_the_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_test_app(&dir);
        let db = users_db(&dir).await;
        app.clone().oneshot(upload_request(&db)).await.unwrap();

        let response = app.oneshot(get_request("/api/download")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"modified_database.db\""
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.starts_with(tablesmith::SQLITE_HEADER));
    }

    #[test]
    fn test_cli_builds_the_whole_config() {
        let cli = Cli::try_parse_from([
            "tablesmith",
            "--scratch-dir",
            "/tmp/tablesmith-test",
            "--upload-limit-mb",
            "2",
            "--session-timeout-mins",
            "5",
            "--busy-timeout-ms",
            "250",
            "--foreign-keys",
            "--key-policy",
            "declared",
        ])
        .unwrap();
        let config = cli.engine_config();
        assert_eq!(config.scratch_dir, PathBuf::from("/tmp/tablesmith-test"));
        assert_eq!(config.max_upload_bytes, 2 * 1024 * 1024);
        assert_eq!(config.session_idle_ttl, Duration::from_secs(300));
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert!(config.enforce_foreign_keys);
        assert_eq!(config.key_policy, KeyPolicy::DeclaredOnly);

        assert!(Cli::try_parse_from(["tablesmith", "--key-policy", "random"]).is_err());
    }
}
