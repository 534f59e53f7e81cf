use crate::semantic::{
    Document, ErrorCause, FailureResponse, IngestResponse, RetrievalError, RetrievalService,
    SearchResponse, StatusResponse,
};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use tokio::signal;

/// Hits returned when a search request doesn't say
const DEFAULT_TOPK: i64 = 5;

#[derive(Clone)]
struct SharedState {
    service: Arc<RetrievalService>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

pub fn router(service: Arc<RetrievalService>) -> Router {
    let shared_state = Arc::new(SharedState { service });

    Router::new()
        .route("/api/kb/ingest", post(ingest))
        .route("/api/kb/search", post(search))
        .route("/api/kb/status", get(status))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(service: RetrievalService, listen: &str) -> anyhow::Result<()> {
    let app = router(Arc::new(service));

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn start_daemon(service: RetrievalService, listen: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(service, listen).await })
}

/// HTTP status for a failure cause.
pub fn status_code(cause: ErrorCause) -> StatusCode {
    match cause {
        ErrorCause::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorCause::Auth
        | ErrorCause::MalformedResponse
        | ErrorCause::Rejected => StatusCode::BAD_GATEWAY,
        ErrorCause::Quota | ErrorCause::Transient | ErrorCause::ModelUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCause::DimensionMismatch => StatusCode::CONFLICT,
        ErrorCause::CorruptStore | ErrorCause::Persistence | ErrorCause::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug)]
struct HttpError(RetrievalError);

// Every failure is reported as `{ok: false, cause, error}`.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = status_code(self.0.cause());
        if status.is_server_error() {
            log::error!("{self:?}");
        } else {
            log::warn!("{}", self.0);
        }

        (status, Json(FailureResponse::from(&self.0))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<RetrievalError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl From<JsonRejection> for RetrievalError {
    fn from(rejection: JsonRejection) -> Self {
        RetrievalError::InvalidInput(rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
pub struct FileUpload {
    pub filename: String,
    pub data_b64: String,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub files: Vec<FileUpload>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub topk: Option<i64>,
}

fn decode_uploads(files: Vec<FileUpload>) -> Result<Vec<Document>, RetrievalError> {
    files
        .into_iter()
        .map(|FileUpload { filename, data_b64 }| {
            let bytes = STANDARD.decode(data_b64.trim()).map_err(|e| {
                RetrievalError::InvalidInput(format!("{filename}: invalid base64: {e}"))
            })?;
            Ok(Document::new(filename, bytes))
        })
        .collect()
}

async fn ingest(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, HttpError> {
    let Json(payload) = payload?;
    let documents = decode_uploads(payload.files)?;

    log::debug!("ingest: {} files", documents.len());

    let service = state.service.clone();
    let added_chunks = tokio::task::block_in_place(move || service.ingest(&documents))?;

    Ok(Json(IngestResponse {
        ok: true,
        added_chunks,
    }))
}

async fn search(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, HttpError> {
    let Json(payload) = payload?;
    let topk = usize::try_from(payload.topk.unwrap_or(DEFAULT_TOPK)).unwrap_or(0);

    log::debug!("search: {:?} (topk {topk})", payload.query);

    let service = state.service.clone();
    let hits = tokio::task::block_in_place(move || service.search(&payload.query, topk))?;

    Ok(Json(SearchResponse { ok: true, hits }))
}

async fn status(State(state): State<Arc<SharedState>>) -> Result<Json<StatusResponse>, HttpError> {
    let service = state.service.clone();
    let status = tokio::task::block_in_place(move || service.status())?;
    Ok(Json(status))
}
