use crate::{
    api::{CameraQuery, CameraResult, PredictOutcome},
    pipeline::{PlateError, UploadConfig, predict_upload},
    startup_coordinator::{InitResult, ModelSlot},
    store::ResultStore,
    stream::{MULTIPART_CONTENT_TYPE, StreamConfig, StreamEngine, chunk_stream},
};
use anyhow::Context;
use axum::{
    Json, Router,
    body::{self, Body},
    extract::{DefaultBodyLimit, Multipart, Query, State, multipart::MultipartError},
    http::{
        Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use tokio::{sync::oneshot, task::JoinError};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

const MEGABYTE: usize = 1024 * 1024; // 1 MB = 1024 * 1024 bytes
const THIRTY_MEGABYTES: usize = 30 * MEGABYTE; // 30 MB in bytes

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub upload: UploadConfig,
    pub stream: StreamConfig,
    pub local_camera: Option<String>,
}

pub struct ServerState {
    models: Arc<ModelSlot>,
    streams: StreamEngine,
    upload_dir: PathBuf,
    upload_config: UploadConfig,
}

impl ServerState {
    pub fn new(
        models: Arc<ModelSlot>,
        store: Arc<ResultStore>,
        config: &ServerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        let streams = StreamEngine::new(
            store,
            models.clone(),
            config.stream,
            config.local_camera.clone(),
            cancellation_token,
        );
        Self {
            models,
            streams,
            upload_dir: config.upload_dir.clone(),
            upload_config: config.upload,
        }
    }
}

pub fn router(server_state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/predict", post(predict))
        .route("/latest_result", get(latest_result))
        .route("/video_feed", get(video_feed))
        .fallback(fallback_handler)
        .with_state(server_state)
        .layer(DefaultBodyLimit::max(THIRTY_MEGABYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_server(
    config: ServerConfig,
    cancellation_token: CancellationToken,
    init_receiver: oneshot::Receiver<InitResult>,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.upload_dir)
        .with_context(|| format!("Failed to create upload directory {:?}", config.upload_dir))?;

    let models = Arc::new(ModelSlot::default());
    tokio::spawn(models.clone().wait_for(init_receiver));

    let server_state = Arc::new(ServerState::new(
        models,
        Arc::new(ResultStore::default()),
        &config,
        cancellation_token.clone(),
    ));
    let plate_scribe = router(server_state);

    let port = config.port;
    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
    info!("Starting server, listening on {}", addr);
    info!("Live feed, http://127.0.0.1:{}/video_feed?url=0", port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(
                "Looks like {port} is already in use by another application, please turn off the other application or pick another port with --port"
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    axum::serve(listener, plate_scribe.into_make_service())
        .with_graceful_shutdown(async move { cancellation_token.cancelled().await })
        .await?;
    Ok(())
}

struct Upload {
    file_name: Option<String>,
    data: Bytes,
}

/// Takes the `file` field, or the first field carrying a file name, or else the
/// first field at all.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, PredictError> {
    let mut upload: Option<(bool, Upload)> = None;
    while let Some(field) = multipart.next_field().await? {
        let preferred = field.name() == Some("file") || field.file_name().is_some();
        if upload.as_ref().is_some_and(|(taken_preferred, _)| *taken_preferred || !preferred) {
            continue;
        }
        let file_name = field.file_name().map(|s| s.to_string());
        let data = field.bytes().await?;
        upload = Some((preferred, Upload { file_name, data }));
    }
    upload
        .map(|(_, upload)| upload)
        .ok_or_else(|| PredictError(PlateError::InvalidInputImage))
}

async fn predict(
    State(server_state): State<Arc<ServerState>>,
    mut multipart: Multipart, // Note multipart needs to be last
) -> Result<Json<PredictOutcome>, PredictError> {
    let request_start_time = Instant::now();
    let upload = read_upload(&mut multipart).await?;
    debug!(
        file_name = ?upload.file_name,
        bytes = upload.data.len(),
        "Received upload"
    );

    let models = server_state.models.get()?;
    let upload_dir = server_state.upload_dir.clone();
    let config = server_state.upload_config;
    let response = tokio::task::spawn_blocking(move || {
        predict_upload(
            &models,
            &upload_dir,
            upload.file_name.as_deref(),
            &upload.data,
            &config,
        )
    })
    .await??;

    info!(
        plate_text = %response.plate_text,
        round_trip = ?request_start_time.elapsed(),
        "Predict request done"
    );
    Ok(Json(PredictOutcome::Plate(Box::new(response))))
}

async fn latest_result(
    State(server_state): State<Arc<ServerState>>,
    Query(query): Query<CameraQuery>,
) -> Json<CameraResult> {
    Json(server_state.streams.store().latest(&query.url))
}

async fn video_feed(
    State(server_state): State<Arc<ServerState>>,
    Query(query): Query<CameraQuery>,
) -> Response {
    info!(camera_id = %query.url, "Video feed requested");
    let receiver = server_state.streams.spawn(query.url);
    (
        [
            (CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        Body::from_stream(chunk_stream(receiver)),
    )
        .into_response()
}

async fn fallback_handler(req: Request<Body>) -> impl IntoResponse {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let body_bytes = body::to_bytes(req.into_body(), THIRTY_MEGABYTES)
        .await
        .unwrap_or_else(|_| body::Bytes::new());

    debug!(
        "Unimplemented endpoint called: Method: {}, URI: {}, Headers: {:?}, Body: {:?}",
        method, uri, headers, body_bytes
    );

    (StatusCode::NOT_FOUND, "Endpoint not implemented")
}

/// `/predict` failures, always answered as `{"error": ...}` with status 200.
struct PredictError(PlateError);

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "Predict request failed");
        (StatusCode::OK, Json(PredictOutcome::error(self.0.to_string()))).into_response()
    }
}

impl From<PlateError> for PredictError {
    fn from(err: PlateError) -> Self {
        Self(err)
    }
}

impl From<MultipartError> for PredictError {
    fn from(err: MultipartError) -> Self {
        Self(PlateError::CollaboratorFailure(err.into()))
    }
}

impl From<JoinError> for PredictError {
    fn from(err: JoinError) -> Self {
        Self(PlateError::CollaboratorFailure(
            anyhow::Error::new(err).context("Plate pipeline task failed"),
        ))
    }
}
