use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use image::{Rgb, RgbImage};
use plate_scribe::{
    api::CameraResult,
    assemble::MARKER_GLYPH,
    boxes::{COUNTRY_MARKER, ClassifiedBox},
    models::{DetectionRegion, GlyphRecognizer, Models, PlateDetector},
    pipeline::UploadConfig,
    render::PlateRenderer,
    server::{ServerConfig, ServerState, router},
    startup_coordinator::{ModelSlot, NOT_READY_MESSAGE},
    store::ResultStore,
    stream::StreamConfig,
};
use serde_json::{Value, json};
use std::{io::Cursor, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const BOUNDARY: &str = "plate-scribe-test-boundary";

/// Only sees a plate when the bottom right pixel is pure red, which for an
/// upload marked at the top left happens after turning it upside down.
struct UpsideDownDetector;

impl PlateDetector for UpsideDownDetector {
    fn detect(&mut self, image: &RgbImage, _: f32) -> anyhow::Result<Vec<DetectionRegion>> {
        let (width, height) = image.dimensions();
        if *image.get_pixel(width - 1, height - 1) != Rgb([255, 0, 0]) {
            return Ok(Vec::new());
        }
        let (left, top) = (width as f32 * 0.25, height as f32 * 0.25);
        let (right, bottom) = (width as f32 * 0.75, height as f32 * 0.75);
        Ok(vec![DetectionRegion::Oriented {
            corners: [[right, bottom], [left, top], [right, top], [left, bottom]],
            confidence: 0.8,
        }])
    }
}

struct PlateGlyphs;

impl GlyphRecognizer for PlateGlyphs {
    fn recognize(&mut self, _: &RgbImage, _: f32) -> anyhow::Result<Vec<ClassifiedBox>> {
        Ok(vec![
            ClassifiedBox::new([40.0, 20.0, 90.0, 140.0], 0.9, 1),
            ClassifiedBox::new([100.0, 20.0, 150.0, 140.0], 0.9, 8),
            ClassifiedBox::new([280.0, 20.0, 360.0, 140.0], 0.95, COUNTRY_MARKER),
            ClassifiedBox::new([420.0, 20.0, 470.0, 140.0], 0.85, 5),
        ])
    }
}

fn server_config(upload_dir: &Path) -> ServerConfig {
    ServerConfig {
        port: 0,
        upload_dir: upload_dir.to_path_buf(),
        upload: UploadConfig::default(),
        stream: StreamConfig::default(),
        local_camera: None,
    }
}

fn app(models: Arc<ModelSlot>, upload_dir: &Path) -> Router {
    router(Arc::new(ServerState::new(
        models,
        Arc::new(ResultStore::default()),
        &server_config(upload_dir),
        CancellationToken::new(),
    )))
}

fn ready_models() -> Arc<ModelSlot> {
    Arc::new(ModelSlot::ready(Arc::new(Models::new(
        Box::new(UpsideDownDetector),
        Box::new(PlateGlyphs),
        PlateRenderer::default(),
    ))))
}

fn upload_request(file_name: &str, data: &[u8]) -> Request<Body> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn marked_png() -> Vec<u8> {
    let mut image = RgbImage::from_pixel(320, 200, Rgb([90, 90, 90]));
    image.put_pixel(0, 0, Rgb([255, 0, 0]));
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    png
}

#[tokio::test]
async fn predict_finds_plate_after_rotation() {
    let upload_dir = tempfile::tempdir().unwrap();
    let response = app(ready_models(), upload_dir.path())
        .oneshot(upload_request("car.png", &marked_png()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert!(body.get("error").is_none(), "{body}");
    assert_eq!(body["plate_text"], format!("18{MARKER_GLYPH}5"));
    assert_eq!(body["plate_parts"], json!({"left": "18", "right": "5"}));
    assert_eq!(body["crop_boxes"].as_array().unwrap().len(), 4);
    assert_eq!(body["image_size"], json!({"width": 640, "height": 160}));
    assert!(
        body["synthetic_plate"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,")
    );
    assert_eq!(std::fs::read_dir(upload_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn predict_without_plate() {
    let upload_dir = tempfile::tempdir().unwrap();
    let mut image = RgbImage::from_pixel(64, 64, Rgb([90, 90, 90]));
    image.put_pixel(10, 10, Rgb([255, 0, 0]));
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();

    let response = app(ready_models(), upload_dir.path())
        .oneshot(upload_request("empty_road.png", &png))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"error": "No license plate detected even after fallbacks."})
    );
}

#[tokio::test]
async fn predict_rejects_invalid_image() {
    let upload_dir = tempfile::tempdir().unwrap();
    let response = app(ready_models(), upload_dir.path())
        .oneshot(upload_request("notes.jpg", b"definitely not an image"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"error": "Invalid image file"})
    );
    assert_eq!(std::fs::read_dir(upload_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn predict_before_models_are_loaded() {
    let upload_dir = tempfile::tempdir().unwrap();
    let response = app(Arc::new(ModelSlot::default()), upload_dir.path())
        .oneshot(upload_request("car.png", &marked_png()))
        .await
        .unwrap();
    assert_eq!(
        json_body(response).await,
        json!({ "error": NOT_READY_MESSAGE })
    );
}

#[tokio::test]
async fn latest_result_placeholder() {
    let upload_dir = tempfile::tempdir().unwrap();
    let response = app(ready_models(), upload_dir.path())
        .oneshot(
            Request::builder()
                .uri("/latest_result?url=http://10.0.0.7/mjpg")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: CameraResult = serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(result, CameraResult::default());
}

#[tokio::test]
async fn video_feed_headers() {
    let upload_dir = tempfile::tempdir().unwrap();
    let response = app(ready_models(), upload_dir.path())
        .oneshot(
            Request::builder()
                .uri("/video_feed?url=rtsp://nowhere/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );
    // The source cannot be opened, so the stream ends without frames.
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn unknown_route() {
    let upload_dir = tempfile::tempdir().unwrap();
    let response = app(ready_models(), upload_dir.path())
        .oneshot(
            Request::builder()
                .uri("/v1/vision/detection")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
