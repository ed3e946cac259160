// Live stream engine
//
// Every `/video_feed` request gets a producer thread that owns the capture
// source, reads plates on every n-th frame, annotates the frame and pushes it
// as one part of a `multipart/x-mixed-replace` body.

use crate::{
    geometry::STREAM_BOX_PADDING,
    image::{Resizer, draw_legend, draw_region_outline, encode_jpeg},
    models::{DetectionRegion, Models},
    pipeline::{PlateError, read_plate},
    source::{FrameSource, open_source},
    startup_coordinator::ModelSlot,
    store::ResultStore,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use image::RgbImage;
use std::{convert::Infallible, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
/// Encoded frames buffered ahead of a slow consumer.
const CHUNK_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfig {
    /// Plates are read on every `frame_stride`-th frame.
    pub frame_stride: u64,
    pub detect_confidence: f32,
    pub ocr_confidence: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_stride: 3,
            detect_confidence: 0.45,
            ocr_confidence: 0.55,
        }
    }
}

/// One multipart part holding a JPEG frame.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut chunk = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Adapts the producer channel into a response body stream.
pub fn chunk_stream(receiver: mpsc::Receiver<Bytes>) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|chunk| (Ok(chunk), receiver))
    })
}

#[derive(Clone)]
pub struct StreamEngine {
    store: Arc<ResultStore>,
    models: Arc<ModelSlot>,
    config: StreamConfig,
    local_camera: Option<String>,
    cancel: CancellationToken,
}

impl StreamEngine {
    pub fn new(
        store: Arc<ResultStore>,
        models: Arc<ModelSlot>,
        config: StreamConfig,
        local_camera: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            models,
            config,
            local_camera,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    /// Starts a producer for `camera_id`. The returned channel closes when the
    /// source ends, cannot be opened or the server shuts down.
    pub fn spawn(&self, camera_id: String) -> mpsc::Receiver<Bytes> {
        let (sender, receiver) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let engine = self.clone();
        let thread_name = format!("stream-{camera_id}");
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                match open_source(&camera_id, engine.local_camera.as_deref()) {
                    Ok(source) => engine.run(&camera_id, source, sender),
                    Err(err) => error!(camera_id = %camera_id, %err, "Stream source unavailable"),
                }
            });
        if let Err(err) = spawned {
            error!(?err, "Failed to spawn stream producer");
        }
        receiver
    }

    /// Producer loop. Blocks until the source ends, the consumer goes away or
    /// the engine is cancelled.
    pub fn run(&self, camera_id: &str, mut source: Box<dyn FrameSource>, sender: mpsc::Sender<Bytes>) {
        info!(camera_id, "Stream started");
        let mut resizer = Resizer::default();
        let mut frame_count: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!(camera_id, "Stream cancelled");
                break;
            }
            let mut frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(camera_id, frames = frame_count, "Stream source ended");
                    break;
                }
                Err(err) => {
                    warn!(camera_id, ?err, "Failed to read frame, ending stream");
                    break;
                }
            };

            frame_count += 1;
            if frame_count % self.config.frame_stride.max(1) == 0 {
                if let Some(models) = self.models.models() {
                    if let Err(err) = self.read_frame_plate(camera_id, &models, &mut resizer, &mut frame) {
                        warn!(camera_id, %err, "Frame processing failed");
                    }
                }
            }

            let jpeg = match encode_jpeg(&frame) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    warn!(camera_id, ?err, "Failed to encode frame");
                    continue;
                }
            };
            if sender.blocking_send(multipart_chunk(&jpeg)).is_err() {
                info!(camera_id, frames = frame_count, "Stream consumer disconnected");
                break;
            }
        }
    }

    fn read_frame_plate(
        &self,
        camera_id: &str,
        models: &Models,
        resizer: &mut Resizer,
        frame: &mut RgbImage,
    ) -> Result<(), PlateError> {
        let regions = models.detect(frame, self.config.detect_confidence)?;
        let Some(region) = most_confident(regions) else {
            return Ok(());
        };

        // Crop before the outline is drawn into the frame.
        let crop = region.crop(frame, STREAM_BOX_PADDING);
        draw_region_outline(frame, &region);
        let Some(crop) = crop.filter(|crop| crop.width() > 0 && crop.height() > 0) else {
            debug!(camera_id, ?region, "Empty plate crop");
            return Ok(());
        };

        let reading = read_plate(models, resizer, &crop, self.config.ocr_confidence)?;
        if reading.boxes.is_empty() {
            return Ok(());
        }
        if let Some(font) = models.renderer().font() {
            let (x, y) = region.label_anchor();
            draw_legend(frame, font, &reading.plate.display_text(), x, y);
        }
        self.store
            .publish(camera_id, &reading.plate, models.renderer())?;
        Ok(())
    }
}

fn most_confident(regions: Vec<DetectionRegion>) -> Option<DetectionRegion> {
    regions.into_iter().reduce(|best, region| {
        if region.confidence() > best.confidence() {
            region
        } else {
            best
        }
    })
}
