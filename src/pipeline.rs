use crate::{
    api::{ImageSize, OCR_INPUT_HEIGHT, OCR_INPUT_WIDTH, PlateParts, PredictResponse},
    assemble::{AssembledPlate, assemble, format_boxes},
    boxes::{ClassifiedBox, deduplicate},
    fallback::find_plate_crop,
    image::{Resizer, enhance_contrast, jpeg_data_uri, load_image},
    models::Models,
};
use anyhow::Context;
use image::RgbImage;
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures surfaced to clients. The display strings of the upload variants
/// are the exact `error` values returned by `/predict`.
#[derive(Debug, Error)]
pub enum PlateError {
    #[error("Invalid image file")]
    InvalidInputImage,
    #[error("No license plate detected even after fallbacks.")]
    NoPlateDetected,
    #[error("Invalid detection crop")]
    InvalidCrop,
    #[error("{0:#}")]
    CollaboratorFailure(#[from] anyhow::Error),
    #[error("Could not open video source: {0}")]
    StreamSourceUnavailable(String),
    #[error("{0}")]
    NotReady(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadConfig {
    pub detect_confidence: f32,
    pub ocr_confidence: f32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            detect_confidence: 0.25,
            ocr_confidence: 0.50,
        }
    }
}

/// Text read from one plate crop.
#[derive(Debug, Clone)]
pub struct PlateReading {
    pub plate: AssembledPlate,
    /// Deduplicated boxes, most confident first.
    pub boxes: Vec<ClassifiedBox>,
    /// The normalised crop recognition ran on.
    pub enhanced: RgbImage,
}

/// Normalises a plate crop to the recognition input and reads its glyphs.
pub fn read_plate(
    models: &Models,
    resizer: &mut Resizer,
    crop: &RgbImage,
    min_confidence: f32,
) -> Result<PlateReading, PlateError> {
    if crop.width() == 0 || crop.height() == 0 {
        return Err(PlateError::InvalidCrop);
    }
    let resized = resizer.resize_image(crop, OCR_INPUT_WIDTH, OCR_INPUT_HEIGHT)?;
    let enhanced = enhance_contrast(&resized);
    let raw = models.recognize(&enhanced, min_confidence)?;
    let boxes = deduplicate(&raw);
    debug!(raw = raw.len(), kept = boxes.len(), "Deduplicated glyph boxes");
    Ok(PlateReading {
        plate: assemble(&boxes),
        boxes,
        enhanced,
    })
}

/// Full upload pipeline on a decoded image.
pub fn predict_image(
    models: &Models,
    image: &RgbImage,
    config: &UploadConfig,
) -> Result<PredictResponse, PlateError> {
    let crop = find_plate_crop(models, image, config.detect_confidence)
        .ok_or(PlateError::NoPlateDetected)?;
    let reading = read_plate(
        models,
        &mut Resizer::default(),
        &crop.image,
        config.ocr_confidence,
    )?;
    let AssembledPlate {
        left,
        right,
        combined,
    } = reading.plate;
    let synthetic = models.renderer().render(&left, &right);

    Ok(PredictResponse {
        plate_text: combined,
        plate_parts: PlateParts { left, right },
        crop_image: jpeg_data_uri(&reading.enhanced)?,
        synthetic_plate: jpeg_data_uri(&synthetic)?,
        crop_boxes: format_boxes(&reading.boxes),
        image_size: ImageSize::default(),
    })
}

/// Removes the temporary upload file when dropped.
pub struct UploadGuard {
    path: PathBuf,
}

impl UploadGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed upload"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = ?self.path, ?err, "Failed to remove upload"),
        }
    }
}

/// Writes the uploaded bytes to `<upload_dir>/<uuid>_<file name>`.
pub fn store_upload(
    upload_dir: &Path,
    file_name: Option<&str>,
    bytes: &[u8],
) -> anyhow::Result<UploadGuard> {
    let file_name = file_name
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    std::fs::create_dir_all(upload_dir)
        .with_context(|| format!("Failed to create upload directory {upload_dir:?}"))?;
    let path = upload_dir.join(format!("{}_{}", uuid::Uuid::new_v4(), file_name));
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write upload {path:?}"))?;
    Ok(UploadGuard { path })
}

/// Handles one `/predict` upload end to end. The temporary file is gone by
/// the time this returns, whatever the outcome.
pub fn predict_upload(
    models: &Models,
    upload_dir: &Path,
    file_name: Option<&str>,
    bytes: &[u8],
    config: &UploadConfig,
) -> Result<PredictResponse, PlateError> {
    let processing_start = Instant::now();
    let upload = store_upload(upload_dir, file_name, bytes)?;
    let image = load_image(upload.path()).map_err(|err| {
        debug!(path = ?upload.path(), ?err, "Upload is not a readable image");
        PlateError::InvalidInputImage
    })?;
    let response = predict_image(models, &image, config)?;
    info!(
        plate_text = %response.plate_text,
        boxes = response.crop_boxes.len(),
        elapsed = ?processing_start.elapsed(),
        "Plate read"
    );
    Ok(response)
}
