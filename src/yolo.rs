use crate::{
    boxes::ClassifiedBox,
    direct_ml_available,
    geometry::{Point, rotated_rect_corners},
    image::Resizer,
    models::{DetectionRegion, GlyphRecognizer, PlateDetector},
};
use anyhow::{Context, anyhow, bail};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::{execution_providers::DirectMLExecutionProvider, session::Session, value::Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{fmt::Debug, path::PathBuf, time::Instant};
use tracing::{debug, info, warn};

/// IoU above which two same-class candidates are merged.
pub const NMS_IOU_THRESHOLD: f32 = 0.7;
const LETTERBOX_FILL: u8 = 114;

/// Head layout the model was exported with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTask {
    /// Oriented boxes: `cx, cy, w, h, classes.., angle`
    #[default]
    Obb,
    /// Axis-aligned boxes: `cx, cy, w, h, classes..`
    Detect,
}

impl std::fmt::Display for ModelTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTask::Obb => write!(f, "obb"),
            ModelTask::Detect => write!(f, "detect"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub gpu_index: i32,
    pub force_cpu: bool,
    pub model: PathBuf,
    pub task: ModelTask,
    pub input_size: u32,
}

/// Maps model input coordinates back to the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl Letterbox {
    pub fn new(source_width: u32, source_height: u32, size: u32) -> Self {
        let scale = (size as f32 / source_width as f32).min(size as f32 / source_height as f32);
        let resized_width = ((source_width as f32 * scale).round() as u32).clamp(1, size);
        let resized_height = ((source_height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            pad_x: (size - resized_width) / 2,
            pad_y: (size - resized_height) / 2,
            resized_width,
            resized_height,
            source_width,
            source_height,
        }
    }

    pub fn to_source(&self, point: Point) -> Point {
        [
            (point[0] - self.pad_x as f32) / self.scale,
            (point[1] - self.pad_y as f32) / self.scale,
        ]
    }

    fn clamp(&self, point: Point) -> Point {
        [
            point[0].clamp(0.0, self.source_width as f32),
            point[1].clamp(0.0, self.source_height as f32),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub region: DetectionRegion,
    pub class_id: u32,
}

/// Decodes a `[1, channels, anchors]` YOLO output into candidates in source
/// image coordinates, keeping scores above `min_confidence`.
pub fn decode_output(
    task: ModelTask,
    shape: &[usize],
    data: &[f32],
    min_confidence: f32,
    letterbox: &Letterbox,
) -> anyhow::Result<SmallVec<[Candidate; 10]>> {
    let [1, channels, anchors] = shape else {
        bail!("Unexpected YOLO output shape {shape:?}");
    };
    let (channels, anchors) = (*channels, *anchors);
    let extra = match task {
        ModelTask::Obb => 1,
        ModelTask::Detect => 0,
    };
    if channels < 5 + extra {
        bail!("YOLO output has {channels} channels, too few for a {task} model");
    }
    if data.len() != channels * anchors {
        bail!(
            "YOLO output holds {} values, expected {}",
            data.len(),
            channels * anchors
        );
    }
    let num_classes = channels - 4 - extra;
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];

    let mut candidates = SmallVec::<[Candidate; 10]>::new();
    for anchor in 0..anchors {
        let (class_id, score) = (0..num_classes)
            .map(|class| (class, at(4 + class, anchor)))
            .fold((0, f32::MIN), |best, current| {
                if current.1 > best.1 { current } else { best }
            });
        if score <= min_confidence {
            continue;
        }

        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        let region = match task {
            ModelTask::Obb => {
                let angle = at(channels - 1, anchor);
                let corners =
                    rotated_rect_corners(cx, cy, w, h, angle).map(|p| letterbox.to_source(p));
                DetectionRegion::Oriented {
                    corners,
                    confidence: score,
                }
            }
            ModelTask::Detect => {
                let [x1, y1] = letterbox.clamp(letterbox.to_source([cx - w / 2.0, cy - h / 2.0]));
                let [x2, y2] = letterbox.clamp(letterbox.to_source([cx + w / 2.0, cy + h / 2.0]));
                DetectionRegion::AxisAligned {
                    bbox: [x1, y1, x2, y2],
                    confidence: score,
                }
            }
        };
        candidates.push(Candidate {
            region,
            class_id: class_id as u32,
        });
    }

    let candidates = non_maximum_suppression(candidates, NMS_IOU_THRESHOLD);
    for (i, candidate) in candidates.iter().enumerate() {
        debug!("Candidate - {}: {:?}", i + 1, candidate);
    }
    Ok(candidates)
}

fn non_maximum_suppression(
    mut candidates: SmallVec<[Candidate; 10]>,
    iou_threshold: f32,
) -> SmallVec<[Candidate; 10]> {
    let mut filtered = SmallVec::new();

    candidates.sort_by(|a, b| {
        a.class_id.cmp(&b.class_id).then(
            b.region
                .confidence()
                .total_cmp(&a.region.confidence()),
        )
    });

    let mut current_class = None;
    let mut kept: SmallVec<[Candidate; 10]> = SmallVec::new();

    for candidate in candidates.iter() {
        if Some(candidate.class_id) != current_class {
            filtered.extend(kept.drain(..));
            current_class = Some(candidate.class_id);
        }
        let should_keep = kept.iter().all(|k| {
            calculate_iou(&candidate.region.bbox(), &k.region.bbox()) < iou_threshold
        });
        if should_keep {
            kept.push(*candidate);
        }
    }
    filtered.extend(kept);
    filtered
}

fn calculate_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let intersection =
        (a[2].min(b[2]) - a[0].max(b[0])).max(0.0) * (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

pub struct YoloModel {
    session: Session,
    resizer: Resizer,
    task: ModelTask,
    input_size: u32,
    model_name: String,
    endpoint_provider: EndpointProvider,
}

impl Debug for YoloModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoloModel")
            .field("model_name", &self.model_name)
            .field("task", &self.task)
            .field("input_size", &self.input_size)
            .field("endpoint_provider", &self.endpoint_provider)
            .finish()
    }
}

impl YoloModel {
    pub fn new(onnx_config: &OnnxConfig) -> anyhow::Result<Self> {
        let (model_name, session, endpoint_provider) = initialize_onnx(onnx_config)?;
        let mut model = Self {
            session,
            resizer: Resizer::default(),
            task: onnx_config.task,
            input_size: onnx_config.input_size,
            model_name,
            endpoint_provider,
        };

        info!(model = %model.model_name, "Warming up the model");
        let warmup_start_time = Instant::now();
        let blank = RgbImage::from_pixel(
            model.input_size,
            model.input_size,
            Rgb([LETTERBOX_FILL; 3]),
        );
        model.infer(&blank, 1.0)?;
        info!(
            model = %model.model_name,
            "Model warmed up in: {:?}",
            warmup_start_time.elapsed()
        );
        Ok(model)
    }

    fn letterbox(&mut self, image: &RgbImage) -> anyhow::Result<(RgbImage, Letterbox)> {
        let letterbox = Letterbox::new(image.width(), image.height(), self.input_size);
        let resized = self.resizer.resize_image(
            image,
            letterbox.resized_width,
            letterbox.resized_height,
        )?;
        let mut padded =
            RgbImage::from_pixel(self.input_size, self.input_size, Rgb([LETTERBOX_FILL; 3]));
        image::imageops::replace(
            &mut padded,
            &resized,
            letterbox.pad_x as i64,
            letterbox.pad_y as i64,
        );
        Ok((padded, letterbox))
    }

    pub fn infer(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> anyhow::Result<SmallVec<[Candidate; 10]>> {
        if image.width() == 0 || image.height() == 0 {
            bail!("Cannot run inference on an empty image");
        }
        let processing_time_start = Instant::now();
        let (padded, letterbox) = self.letterbox(image)?;

        let size = self.input_size as usize;
        let mut input = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in padded.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            input[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            input[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            input[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }
        let pre_processing_time = processing_time_start.elapsed();

        let start_inference_time = Instant::now();
        let input_tensor = Value::from_array(input)?;
        let outputs = self.session.run(ort::inputs![input_tensor])?;
        let inference_time = start_inference_time.elapsed();

        let output = outputs
            .get("output0")
            .ok_or_else(|| anyhow!("Model {} has no output0 tensor", self.model_name))?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let shape: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();
        let candidates = decode_output(self.task, &shape, data, min_confidence, &letterbox)
            .with_context(|| format!("Decoding output of {}", self.model_name))?;

        debug!(
            model = %self.model_name,
            ?pre_processing_time,
            ?inference_time,
            processing_time = ?processing_time_start.elapsed(),
            candidates = candidates.len(),
            "Inference done"
        );
        Ok(candidates)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn endpoint_provider_name(&self) -> String {
        self.endpoint_provider.to_string()
    }
}

impl PlateDetector for YoloModel {
    fn detect(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> anyhow::Result<Vec<DetectionRegion>> {
        Ok(self
            .infer(image, min_confidence)?
            .into_iter()
            .map(|candidate| candidate.region)
            .collect())
    }
}

impl GlyphRecognizer for YoloModel {
    fn recognize(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> anyhow::Result<Vec<ClassifiedBox>> {
        Ok(self
            .infer(image, min_confidence)?
            .into_iter()
            .map(|candidate| {
                ClassifiedBox::new(
                    candidate.region.bbox(),
                    candidate.region.confidence(),
                    candidate.class_id,
                )
            })
            .collect())
    }
}

fn cpu_threads(requested: usize) -> usize {
    requested
        .min(num_cpus::get_physical().saturating_sub(1))
        .max(1)
}

fn initialize_onnx(
    onnx_config: &OnnxConfig,
) -> Result<(String, Session, EndpointProvider), anyhow::Error> {
    let mut providers = Vec::new();
    let mut device_type = DeviceType::CPU;

    let (num_intra_threads, num_inter_threads) = if onnx_config.force_cpu {
        let num_intra_threads = cpu_threads(onnx_config.intra_threads);
        let num_inter_threads = cpu_threads(onnx_config.inter_threads);
        info!(
            "Forcing CPU for inference with {} intra and {} inter threads",
            num_intra_threads, num_inter_threads
        );
        (num_intra_threads, num_inter_threads)
    } else if direct_ml_available() {
        info!(
            gpu_index = onnx_config.gpu_index,
            "DirectML available, using DirectML for inference"
        );
        providers.push(
            DirectMLExecutionProvider::default()
                .with_device_id(onnx_config.gpu_index)
                .build()
                .error_on_failure(),
        );
        device_type = DeviceType::GPU;
        (1, 1)
    } else {
        let num_intra_threads = cpu_threads(onnx_config.intra_threads);
        let num_inter_threads = cpu_threads(onnx_config.inter_threads);
        warn!(
            "DirectML not available, falling back to CPU for inference with {} intra and {} inter threads",
            num_intra_threads, num_inter_threads
        );
        (num_intra_threads, num_inter_threads)
    };

    let model_name = onnx_config
        .model
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| onnx_config.model.to_string_lossy().to_string());
    let model_bytes = std::fs::read(&onnx_config.model)
        .with_context(|| format!("Failed to read model file {:?}", onnx_config.model))?;

    info!(
        "Initializing {} model {:?} with inference running on {}",
        onnx_config.task, model_name, device_type,
    );

    let session = Session::builder()?
        .with_execution_providers(providers)?
        .with_intra_threads(num_intra_threads)?
        .with_inter_threads(num_inter_threads)?
        .commit_from_memory(model_bytes.as_slice())?;

    let endpoint_provider = match device_type {
        DeviceType::GPU => EndpointProvider::DirectML,
        DeviceType::CPU => EndpointProvider::CPU,
    };

    Ok((model_name, session, endpoint_provider))
}

#[derive(Debug, Clone, Copy)]
pub enum EndpointProvider {
    CPU,
    DirectML,
}

impl std::fmt::Display for EndpointProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointProvider::CPU => write!(f, "CPU"),
            EndpointProvider::DirectML => write!(f, "DirectML"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DeviceType {
    CPU,
    GPU,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::CPU => write!(f, "CPU"),
            DeviceType::GPU => write!(f, "GPU"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lays out `rows` (one per anchor) as a channel-major `[1, C, N]` tensor.
    fn tensor(rows: &[Vec<f32>]) -> (Vec<usize>, Vec<f32>) {
        let channels = rows[0].len();
        let mut data = vec![0.0; channels * rows.len()];
        for (anchor, row) in rows.iter().enumerate() {
            for (channel, value) in row.iter().enumerate() {
                data[channel * rows.len() + anchor] = *value;
            }
        }
        (vec![1, channels, rows.len()], data)
    }

    #[test]
    fn test_letterbox_wide_image() {
        let letterbox = Letterbox::new(1280, 640, 640);
        assert_eq!(letterbox.scale, 0.5);
        assert_eq!((letterbox.resized_width, letterbox.resized_height), (640, 320));
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (0, 160));
        assert_eq!(letterbox.to_source([320.0, 320.0]), [640.0, 320.0]);
    }

    #[test]
    fn test_decode_detect_output() {
        let letterbox = Letterbox::new(1280, 640, 640);
        let (shape, data) = tensor(&[
            vec![320.0, 320.0, 100.0, 50.0, 0.1, 0.9],
            vec![100.0, 300.0, 10.0, 10.0, 0.2, 0.3],
        ]);
        let candidates =
            decode_output(ModelTask::Detect, &shape, &data, 0.5, &letterbox).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 1);
        assert_eq!(
            candidates[0].region,
            DetectionRegion::AxisAligned {
                bbox: [540.0, 270.0, 740.0, 370.0],
                confidence: 0.9
            }
        );
    }

    #[test]
    fn test_decode_detect_clamps_to_image() {
        let letterbox = Letterbox::new(640, 640, 640);
        let (shape, data) = tensor(&[vec![5.0, 630.0, 40.0, 40.0, 0.8]]);
        let candidates =
            decode_output(ModelTask::Detect, &shape, &data, 0.25, &letterbox).unwrap();
        assert_eq!(candidates[0].region.bbox(), [0.0, 610.0, 25.0, 640.0]);
    }

    #[test]
    fn test_decode_obb_output() {
        let letterbox = Letterbox::new(640, 640, 640);
        let (shape, data) = tensor(&[vec![200.0, 100.0, 80.0, 20.0, 0.7, 0.0]]);
        let candidates = decode_output(ModelTask::Obb, &shape, &data, 0.45, &letterbox).unwrap();
        let DetectionRegion::Oriented { corners, confidence } = candidates[0].region else {
            panic!("expected an oriented region");
        };
        assert_eq!(confidence, 0.7);
        assert_eq!(
            corners,
            [[160.0, 90.0], [240.0, 90.0], [240.0, 110.0], [160.0, 110.0]]
        );
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let letterbox = Letterbox::new(640, 640, 640);
        assert!(decode_output(ModelTask::Detect, &[1, 4, 1], &[0.0; 4], 0.5, &letterbox).is_err());
        assert!(decode_output(ModelTask::Obb, &[1, 5, 1], &[0.0; 5], 0.5, &letterbox).is_err());
        assert!(decode_output(ModelTask::Detect, &[1, 6, 2], &[0.0; 6], 0.5, &letterbox).is_err());
    }

    #[test]
    fn test_nms_is_per_class() {
        let letterbox = Letterbox::new(640, 640, 640);
        let (shape, data) = tensor(&[
            vec![100.0, 100.0, 50.0, 50.0, 0.8, 0.0],
            vec![101.0, 100.0, 50.0, 50.0, 0.9, 0.0],
            vec![100.0, 100.0, 50.0, 50.0, 0.0, 0.6],
        ]);
        let candidates =
            decode_output(ModelTask::Detect, &shape, &data, 0.5, &letterbox).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].class_id, 0);
        assert_eq!(candidates[0].region.confidence(), 0.9);
        assert_eq!(candidates[1].class_id, 1);
    }
}
