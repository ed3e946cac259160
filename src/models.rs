use crate::{
    boxes::ClassifiedBox,
    geometry::{Point, bounding_box, padded_crop, rectify},
    render::PlateRenderer,
};
use anyhow::anyhow;
use image::RgbImage;
use std::sync::Mutex;

/// A plate found by the detector, either as a rotated quadrilateral or as an
/// axis-aligned box `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionRegion {
    Oriented { corners: [Point; 4], confidence: f32 },
    AxisAligned { bbox: [f32; 4], confidence: f32 },
}

impl DetectionRegion {
    pub fn confidence(&self) -> f32 {
        match self {
            DetectionRegion::Oriented { confidence, .. }
            | DetectionRegion::AxisAligned { confidence, .. } => *confidence,
        }
    }

    pub fn bbox(&self) -> [f32; 4] {
        match self {
            DetectionRegion::Oriented { corners, .. } => bounding_box(corners),
            DetectionRegion::AxisAligned { bbox, .. } => *bbox,
        }
    }

    /// Where the stream annotation text is anchored: the first corner as
    /// reported by the model, or the top-left of the box.
    pub fn label_anchor(&self) -> (i32, i32) {
        match self {
            DetectionRegion::Oriented { corners, .. } => {
                (corners[0][0] as i32, corners[0][1] as i32)
            }
            DetectionRegion::AxisAligned { bbox, .. } => (bbox[0] as i32, bbox[1] as i32),
        }
    }

    /// Extracts the plate pixels. Oriented regions are rectified, `None` when
    /// the quadrilateral is degenerate. Axis-aligned regions are cropped with
    /// `padding` and may come back empty.
    pub fn crop(&self, image: &RgbImage, padding: i64) -> Option<RgbImage> {
        match self {
            DetectionRegion::Oriented { corners, .. } => rectify(image, corners),
            DetectionRegion::AxisAligned { bbox, .. } => Some(padded_crop(image, *bbox, padding)),
        }
    }
}

/// Finds licence plates in a full scene.
pub trait PlateDetector: Send {
    fn detect(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> anyhow::Result<Vec<DetectionRegion>>;
}

/// Reads the glyphs of a normalised plate crop.
pub trait GlyphRecognizer: Send {
    fn recognize(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> anyhow::Result<Vec<ClassifiedBox>>;
}

/// Loaded models and rendering assets shared by the upload handler and every
/// stream. Each model sits behind its own lock, inference calls into one model
/// never overlap.
pub struct Models {
    detector: Mutex<Box<dyn PlateDetector>>,
    recognizer: Mutex<Box<dyn GlyphRecognizer>>,
    renderer: PlateRenderer,
}

impl Models {
    pub fn new(
        detector: Box<dyn PlateDetector>,
        recognizer: Box<dyn GlyphRecognizer>,
        renderer: PlateRenderer,
    ) -> Self {
        Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            renderer,
        }
    }

    pub fn detect(
        &self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> anyhow::Result<Vec<DetectionRegion>> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| anyhow!("Plate detector lock poisoned"))?;
        detector.detect(image, min_confidence)
    }

    pub fn recognize(
        &self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> anyhow::Result<Vec<ClassifiedBox>> {
        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| anyhow!("Glyph recognizer lock poisoned"))?;
        recognizer.recognize(image, min_confidence)
    }

    pub fn renderer(&self) -> &PlateRenderer {
        &self.renderer
    }
}
