use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Side length of the plate crop handed to the recognition model.
pub const OCR_INPUT_WIDTH: u32 = 640;
pub const OCR_INPUT_HEIGHT: u32 = 160;

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct CropBox {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
    pub label: String,
}

impl Debug for CropBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CropBox")
            .field("label", &self.label)
            .field("confidence", &self.confidence)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct PlateParts {
    pub left: String,
    pub right: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ImageSize {
    fn default() -> Self {
        Self {
            width: OCR_INPUT_WIDTH,
            height: OCR_INPUT_HEIGHT,
        }
    }
}

/// Body of a successful `POST /predict`.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct PredictResponse {
    /// Full plate string, `left + marker + right` when a marker was read.
    pub plate_text: String,
    pub plate_parts: PlateParts,
    /// Enhanced plate crop as a JPEG data URI.
    pub crop_image: String,
    /// Clean replica of the plate as a JPEG data URI.
    pub synthetic_plate: String,
    /// Deduplicated glyph boxes in crop coordinates.
    pub crop_boxes: Vec<CropBox>,
    /// Size of the crop the boxes refer to.
    pub image_size: ImageSize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

/// `/predict` answers with either shape, never both.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum PredictOutcome {
    Plate(Box<PredictResponse>),
    Error(ErrorResponse),
}

impl PredictOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        PredictOutcome::Error(ErrorResponse {
            error: message.into(),
        })
    }
}

/// Latest reading for one camera. The default value is the placeholder served
/// before anything was recognised.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct CameraResult {
    pub plate_text: String,
    pub plate_parts: PlateParts,
    pub synthetic_plate: String,
    /// Seconds since the Unix epoch of the last change.
    pub timestamp: f64,
}

#[derive(Deserialize, Debug)]
pub struct CameraQuery {
    #[serde(default = "default_camera_id")]
    pub url: String,
}

pub fn default_camera_id() -> String {
    "0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_outcome_shape() {
        let outcome = PredictOutcome::error("Invalid image file");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"error": "Invalid image file"})
        );
    }

    #[test]
    fn test_placeholder_camera_result() {
        let value = serde_json::to_value(CameraResult::default()).unwrap();
        assert_eq!(value["plate_text"], "");
        assert_eq!(value["plate_parts"], json!({"left": "", "right": ""}));
        assert_eq!(value["synthetic_plate"], "");
        assert_eq!(value["timestamp"].as_f64(), Some(0.0));
    }

    #[test]
    fn test_predict_outcome_round_trips_untagged() {
        let outcome = PredictOutcome::Plate(Box::new(PredictResponse {
            plate_text: "12".into(),
            ..Default::default()
        }));
        let text = serde_json::to_string(&outcome).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["image_size"], json!({"width": 640, "height": 160}));

        let back: PredictOutcome = serde_json::from_str(&text).unwrap();
        assert!(matches!(back, PredictOutcome::Plate(p) if p.plate_text == "12"));
    }

    #[test]
    fn test_camera_query_defaults_to_local_device() {
        let query: CameraQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.url, "0");
    }
}
