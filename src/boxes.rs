use serde::{Deserialize, Serialize};

/// Recognition class reserved for the country marker printed between the two
/// digit groups of a plate.
pub const COUNTRY_MARKER: u32 = 10;

/// Boxes overlapping an already accepted box above this IoU are duplicates.
pub const DUPLICATE_IOU_THRESHOLD: f32 = 0.3;

/// A classified box in the pixel space of the image it was produced against.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl ClassifiedBox {
    pub fn new(bbox: [f32; 4], confidence: f32, class_id: u32) -> Self {
        Self {
            x1: bbox[0],
            y1: bbox[1],
            x2: bbox[2],
            y2: bbox[3],
            confidence,
            class_id,
        }
    }

    pub fn bbox(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn is_country_marker(&self) -> bool {
        self.class_id == COUNTRY_MARKER
    }
}

/// Intersection over union using inclusive pixel bounds, so a box spanning
/// `x1..=x2` is `x2 - x1 + 1` pixels wide.
pub fn calculate_iou(a: &ClassifiedBox, b: &ClassifiedBox) -> f32 {
    let x_min = a.x1.max(b.x1);
    let y_min = a.y1.max(b.y1);
    let x_max = a.x2.min(b.x2);
    let y_max = a.y2.min(b.y2);
    let intersection = (x_max - x_min + 1.0).max(0.0) * (y_max - y_min + 1.0).max(0.0);
    let area_a = (a.x2 - a.x1 + 1.0) * (a.y2 - a.y1 + 1.0);
    let area_b = (b.x2 - b.x1 + 1.0) * (b.y2 - b.y1 + 1.0);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy overlap suppression across all classes.
///
/// Boxes are visited from the most to the least confident (stable on ties) and
/// kept only when they overlap no kept box by more than
/// [`DUPLICATE_IOU_THRESHOLD`]. Competing glyphs at one position are treated as
/// alternative readings of the same character slot, so class is ignored. The
/// result is ordered by descending confidence.
pub fn deduplicate(boxes: &[ClassifiedBox]) -> Vec<ClassifiedBox> {
    let mut sorted = boxes.to_vec();
    sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<ClassifiedBox> = Vec::with_capacity(sorted.len());
    for candidate in sorted {
        if kept
            .iter()
            .all(|accepted| calculate_iou(&candidate, accepted) <= DUPLICATE_IOU_THRESHOLD)
        {
            kept.push(candidate);
        }
    }
    kept
}
