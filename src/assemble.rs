// Plate text assembly
//
// Turns the unordered glyph boxes of one recognition pass into the ordered
// left / right halves of a plate, split on the country marker.

use crate::{
    api::CropBox,
    boxes::{COUNTRY_MARKER, ClassifiedBox},
};

/// Glyph the country marker is written as inside plate strings.
pub const MARKER_GLYPH: &str = "تونس";
/// Label of the country marker in box listings.
pub const MARKER_LABEL: &str = "TUNISIA";
/// ASCII stand-in for the marker when drawing on video frames.
pub const MARKER_DISPLAY: &str = "TU";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledPlate {
    pub left: String,
    pub right: String,
    pub combined: String,
}

impl AssembledPlate {
    /// Plate text with the marker replaced by [`MARKER_DISPLAY`].
    pub fn display_text(&self) -> String {
        self.combined.replace(MARKER_GLYPH, MARKER_DISPLAY)
    }
}

pub fn glyph_repr(class_id: u32) -> String {
    if class_id == COUNTRY_MARKER {
        MARKER_GLYPH.to_string()
    } else {
        class_id.to_string()
    }
}

fn box_label(class_id: u32) -> String {
    if class_id == COUNTRY_MARKER {
        MARKER_LABEL.to_string()
    } else {
        class_id.to_string()
    }
}

fn sort_by_x(boxes: &mut [&ClassifiedBox]) {
    boxes.sort_by(|a, b| a.x1.total_cmp(&b.x1));
}

fn concat(boxes: &[&ClassifiedBox]) -> String {
    boxes.iter().map(|b| glyph_repr(b.class_id)).collect()
}

/// Assembles deduplicated glyph boxes into a plate string.
///
/// The most confident marker box anchors the split: glyphs starting left of it
/// form `left`, glyphs starting right of it form `right`, each read by
/// ascending `x1`. A glyph starting exactly at the marker's `x1` belongs to
/// neither side. Without a marker every glyph goes to `left` in reading order
/// and `combined == left`.
pub fn assemble(boxes: &[ClassifiedBox]) -> AssembledPlate {
    let anchor = boxes
        .iter()
        .filter(|b| b.is_country_marker())
        .fold(None::<&ClassifiedBox>, |best, b| match best {
            Some(current) if current.confidence >= b.confidence => Some(current),
            _ => Some(b),
        });

    let Some(anchor) = anchor else {
        let mut ordered: Vec<&ClassifiedBox> = boxes.iter().collect();
        sort_by_x(&mut ordered);
        let left = concat(&ordered);
        return AssembledPlate {
            combined: left.clone(),
            left,
            right: String::new(),
        };
    };

    let logo_x = anchor.x1;
    let mut left_side = Vec::new();
    let mut right_side = Vec::new();
    for b in boxes.iter().filter(|b| !b.is_country_marker()) {
        if b.x1 < logo_x {
            left_side.push(b);
        } else if b.x1 > logo_x {
            right_side.push(b);
        }
    }
    sort_by_x(&mut left_side);
    sort_by_x(&mut right_side);

    let left = concat(&left_side);
    let right = concat(&right_side);
    AssembledPlate {
        combined: format!("{left}{MARKER_GLYPH}{right}"),
        left,
        right,
    }
}

/// Listing of the boxes for visualisation, in the order given.
pub fn format_boxes(boxes: &[ClassifiedBox]) -> Vec<CropBox> {
    boxes
        .iter()
        .map(|b| CropBox {
            bbox: b.bbox(),
            confidence: b.confidence,
            class_id: b.class_id,
            label: box_label(b.class_id),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyph(x1: f32, class_id: u32, confidence: f32) -> ClassifiedBox {
        ClassifiedBox::new([x1, 0.0, x1 + 20.0, 40.0], confidence, class_id)
    }

    #[test]
    fn test_assemble_splits_on_marker() {
        let boxes = [
            glyph(100.0, 7, 0.8),
            glyph(0.0, 5, 0.7),
            glyph(50.0, COUNTRY_MARKER, 0.9),
        ];
        let plate = assemble(&boxes);
        assert_eq!(plate.left, "5");
        assert_eq!(plate.right, "7");
        assert_eq!(plate.combined, format!("5{MARKER_GLYPH}7"));
    }

    #[test]
    fn test_assemble_orders_each_side_by_x() {
        let boxes = [
            glyph(300.0, 6, 0.9),
            glyph(40.0, 2, 0.9),
            glyph(10.0, 1, 0.9),
            glyph(200.0, 4, 0.9),
            glyph(70.0, 3, 0.9),
            glyph(120.0, COUNTRY_MARKER, 0.95),
            glyph(250.0, 5, 0.9),
        ];
        let plate = assemble(&boxes);
        assert_eq!(plate.left, "123");
        assert_eq!(plate.right, "456");
        assert_eq!(plate.display_text(), "123TU456");
    }

    #[test]
    fn test_assemble_without_marker() {
        let boxes = [glyph(90.0, 9, 0.9), glyph(10.0, 1, 0.6), glyph(50.0, 0, 0.7)];
        let plate = assemble(&boxes);
        assert_eq!(plate.left, "109");
        assert_eq!(plate.right, "");
        assert_eq!(plate.combined, plate.left);
    }

    #[test]
    fn test_assemble_uses_most_confident_marker() {
        let boxes = [
            glyph(0.0, 1, 0.9),
            glyph(40.0, COUNTRY_MARKER, 0.4),
            glyph(80.0, 2, 0.9),
            glyph(120.0, COUNTRY_MARKER, 0.8),
            glyph(160.0, 3, 0.9),
        ];
        let plate = assemble(&boxes);
        assert_eq!(plate.left, "12");
        assert_eq!(plate.right, "3");
        assert_eq!(plate.combined.matches(MARKER_GLYPH).count(), 1);
    }

    #[test]
    fn test_glyph_at_marker_position_is_dropped() {
        let boxes = [
            glyph(0.0, 1, 0.9),
            glyph(50.0, COUNTRY_MARKER, 0.9),
            glyph(50.0, 8, 0.5),
            glyph(90.0, 2, 0.9),
        ];
        let plate = assemble(&boxes);
        assert_eq!(plate.combined, format!("1{MARKER_GLYPH}2"));
    }

    #[test]
    fn test_assemble_empty() {
        assert_eq!(assemble(&[]), AssembledPlate::default());
    }

    #[test]
    fn test_format_boxes_labels() {
        let boxes = [glyph(0.0, 4, 0.7), glyph(30.0, COUNTRY_MARKER, 0.9)];
        let listing = format_boxes(&boxes);
        assert_eq!(listing[0].label, "4");
        assert_eq!(listing[1].label, MARKER_LABEL);
        assert_eq!(listing[1].class_id, COUNTRY_MARKER);
        assert_eq!(listing[1].bbox, [30.0, 0.0, 50.0, 40.0]);
    }
}
