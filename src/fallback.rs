// Fallback plate detection
//
// Uploaded photos are often taken at odd angles or orientations. The detector
// is tried on a fixed sequence of reshaped versions of the image and the first
// version that yields a plate wins.

use crate::{geometry::UPLOAD_BOX_PADDING, models::Models};
use image::{RgbImage, imageops};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTransform {
    Identity,
    ShrinkHeight,
    ShrinkWidth,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// Order in which transforms are attempted.
pub const FALLBACK_SEQUENCE: [FallbackTransform; 6] = [
    FallbackTransform::Identity,
    FallbackTransform::ShrinkHeight,
    FallbackTransform::ShrinkWidth,
    FallbackTransform::Rotate90,
    FallbackTransform::Rotate180,
    FallbackTransform::Rotate270,
];

const SHRINK_FACTOR: f32 = 0.8;

impl FallbackTransform {
    pub fn label(&self) -> &'static str {
        match self {
            FallbackTransform::Identity => "original",
            FallbackTransform::ShrinkHeight => "shrink height 80%",
            FallbackTransform::ShrinkWidth => "shrink width 80%",
            FallbackTransform::Rotate90 => "rotate 90 clockwise",
            FallbackTransform::Rotate180 => "rotate 180",
            FallbackTransform::Rotate270 => "rotate 90 counter-clockwise",
        }
    }

    pub fn apply(&self, image: &RgbImage) -> anyhow::Result<RgbImage> {
        let (width, height) = image.dimensions();
        Ok(match self {
            FallbackTransform::Identity => image.clone(),
            FallbackTransform::ShrinkHeight => {
                shrink(image, width, (height as f32 * SHRINK_FACTOR) as u32)?
            }
            FallbackTransform::ShrinkWidth => {
                shrink(image, (width as f32 * SHRINK_FACTOR) as u32, height)?
            }
            FallbackTransform::Rotate90 => imageops::rotate90(image),
            FallbackTransform::Rotate180 => imageops::rotate180(image),
            FallbackTransform::Rotate270 => imageops::rotate270(image),
        })
    }
}

fn shrink(image: &RgbImage, width: u32, height: u32) -> anyhow::Result<RgbImage> {
    if width == 0 || height == 0 {
        anyhow::bail!("Shrinking {}x{} leaves no pixels", image.width(), image.height());
    }
    crate::image::Resizer::default().resize_image(image, width, height)
}

/// Crop picked by the fallback search.
#[derive(Debug, Clone)]
pub struct PlateCrop {
    pub image: RgbImage,
    pub confidence: f32,
    pub transform: FallbackTransform,
}

/// Runs the detector over [`FALLBACK_SEQUENCE`] and returns the most confident
/// crop of the first transform that produced any crop at all.
///
/// Detector or transform failures are logged and the next transform is tried.
/// `None` when every transform came up empty.
pub fn find_plate_crop(
    models: &Models,
    image: &RgbImage,
    min_confidence: f32,
) -> Option<PlateCrop> {
    let mut best: Option<PlateCrop> = None;
    let mut best_confidence = 0.0_f32;

    for transform in FALLBACK_SEQUENCE {
        debug!(transform = transform.label(), "Trying plate detection");
        let attempt_start = Instant::now();
        let result = transform.apply(image).and_then(|transformed| {
            models
                .detect(&transformed, min_confidence)
                .map(|regions| (transformed, regions))
        });
        let (transformed, regions) = match result {
            Ok(found) => found,
            Err(err) => {
                warn!(transform = transform.label(), ?err, "Transformation failed");
                continue;
            }
        };

        for region in regions {
            let confidence = region.confidence();
            if confidence <= best_confidence {
                continue;
            }
            let Some(crop) = region.crop(&transformed, UPLOAD_BOX_PADDING) else {
                debug!(?region, "Skipping degenerate plate region");
                continue;
            };
            best_confidence = confidence;
            best = Some(PlateCrop {
                image: crop,
                confidence,
                transform,
            });
        }

        if let Some(found) = &best {
            info!(
                transform = found.transform.label(),
                confidence = found.confidence,
                elapsed = ?attempt_start.elapsed(),
                "Found plate"
            );
            break;
        }
    }
    best
}
