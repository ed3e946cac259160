use crate::{geometry::Point, models::DetectionRegion};
use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, bail};
use base64::{Engine as _, engine::general_purpose};
use fast_image_resize::{
    FilterType, PixelType, ResizeAlg, ResizeOptions,
    images::{Image as ResizeImage, ImageRef},
};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut},
    rect::Rect,
};
use jpeg_encoder::{ColorType, Encoder};
use std::{path::Path, time::Instant};
use tracing::debug;
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

pub const JPEG_QUALITY: u8 = 90;

const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LEGEND_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LEGEND_SIZE: f32 = 26.0;

pub fn decode_jpeg(jpeg: &[u8]) -> anyhow::Result<RgbImage> {
    let options = DecoderOptions::default()
        .set_strict_mode(true)
        .set_use_unsafe(true)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg, options);
    // We need to decode the headers first to get the output buffer size
    decoder.decode_headers()?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| anyhow!("Failed to get decoder output buffer size"))?;
    let mut pixels = vec![0; output_buffer_size];
    decoder.decode_into(&mut pixels)?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow!("Failed to get image dimensions"))?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow!("Decoded buffer does not match {width}x{height}"))
}

pub fn is_jpeg_data(data: &[u8]) -> bool {
    data.starts_with(&[0xFF, 0xD8, 0xFF])
}

/// Decodes an uploaded or captured image. JPEG goes through zune-jpeg, other
/// formats through `image`.
pub fn decode_image(data: &[u8]) -> anyhow::Result<RgbImage> {
    let decode_start_time = Instant::now();
    let image = if is_jpeg_data(data) {
        decode_jpeg(data)?
    } else {
        image::load_from_memory(data)?.to_rgb8()
    };
    if image.width() == 0 || image.height() == 0 {
        bail!("Image has no pixels");
    }
    debug!(
        "Decode image time: {:?}, resolution {}x{}",
        decode_start_time.elapsed(),
        image.width(),
        image.height()
    );
    Ok(image)
}

pub fn load_image(path: &Path) -> anyhow::Result<RgbImage> {
    decode_image(&std::fs::read(path)?)
}

pub fn encode_jpeg(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let encode_image_start_time = Instant::now();
    let width = u16::try_from(image.width())?;
    let height = u16::try_from(image.height())?;
    if width == 0 || height == 0 {
        bail!("Cannot encode an empty image");
    }
    let mut jpeg = Vec::with_capacity(image.as_raw().len() / 8);
    let encoder = Encoder::new(&mut jpeg, JPEG_QUALITY);
    encoder.encode(image.as_raw(), width, height, ColorType::Rgb)?;
    debug!(encode_image_time = ?encode_image_start_time.elapsed(), "Encode image time");
    Ok(jpeg)
}

pub fn jpeg_base64(image: &RgbImage) -> anyhow::Result<String> {
    Ok(general_purpose::STANDARD.encode(encode_jpeg(image)?))
}

/// JPEG data URI as consumed by `<img src=...>`.
pub fn jpeg_data_uri(image: &RgbImage) -> anyhow::Result<String> {
    Ok(format!("data:image/jpeg;base64,{}", jpeg_base64(image)?))
}

/// Grayscale histogram equalisation, returned as three identical channels.
pub fn enhance_contrast(image: &RgbImage) -> RgbImage {
    let gray = image::imageops::grayscale(image);
    let equalized = imageproc::contrast::equalize_histogram(&gray);
    DynamicImage::ImageLuma8(equalized).to_rgb8()
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
    options: ResizeOptions,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            options: ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        }
    }
}

impl Resizer {
    pub fn resize_image(
        &mut self,
        original_image: &RgbImage,
        target_width: u32,
        target_height: u32,
    ) -> anyhow::Result<RgbImage> {
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width(),
            original_image.height(),
            target_width,
            target_height
        );
        let src_image = ImageRef::new(
            original_image.width(),
            original_image.height(),
            original_image.as_raw(),
            PixelType::U8x3,
        )?;
        let mut dst_image = ResizeImage::new(target_width, target_height, PixelType::U8x3);
        self.resizer
            .resize(&src_image, &mut dst_image, &self.options)?;
        RgbImage::from_raw(target_width, target_height, dst_image.into_vec())
            .ok_or_else(|| anyhow!("Resized buffer does not match {target_width}x{target_height}"))
    }
}

/// Outlines a detected plate region on a video frame.
pub fn draw_region_outline(frame: &mut RgbImage, region: &DetectionRegion) {
    match region {
        DetectionRegion::Oriented { corners, .. } => draw_polygon_outline(frame, corners),
        DetectionRegion::AxisAligned { bbox, .. } => {
            let (x1, y1) = (bbox[0] as i32, bbox[1] as i32);
            let (w, h) = ((bbox[2] - bbox[0]) as i32, (bbox[3] - bbox[1]) as i32);
            for inset in 0..2 {
                let (w, h) = (w - 2 * inset, h - 2 * inset);
                if w > 0 && h > 0 {
                    draw_hollow_rect_mut(
                        frame,
                        Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32),
                        OUTLINE_COLOR,
                    );
                }
            }
        }
    }
}

fn draw_polygon_outline(frame: &mut RgbImage, corners: &[Point; 4]) {
    for i in 0..corners.len() {
        let (start, end) = (corners[i], corners[(i + 1) % corners.len()]);
        for offset in [0.0, 1.0] {
            draw_line_segment_mut(
                frame,
                (start[0] + offset, start[1]),
                (end[0] + offset, end[1]),
                OUTLINE_COLOR,
            );
        }
    }
}

/// Writes `text` so that its baseline sits just above `(x, y)`.
pub fn draw_legend(frame: &mut RgbImage, font: &FontArc, text: &str, x: i32, y: i32) {
    let top = y - 10 - LEGEND_SIZE as i32;
    draw_text_mut(
        frame,
        LEGEND_COLOR,
        x,
        top,
        PxScale::from(LEGEND_SIZE),
        font,
        text,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jpeg_round_trip_keeps_size() {
        let image = RgbImage::from_fn(64, 32, |x, y| Rgb([x as u8 * 4, y as u8 * 8, 128]));
        let jpeg = encode_jpeg(&image).unwrap();
        assert!(is_jpeg_data(&jpeg));
        let decoded = decode_image(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (64, 32));
    }

    #[test]
    fn test_decode_png() {
        let image = RgbImage::from_pixel(10, 7, Rgb([255, 0, 0]));
        let mut png = std::io::Cursor::new(Vec::new());
        image.write_to(&mut png, image::ImageFormat::Png).unwrap();
        let decoded = decode_image(png.get_ref()).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_image(b"definitely not an image").is_err());
        assert!(decode_image(&[0xFF, 0xD8, 0xFF, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_data_uri_prefix() {
        let image = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let uri = jpeg_data_uri(&image).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,/9j/"));
    }

    #[test]
    fn test_resize_to_ocr_input() {
        let image = RgbImage::from_pixel(123, 45, Rgb([200, 100, 50]));
        let mut resizer = Resizer::default();
        let resized = resizer.resize_image(&image, 640, 160).unwrap();
        assert_eq!(resized.dimensions(), (640, 160));
        assert_eq!(resized.get_pixel(320, 80), &Rgb([200, 100, 50]));
    }

    #[test]
    fn test_enhance_contrast_is_gray() {
        let image = RgbImage::from_fn(32, 8, |x, _| Rgb([x as u8 * 2, 40, 90]));
        let enhanced = enhance_contrast(&image);
        assert_eq!(enhanced.dimensions(), image.dimensions());
        for pixel in enhanced.pixels() {
            assert_eq!(pixel[0], pixel[1]);
            assert_eq!(pixel[1], pixel[2]);
        }
        assert_eq!(enhanced.get_pixel(31, 0)[0], 255);
    }

    #[test]
    fn test_outline_stays_inside_frame() {
        let mut frame = RgbImage::new(40, 20);
        let region = DetectionRegion::Oriented {
            corners: [[-5.0, 2.0], [60.0, 2.0], [60.0, 15.0], [-5.0, 15.0]],
            confidence: 0.9,
        };
        draw_region_outline(&mut frame, &region);
        assert_eq!(frame.get_pixel(10, 2), &OUTLINE_COLOR);

        let region = DetectionRegion::AxisAligned {
            bbox: [5.0, 5.0, 15.0, 12.0],
            confidence: 0.9,
        };
        draw_region_outline(&mut frame, &region);
        assert_eq!(frame.get_pixel(5, 8), &OUTLINE_COLOR);
    }
}
