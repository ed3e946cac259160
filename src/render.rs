// Synthetic plate rendering
//
// Draws a clean replica of a recognised plate: left digits, the country
// emblem, right digits, centred on a dark canvas with a light border.

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use image::{Rgb, RgbImage, Rgba, RgbaImage, imageops::FilterType};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use std::path::Path;
use tracing::{info, warn};

pub const PLATE_WIDTH: u32 = 520;
pub const PLATE_HEIGHT: u32 = 115;

const BACKGROUND: Rgb<u8> = Rgb([25, 25, 25]);
const INK: [u8; 3] = [245, 245, 245];
const BORDER: Rgb<u8> = Rgb([200, 200, 200]);
const BORDER_WIDTH: u32 = 3;
const FONT_EM_SIZE: f32 = 95.0;
const TEXT_TOP: i32 = (PLATE_HEIGHT as i32 - 100) / 2;
const GAP: f32 = 30.0;
const LOGO_THRESHOLD: u8 = 70;

/// Used when no plate font is configured or the configured one cannot be read.
static BUILTIN_FONT: &[u8] = include_bytes!("../assets/DejaVuSansCondensed-Bold.ttf");

pub fn builtin_font() -> Option<FontArc> {
    FontArc::try_from_slice(BUILTIN_FONT)
        .inspect_err(|err| warn!(?err, "Built-in plate font is unusable"))
        .ok()
}

/// Font and emblem used for synthetic plates. Without an emblem the centre
/// gap stays empty. A renderer built with no font draws no text.
#[derive(Clone)]
pub struct PlateRenderer {
    font: Option<FontArc>,
    logo: Option<RgbaImage>,
}

impl Default for PlateRenderer {
    fn default() -> Self {
        Self::new(builtin_font(), None)
    }
}

impl PlateRenderer {
    pub fn new(font: Option<FontArc>, logo: Option<&RgbaImage>) -> Self {
        Self {
            font,
            logo: logo.map(clean_logo),
        }
    }

    pub fn load(font_path: Option<&Path>, logo_path: Option<&Path>) -> Self {
        let configured = font_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontArc::try_from_vec(bytes) {
                Ok(font) => {
                    info!(?path, "Loaded plate font");
                    Some(font)
                }
                Err(err) => {
                    warn!(?path, ?err, "Invalid plate font, using the built-in one");
                    None
                }
            },
            Err(err) => {
                warn!(?path, ?err, "Could not read plate font, using the built-in one");
                None
            }
        });
        let font = configured.or_else(builtin_font);
        let logo = logo_path.and_then(|path| match image::open(path) {
            Ok(logo) => {
                info!(?path, "Loaded plate emblem");
                Some(logo.to_rgba8())
            }
            Err(err) => {
                warn!(?path, ?err, "Could not load plate emblem, rendering without it");
                None
            }
        });
        Self::new(font, logo.as_ref())
    }

    pub fn font(&self) -> Option<&FontArc> {
        self.font.as_ref()
    }

    fn scale(font: &FontArc) -> PxScale {
        let units_per_em = font.units_per_em().unwrap_or(1000.0);
        PxScale::from(FONT_EM_SIZE * font.height_unscaled() / units_per_em)
    }

    fn text_width(&self, text: &str) -> f32 {
        let Some(font) = &self.font else {
            return 0.0;
        };
        let scaled = font.as_scaled(Self::scale(font));
        text.chars()
            .map(|c| scaled.h_advance(scaled.glyph_id(c)))
            .sum()
    }

    fn draw_text(&self, canvas: &mut RgbImage, x: f32, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(
                canvas,
                Rgb(INK),
                x.floor() as i32,
                TEXT_TOP,
                Self::scale(font),
                font,
                text,
            );
        }
    }

    /// Renders `left`, the emblem and `right` onto a fresh plate canvas.
    pub fn render(&self, left: &str, right: &str) -> RgbImage {
        let mut plate = RgbImage::from_pixel(PLATE_WIDTH, PLATE_HEIGHT, BACKGROUND);

        let left_width = self.text_width(left);
        let right_width = self.text_width(right);
        let logo = self.logo.as_ref().map(|logo| {
            let logo_height = (PLATE_HEIGHT as f32 * 0.7) as u32;
            let logo_width =
                (logo.width() as f32 * (logo_height as f32 / logo.height() as f32)) as u32;
            image::imageops::resize(logo, logo_width, logo_height, FilterType::Lanczos3)
        });
        let logo_width = logo.as_ref().map_or(0, |logo| logo.width()) as f32;

        let total_width = left_width + logo_width + right_width + 2.0 * GAP;
        let mut x = ((PLATE_WIDTH as f32 - total_width) / 2.0).floor();

        self.draw_text(&mut plate, x, left);
        x += left_width + GAP;

        if let Some(logo) = &logo {
            let top = (PLATE_HEIGHT - logo.height()) / 2;
            blend(&mut plate, logo, x as i64, top as i64);
            x += logo_width + GAP;
        }

        self.draw_text(&mut plate, x, right);

        for inset in 0..BORDER_WIDTH {
            draw_hollow_rect_mut(
                &mut plate,
                Rect::at(inset as i32, inset as i32)
                    .of_size(PLATE_WIDTH - 2 * inset, PLATE_HEIGHT - 2 * inset),
                BORDER,
            );
        }
        plate
    }
}

/// Reduces the emblem to a single ink colour: opaque where its luminance
/// exceeds the threshold, transparent elsewhere.
pub fn clean_logo(logo: &RgbaImage) -> RgbaImage {
    let gray = image::imageops::grayscale(logo);
    RgbaImage::from_fn(logo.width(), logo.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > LOGO_THRESHOLD {
            Rgba([INK[0], INK[1], INK[2], 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

fn blend(canvas: &mut RgbImage, overlay: &RgbaImage, left: i64, top: i64) {
    for (ox, oy, pixel) in overlay.enumerate_pixels() {
        let (x, y) = (left + ox as i64, top + oy as i64);
        if x < 0 || y < 0 || x >= canvas.width() as i64 || y >= canvas.height() as i64 {
            continue;
        }
        let alpha = pixel[3] as f32 / 255.0;
        let target = canvas.get_pixel_mut(x as u32, y as u32);
        for c in 0..3 {
            let mixed = pixel[c] as f32 * alpha + target[c] as f32 * (1.0 - alpha);
            target[c] = mixed.round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_logo(luma: u8) -> RgbaImage {
        RgbaImage::from_pixel(40, 40, Rgba([luma, luma, luma, 255]))
    }

    #[test]
    fn test_plain_plate_has_border_and_background() {
        let plate = PlateRenderer::new(None, None).render("123", "4567");
        assert_eq!(plate.dimensions(), (PLATE_WIDTH, PLATE_HEIGHT));
        for inset in 0..BORDER_WIDTH {
            assert_eq!(plate.get_pixel(inset, inset), &BORDER);
            assert_eq!(
                plate.get_pixel(PLATE_WIDTH - 1 - inset, PLATE_HEIGHT - 1 - inset),
                &BORDER
            );
        }
        assert_eq!(plate.get_pixel(3, 3), &BACKGROUND);
        assert_eq!(plate.get_pixel(260, 57), &BACKGROUND);
    }

    #[test]
    fn test_logo_is_centred_without_text() {
        let renderer = PlateRenderer::new(None, Some(&square_logo(200)));
        let plate = renderer.render("", "");
        // 80x80 emblem, total width 140, so it starts at 190 + 30.
        assert!(plate.get_pixel(260, 57)[0] >= 240);
        assert_eq!(plate.get_pixel(215, 57), &BACKGROUND);
        assert_eq!(plate.get_pixel(305, 57), &BACKGROUND);
        assert_eq!(plate.get_pixel(260, 10), &BACKGROUND);
    }

    #[test]
    fn test_dark_logo_is_transparent() {
        let cleaned = clean_logo(&square_logo(LOGO_THRESHOLD));
        assert!(cleaned.pixels().all(|p| p[3] == 0));

        let renderer = PlateRenderer::new(None, Some(&square_logo(10)));
        let plate = renderer.render("", "");
        assert_eq!(plate.get_pixel(260, 57), &BACKGROUND);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let renderer = PlateRenderer::new(None, Some(&square_logo(180)));
        assert_eq!(renderer.render("12", "345"), renderer.render("12", "345"));
    }

    #[test]
    fn test_missing_assets_do_not_fail() {
        let renderer = PlateRenderer::load(
            Some(Path::new("does/not/exist.ttf")),
            Some(Path::new("does/not/exist.png")),
        );
        assert!(renderer.font().is_some());
        let plate = renderer.render("1", "2");
        assert_eq!(plate.dimensions(), (PLATE_WIDTH, PLATE_HEIGHT));
        assert!(ink_pixels(&plate) > 0);
    }

    fn ink_pixels(plate: &RgbImage) -> usize {
        let inner = BORDER_WIDTH + 2;
        (inner..PLATE_WIDTH - inner)
            .flat_map(|x| (inner..PLATE_HEIGHT - inner).map(move |y| (x, y)))
            .filter(|&(x, y)| plate.get_pixel(x, y)[0] > 200)
            .count()
    }

    #[test]
    fn test_default_renderer_draws_digits() {
        let renderer = PlateRenderer::default();
        assert!(renderer.font().is_some());

        let plate = renderer.render("123", "4567");
        assert!(ink_pixels(&plate) > 500);
        // Left group sits left of the centre gap, right group right of it.
        let ink_in = |from: u32, to: u32| {
            (from..to)
                .flat_map(|x| (10..PLATE_HEIGHT - 10).map(move |y| (x, y)))
                .any(|(x, y)| plate.get_pixel(x, y)[0] > 200)
        };
        assert!(ink_in(10, 200));
        assert!(ink_in(320, PLATE_WIDTH - 10));

        assert_ne!(plate, renderer.render("123", "4568"));
        assert_ne!(plate, PlateRenderer::new(None, None).render("123", "4567"));
    }
}
