// Plate geometry
//
// Corner ordering, four point rectification of oriented plate regions and the
// padded crop used when the detector only gives an axis-aligned box.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use nalgebra::{SMatrix, SVector};

pub type Point = [f32; 2];

/// Padding around axis-aligned boxes for one-shot uploads.
pub const UPLOAD_BOX_PADDING: i64 = 10;
/// Padding around axis-aligned boxes in the live stream loop.
pub const STREAM_BOX_PADDING: i64 = 5;

/// Orders four corners as top-left, top-right, bottom-right, bottom-left.
///
/// Top-left has the smallest `x + y` and bottom-right the largest. Top-right has
/// the smallest `y - x` and bottom-left the largest. Duplicate or collinear
/// points still return an ordering, it just has no geometric meaning.
pub fn order_corners(points: &[Point; 4]) -> [Point; 4] {
    let sum = |p: &Point| p[0] + p[1];
    let diff = |p: &Point| p[1] - p[0];
    [
        pick(points, sum, false),
        pick(points, diff, false),
        pick(points, sum, true),
        pick(points, diff, true),
    ]
}

// First match wins on ties.
fn pick(points: &[Point; 4], key: impl Fn(&Point) -> f32, largest: bool) -> Point {
    let mut best = 0;
    for i in 1..points.len() {
        let (candidate, current) = (key(&points[i]), key(&points[best]));
        if (largest && candidate > current) || (!largest && candidate < current) {
            best = i;
        }
    }
    points[best]
}

pub fn distance(p1: Point, p2: Point) -> f32 {
    ((p2[0] - p1[0]).powi(2) + (p2[1] - p1[1]).powi(2)).sqrt()
}

/// Size of the rectified crop for a quadrilateral: the longer of each pair of
/// opposing edges, truncated to whole pixels.
pub fn rectified_size(corners: &[Point; 4]) -> (u32, u32) {
    let [tl, tr, br, bl] = order_corners(corners);
    let width = (distance(br, bl) as u32).max(distance(tr, tl) as u32);
    let height = (distance(tr, br) as u32).max(distance(tl, bl) as u32);
    (width, height)
}

/// Flattens the quadrilateral `corners` of `image` into an upright rectangle.
///
/// Returns `None` when the region cannot be sampled, e.g. a zero area
/// quadrilateral or an empty source image.
pub fn rectify(image: &RgbImage, corners: &[Point; 4]) -> Option<RgbImage> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    let ordered = order_corners(corners);
    let (width, height) = rectified_size(&ordered);
    if width == 0 || height == 0 {
        return None;
    }

    let (w, h) = ((width - 1) as f32, (height - 1) as f32);
    let destination = [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]];
    let coeffs = perspective_coeffs(&ordered, &destination)?;
    let projection = Projection::from_matrix(coeffs)?;

    let mut rectified = RgbImage::new(width, height);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut rectified,
    );
    Some(rectified)
}

/// Solves the 3x3 homography mapping `src[i]` onto `dest[i]`.
///
/// Solved in f64, narrowed to f32 for `Projection`.
pub fn perspective_coeffs(src: &[Point; 4], dest: &[Point; 4]) -> Option<[f32; 9]> {
    let mut a_matrix = SMatrix::<f64, 8, 8>::zeros();
    let mut b_vector = SVector::<f64, 8>::zeros();

    for i in 0..4 {
        let (x, y) = (src[i][0] as f64, src[i][1] as f64);
        let (x_prime, y_prime) = (dest[i][0] as f64, dest[i][1] as f64);

        a_matrix[(2 * i, 0)] = x;
        a_matrix[(2 * i, 1)] = y;
        a_matrix[(2 * i, 2)] = 1.0;
        a_matrix[(2 * i, 6)] = -x * x_prime;
        a_matrix[(2 * i, 7)] = -y * x_prime;
        b_vector[2 * i] = x_prime;

        a_matrix[(2 * i + 1, 3)] = x;
        a_matrix[(2 * i + 1, 4)] = y;
        a_matrix[(2 * i + 1, 5)] = 1.0;
        a_matrix[(2 * i + 1, 6)] = -x * y_prime;
        a_matrix[(2 * i + 1, 7)] = -y * y_prime;
        b_vector[2 * i + 1] = y_prime;
    }

    let solution = a_matrix.lu().solve(&b_vector)?;
    if solution.iter().any(|c| !c.is_finite()) {
        return None;
    }
    let mut coeffs = [1.0_f32; 9];
    for (dst, src) in coeffs.iter_mut().zip(solution.iter()) {
        *dst = *src as f32;
    }
    Some(coeffs)
}

/// Crops an axis-aligned box grown by `padding` pixels on every side and
/// clamped to the image. A box entirely outside the image yields an empty crop.
pub fn padded_crop(image: &RgbImage, bbox: [f32; 4], padding: i64) -> RgbImage {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let x1 = (bbox[0] as i64 - padding).max(0);
    let y1 = (bbox[1] as i64 - padding).max(0);
    let x2 = (bbox[2] as i64 + padding).min(width);
    let y2 = (bbox[3] as i64 + padding).min(height);
    if x2 <= x1 || y2 <= y1 {
        return RgbImage::new(0, 0);
    }
    image::imageops::crop_imm(
        image,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    )
    .to_image()
}

/// Corners of a rotated rectangle given its centre, size and angle in radians.
pub fn rotated_rect_corners(cx: f32, cy: f32, w: f32, h: f32, angle: f32) -> [Point; 4] {
    let (sin, cos) = angle.sin_cos();
    let (dx_w, dy_w) = (cos * w / 2.0, sin * w / 2.0);
    let (dx_h, dy_h) = (-sin * h / 2.0, cos * h / 2.0);
    [
        [cx - dx_w - dx_h, cy - dy_w - dy_h],
        [cx + dx_w - dx_h, cy + dy_w - dy_h],
        [cx + dx_w + dx_h, cy + dy_w + dy_h],
        [cx - dx_w + dx_h, cy - dy_w + dy_h],
    ]
}

/// Axis-aligned envelope `[x1, y1, x2, y2]` of a set of corners.
pub fn bounding_box(corners: &[Point; 4]) -> [f32; 4] {
    let mut bbox = [f32::MAX, f32::MAX, f32::MIN, f32::MIN];
    for p in corners {
        bbox[0] = bbox[0].min(p[0]);
        bbox[1] = bbox[1].min(p[1]);
        bbox[2] = bbox[2].max(p[0]);
        bbox[3] = bbox[3].max(p[1]);
    }
    bbox
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_order_corners_any_permutation() {
        let tl = [10.0, 20.0];
        let tr = [110.0, 20.0];
        let br = [110.0, 70.0];
        let bl = [10.0, 70.0];
        let permutations = [
            [tl, tr, br, bl],
            [br, bl, tl, tr],
            [bl, tl, tr, br],
            [tr, bl, br, tl],
            [br, tr, bl, tl],
        ];
        for points in permutations {
            assert_eq!(order_corners(&points), [tl, tr, br, bl]);
        }
    }

    #[test]
    fn test_order_corners_tilted_quad() {
        let points = [[115.0, 60.0], [15.0, 70.0], [110.0, 10.0], [10.0, 20.0]];
        let [tl, tr, br, bl] = order_corners(&points);
        assert_eq!(tl, [10.0, 20.0]);
        assert_eq!(tr, [110.0, 10.0]);
        assert_eq!(br, [115.0, 60.0]);
        assert_eq!(bl, [15.0, 70.0]);
    }

    #[test]
    fn test_rectify_axis_aligned_matches_crop() {
        // Linear ramps so bilinear sampling is exact up to truncation.
        let image = RgbImage::from_fn(200, 120, |x, y| {
            Rgb([x as u8, y as u8, ((x + y) / 2) as u8])
        });
        let corners = [[100.0, 40.0], [41.0, 40.0], [41.0, 70.0], [100.0, 70.0]];
        let rectified = rectify(&image, &corners).expect("rectify");
        assert_eq!(rectified.dimensions(), (59, 30));

        let (sx, sy) = (59.0 / 58.0, 30.0 / 29.0);
        for (x, y, pixel) in rectified.enumerate_pixels() {
            let src_x = 41.0 + x as f32 * sx;
            let src_y = 40.0 + y as f32 * sy;
            assert!((pixel[0] as f32 - src_x).abs() <= 1.01, "x {x}: {pixel:?}");
            assert!((pixel[1] as f32 - src_y).abs() <= 1.01, "y {y}: {pixel:?}");
        }
    }

    #[test]
    fn test_rectify_rotated_quad_size() {
        let image = gradient_image(300, 300);
        let corners = rotated_rect_corners(150.0, 150.0, 120.0, 40.0, 0.3);
        let (w, h) = rectified_size(&corners);
        assert!((119..=120).contains(&w), "width {w}");
        assert!((39..=40).contains(&h), "height {h}");
        let rectified = rectify(&image, &corners).expect("rectify");
        assert_eq!(rectified.dimensions(), (w, h));
    }

    #[test]
    fn test_rectify_degenerate_is_none() {
        let image = gradient_image(50, 50);
        let collapsed = [[10.0, 10.0]; 4];
        assert!(rectify(&image, &collapsed).is_none());
        let line = [[0.0, 5.0], [40.0, 5.0], [40.0, 5.0], [0.0, 5.0]];
        assert!(rectify(&image, &line).is_none());
        let empty = RgbImage::new(0, 0);
        assert!(rectify(&empty, &[[0.0, 0.0], [9.0, 0.0], [9.0, 9.0], [0.0, 9.0]]).is_none());
    }

    #[test]
    fn test_padded_crop_clamps_to_image() {
        let image = gradient_image(100, 50);
        let crop = padded_crop(&image, [2.0, 3.0, 40.0, 48.0], UPLOAD_BOX_PADDING);
        assert_eq!(crop.dimensions(), (50, 50));
        assert_eq!(crop.get_pixel(0, 0), image.get_pixel(0, 0));

        let crop = padded_crop(&image, [20.0, 10.0, 30.0, 20.0], STREAM_BOX_PADDING);
        assert_eq!(crop.dimensions(), (20, 20));
        assert_eq!(crop.get_pixel(0, 0), image.get_pixel(15, 5));
    }

    #[test]
    fn test_padded_crop_outside_is_empty() {
        let image = gradient_image(100, 50);
        let crop = padded_crop(&image, [300.0, 300.0, 400.0, 400.0], UPLOAD_BOX_PADDING);
        assert_eq!(crop.dimensions(), (0, 0));
    }

    #[test]
    fn test_rotated_rect_corners_unrotated() {
        let corners = rotated_rect_corners(50.0, 20.0, 40.0, 10.0, 0.0);
        assert_eq!(
            corners,
            [[30.0, 15.0], [70.0, 15.0], [70.0, 25.0], [30.0, 25.0]]
        );
        assert_eq!(bounding_box(&corners), [30.0, 15.0, 70.0, 25.0]);
    }
}
