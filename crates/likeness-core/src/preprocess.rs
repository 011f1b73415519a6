//! Face image normalization: bounded downscale, grayscale, histogram equalization.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array2;

/// Largest edge a prepared face may have.
pub const MAX_FACE_SIZE: u32 = 256;

/// Downscale to at most [`MAX_FACE_SIZE`] on each edge. Aspect ratio is not preserved.
fn bounded(image: &DynamicImage) -> DynamicImage {
    let (w, h) = (image.width(), image.height());
    if w <= MAX_FACE_SIZE && h <= MAX_FACE_SIZE {
        return image.clone();
    }
    image.resize_exact(
        w.min(MAX_FACE_SIZE),
        h.min(MAX_FACE_SIZE),
        FilterType::Triangle,
    )
}

/// Grayscale + equalized representation used by LBPH, Eigenfaces and Fisherfaces.
pub fn prepare_grayscale(image: &DynamicImage) -> GrayImage {
    let mut gray = bounded(image).to_luma8();
    equalize_histogram(&mut gray);
    gray
}

/// RGB representation handed to the embedding extractor. No equalization.
pub fn prepare_rgb(image: &DynamicImage) -> RgbImage {
    bounded(image).to_rgb8()
}

/// Global histogram equalization in-place.
///
/// Maps each intensity through the normalized cumulative histogram, starting
/// from the first populated bin. Constant images are left unchanged.
pub fn equalize_histogram(gray: &mut GrayImage) {
    let total = gray.as_raw().len();
    if total == 0 {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let Some(first) = hist.iter().position(|&c| c > 0) else {
        return;
    };
    if hist[first] == total {
        return;
    }

    let scale = 255.0 / (total - hist[first]) as f32;
    let mut lut = [0u8; 256];
    let mut sum = 0usize;
    for i in (first + 1)..256 {
        sum += hist[i];
        lut[i] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Copy a grayscale image into a rows×cols float matrix.
pub fn gray_to_matrix(gray: &GrayImage) -> Array2<f32> {
    let (w, h) = gray.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        gray.get_pixel(x as u32, y as u32).0[0] as f32
    })
}

/// Nearest-neighbour resize of a matrix.
pub fn resize_nearest(src: &Array2<f32>, rows: usize, cols: usize) -> Array2<f32> {
    let (src_rows, src_cols) = src.dim();
    if (src_rows, src_cols) == (rows, cols) {
        return src.clone();
    }
    if src_rows == 0 || src_cols == 0 {
        return Array2::zeros((rows, cols));
    }
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        let sy = (y * src_rows / rows.max(1)).min(src_rows - 1);
        let sx = (x * src_cols / cols.max(1)).min(src_cols - 1);
        src[[sy, sx]]
    })
}
