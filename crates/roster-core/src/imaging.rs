//! Image access: loading, validation, face region extraction, enhancement.
//!
//! Everything downstream of this module works on single-channel `GrayImage`
//! buffers; colour only survives in [`enhance`] and [`resize_to_fit`].

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Pixel};
use std::path::Path;
use thiserror::Error;

/// Extensions accepted during dataset discovery (compared case-insensitively).
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "bmp"];

/// Side length of a normalized face region.
pub const NORMALIZED_SIZE: u32 = 100;

/// Padding added around a detected box before cropping a training region.
pub const DEFAULT_PADDING: u32 = 20;

const MIN_IMAGE_SIDE: u32 = 50;
const MAX_IMAGE_SIDE: u32 = 4000;

const CLAHE_CLIP_LIMIT: f32 = 2.0;
const CLAHE_TILES: u32 = 8;

/// 3×3 kernel with OpenCV's automatic sigma: 0.3 * ((3 - 1) * 0.5 - 1) + 0.8.
const PREPROCESS_BLUR_SIGMA: f32 = 0.8;

const FIT_MAX_WIDTH: u32 = 800;
const FIT_MAX_HEIGHT: u32 = 600;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// Why [`validate`] rejected an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("image is missing")]
    Missing,
    #[error("invalid image dimensions: {0}-D")]
    Dimensions(usize),
    #[error("image too small: {width}x{height} (minimum 50x50 pixels)")]
    TooSmall { width: u32, height: u32 },
    #[error("image too large: {width}x{height} (maximum 4000x4000 pixels)")]
    TooLarge { width: u32, height: u32 },
}

/// Load an image from disk.
///
/// The file is read into memory first and decoded from the buffer, with the
/// format guessed from content rather than from the extension. Paths are
/// handled as `OsStr`, so non-ASCII names work on every platform.
pub fn load(path: &Path) -> Result<DynamicImage, ImageError> {
    let bytes = std::fs::read(path).map_err(|source| ImageError::Read {
        path: path.display().to_string(),
        source,
    })?;
    image::load_from_memory(&bytes).map_err(|source| ImageError::Decode {
        path: path.display().to_string(),
        source,
    })
}

/// True if the file name carries one of [`SUPPORTED_EXTENSIONS`].
pub fn is_supported_image(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Check that an image is usable for recognition.
///
/// Advisory only: callers decide whether a rejection short-circuits.
pub fn validate(image: Option<&DynamicImage>) -> Result<(), Rejection> {
    let image = image.ok_or(Rejection::Missing)?;
    validate_shape(&shape_of(image))
}

/// Validate a `[height, width]` or `[height, width, channels]` shape.
pub fn validate_shape(shape: &[usize]) -> Result<(), Rejection> {
    if !(2..=3).contains(&shape.len()) {
        return Err(Rejection::Dimensions(shape.len()));
    }
    let height = shape[0].min(u32::MAX as usize) as u32;
    let width = shape[1].min(u32::MAX as usize) as u32;

    if width < MIN_IMAGE_SIDE || height < MIN_IMAGE_SIDE {
        return Err(Rejection::TooSmall { width, height });
    }
    if width > MAX_IMAGE_SIDE || height > MAX_IMAGE_SIDE {
        return Err(Rejection::TooLarge { width, height });
    }
    Ok(())
}

/// Array-style shape of a decoded image. Single-channel images are 2-D.
pub fn shape_of(image: &DynamicImage) -> Vec<usize> {
    let h = image.height() as usize;
    let w = image.width() as usize;
    match image.color().channel_count() {
        1 => vec![h, w],
        c => vec![h, w, c as usize],
    }
}

pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    image.to_luma8()
}

/// Crop a padded region around `face` and normalize it to `size`×`size`.
///
/// The padded rectangle is clamped to the image, so boxes touching or
/// overhanging an edge still produce a full-size region.
pub fn extract_region(gray: &GrayImage, face: &FaceBox, padding: u32, size: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let x1 = face.x.saturating_sub(padding);
    let y1 = face.y.saturating_sub(padding);
    let x2 = face.x.saturating_add(face.width).saturating_add(padding).min(w);
    let y2 = face.y.saturating_add(face.height).saturating_add(padding).min(h);
    crop_normalized(gray, x1, y1, x2, y2, size)
}

/// Crop exactly `face` (no padding) and normalize it. Used at inference time.
pub fn crop_region(gray: &GrayImage, face: &FaceBox, size: u32) -> GrayImage {
    extract_region(gray, face, 0, size)
}

fn crop_normalized(gray: &GrayImage, x1: u32, y1: u32, x2: u32, y2: u32, size: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return GrayImage::new(size, size);
    }
    // Keep at least one pixel inside the image even for degenerate boxes.
    let x1 = x1.min(w - 1);
    let y1 = y1.min(h - 1);
    let x2 = x2.max(x1 + 1).min(w);
    let y2 = y2.max(y1 + 1).min(h);

    let crop = imageops::crop_imm(gray, x1, y1, x2 - x1, y2 - y1).to_image();
    normalize(&crop, size)
}

/// Resize a region to `size`×`size`.
///
/// Pure downscales use area averaging; anything else goes through bilinear.
pub fn normalize(region: &GrayImage, size: u32) -> GrayImage {
    let (w, h) = region.dimensions();
    if w == size && h == size {
        return region.clone();
    }
    if w >= size && h >= size {
        resize_area(region, size, size)
    } else {
        imageops::resize(region, size, size, FilterType::Triangle)
    }
}

/// Area-averaging resize: each output pixel is the coverage-weighted mean of
/// the source pixels under its footprint.
pub fn resize_area<P>(src: &ImageBuffer<P, Vec<u8>>, out_w: u32, out_h: u32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (sw, sh) = src.dimensions();
    let mut out = ImageBuffer::<P, Vec<u8>>::new(out_w, out_h);
    if sw == 0 || sh == 0 || out_w == 0 || out_h == 0 {
        return out;
    }

    let channels = P::CHANNEL_COUNT as usize;
    let scale_x = sw as f32 / out_w as f32;
    let scale_y = sh as f32 / out_h as f32;
    let mut acc = vec![0.0f32; channels];

    for oy in 0..out_h {
        let fy0 = oy as f32 * scale_y;
        let fy1 = fy0 + scale_y;
        for ox in 0..out_w {
            let fx0 = ox as f32 * scale_x;
            let fx1 = fx0 + scale_x;
            acc.iter_mut().for_each(|a| *a = 0.0);
            let mut total = 0.0f32;

            let mut sy = fy0.floor() as u32;
            while (sy as f32) < fy1 && sy < sh {
                let wy = (fy1.min(sy as f32 + 1.0) - fy0.max(sy as f32)).max(0.0);
                let mut sx = fx0.floor() as u32;
                while (sx as f32) < fx1 && sx < sw {
                    let wx = (fx1.min(sx as f32 + 1.0) - fx0.max(sx as f32)).max(0.0);
                    let weight = wx * wy;
                    for (a, &c) in acc.iter_mut().zip(src.get_pixel(sx, sy).channels()) {
                        *a += c as f32 * weight;
                    }
                    total += weight;
                    sx += 1;
                }
                sy += 1;
            }

            if total > 0.0 {
                let px = out.get_pixel_mut(ox, oy);
                for (c, a) in px.channels_mut().iter_mut().zip(acc.iter()) {
                    *c = (a / total).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    out
}

/// Histogram equalization followed by a light 3×3 Gaussian blur.
pub fn preprocess(gray: &GrayImage) -> GrayImage {
    let equalized = imageproc::contrast::equalize_histogram(gray);
    imageproc::filter::gaussian_blur_f32(&equalized, PREPROCESS_BLUR_SIGMA)
}

/// Shrink an image to fit within 800×600, preserving aspect ratio.
/// Images that already fit are returned unchanged.
pub fn resize_to_fit(image: &DynamicImage) -> DynamicImage {
    resize_within(image, FIT_MAX_WIDTH, FIT_MAX_HEIGHT)
}

pub fn resize_within(image: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return image.clone();
    }
    let scale = (max_width as f32 / w as f32).min(max_height as f32 / h as f32);
    if scale >= 1.0 {
        return image.clone();
    }
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);

    match image {
        DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(resize_area(gray, new_w, new_h)),
        other => DynamicImage::ImageRgb8(resize_area(&other.to_rgb8(), new_w, new_h)),
    }
}

/// Boost local contrast with CLAHE on the luminance.
///
/// Colour images keep their chroma: each RGB pixel is rescaled by the ratio
/// between its enhanced and original luma.
pub fn enhance(image: &DynamicImage) -> DynamicImage {
    let mut luma = image.to_luma8();
    let original = luma.clone();
    clahe_enhance(&mut luma, CLAHE_TILES, CLAHE_CLIP_LIMIT);

    if image.color().channel_count() <= 2 {
        return DynamicImage::ImageLuma8(luma);
    }

    let mut rgb = image.to_rgb8();
    for (x, y, px) in rgb.enumerate_pixels_mut() {
        let before = original.get_pixel(x, y)[0] as f32;
        let after = luma.get_pixel(x, y)[0] as f32;
        let ratio = if before > 0.0 { after / before } else { 1.0 };
        for c in px.0.iter_mut() {
            *c = if before > 0.0 {
                (*c as f32 * ratio).round().clamp(0.0, 255.0) as u8
            } else {
                after as u8
            };
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

/// Contrast-Limited Adaptive Histogram Equalization in place.
///
/// `clip_limit` follows the OpenCV convention: a multiple of the mean bin
/// height of a tile histogram.
pub fn clahe_enhance(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (width, height) = gray.dimensions();
    let w = width as usize;
    let h = height as usize;
    let t = tiles.max(1) as usize;
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist + u32::from(i < leftover);
            }

            let mut cdf = [0f32; 256];
            let mut running = 0f32;
            for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
                running += count as f32;
                *slot = running;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    // Bilinear blend between the four nearest tile mappings.
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;
        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let px = gray.get_pixel_mut(x as u32, y as u32);
            let v = px[0] as usize;
            let top = cdfs[r0 * t + c0][v] * (1.0 - dx) + cdfs[r0 * t + c1][v] * dx;
            let bot = cdfs[r1 * t + c0][v] * (1.0 - dx) + cdfs[r1 * t + c1][v] * dx;
            *px = Luma([(top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8]);
        }
    }
}
