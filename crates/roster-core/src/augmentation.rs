//! Synthetic training variants for sparse per-person datasets.
//!
//! Each variant runs the full transform chain in a fixed order: rotation,
//! brightness, contrast, horizontal flip, Gaussian noise, translation. Every
//! draw comes from the caller's RNG, so a seeded generator gives repeatable
//! output.

use image::imageops;
use image::{GrayImage, Luma};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Ranges for every randomized transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationParams {
    /// Rotation angle in degrees.
    pub rotation_range: (f32, f32),
    /// Multiplicative brightness factor.
    pub brightness_range: (f32, f32),
    /// Contrast factor applied around mid-grey (127.5).
    pub contrast_range: (f32, f32),
    pub flip_probability: f64,
    /// Standard deviation of the additive noise, in intensity levels.
    pub noise_std: f32,
    /// Half-open integer shift range `[lo, hi)` in pixels, drawn per axis.
    pub translation_range: (i32, i32),
}

impl Default for AugmentationParams {
    fn default() -> Self {
        Self {
            rotation_range: (-15.0, 15.0),
            brightness_range: (0.7, 1.3),
            contrast_range: (0.8, 1.2),
            flip_probability: 0.5,
            noise_std: 5.0,
            translation_range: (-5, 5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Augmenter {
    params: AugmentationParams,
}

impl Augmenter {
    pub fn new(params: AugmentationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AugmentationParams {
        &self.params
    }

    /// Produce `count` synthetic variants using the thread-local RNG.
    ///
    /// The result has `count + 1` entries; entry 0 is an untouched copy of
    /// `region`.
    pub fn augment(&self, region: &GrayImage, count: usize) -> Vec<GrayImage> {
        self.augment_with(region, count, &mut rand::thread_rng())
    }

    pub fn augment_with<R: Rng + ?Sized>(
        &self,
        region: &GrayImage,
        count: usize,
        rng: &mut R,
    ) -> Vec<GrayImage> {
        let mut out = Vec::with_capacity(count + 1);
        out.push(region.clone());
        for _ in 0..count {
            out.push(self.variant(region, rng));
        }
        out
    }

    /// The original followed by each transform applied on its own, in chain
    /// order. Useful for eyeballing the parameter ranges.
    pub fn preview_with<R: Rng + ?Sized>(&self, region: &GrayImage, rng: &mut R) -> Vec<GrayImage> {
        vec![
            region.clone(),
            self.rotate(region, rng),
            self.brighten(region, rng),
            self.contrast(region, rng),
            self.maybe_flip(region, rng),
            self.add_noise(region, rng),
            self.translate(region, rng),
        ]
    }

    fn variant<R: Rng + ?Sized>(&self, region: &GrayImage, rng: &mut R) -> GrayImage {
        let img = self.rotate(region, rng);
        let img = self.brighten(&img, rng);
        let img = self.contrast(&img, rng);
        let img = self.maybe_flip(&img, rng);
        let img = self.add_noise(&img, rng);
        self.translate(&img, rng)
    }

    fn rotate<R: Rng + ?Sized>(&self, img: &GrayImage, rng: &mut R) -> GrayImage {
        let angle = uniform(rng, self.params.rotation_range);
        rotate_reflect(img, angle)
    }

    fn brighten<R: Rng + ?Sized>(&self, img: &GrayImage, rng: &mut R) -> GrayImage {
        let factor = uniform(rng, self.params.brightness_range);
        map_pixels(img, |v| v * factor)
    }

    fn contrast<R: Rng + ?Sized>(&self, img: &GrayImage, rng: &mut R) -> GrayImage {
        let factor = uniform(rng, self.params.contrast_range);
        map_pixels(img, |v| (v - 127.5) * factor + 127.5)
    }

    fn maybe_flip<R: Rng + ?Sized>(&self, img: &GrayImage, rng: &mut R) -> GrayImage {
        if rng.gen::<f64>() < self.params.flip_probability {
            imageops::flip_horizontal(img)
        } else {
            img.clone()
        }
    }

    fn add_noise<R: Rng + ?Sized>(&self, img: &GrayImage, rng: &mut R) -> GrayImage {
        let std = self.params.noise_std;
        let mut out = img.clone();
        for px in out.pixels_mut() {
            // Truncated to integer levels before adding, then clamped.
            let noise = (gaussian(rng) * std) as i16;
            px[0] = (px[0] as i16 + noise).clamp(0, 255) as u8;
        }
        out
    }

    fn translate<R: Rng + ?Sized>(&self, img: &GrayImage, rng: &mut R) -> GrayImage {
        let tx = uniform_int(rng, self.params.translation_range);
        let ty = uniform_int(rng, self.params.translation_range);
        translate_reflect(img, tx, ty)
    }
}

/// Uniform draw in `[lo, hi)`; collapses to `lo` for an empty range.
fn uniform<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo { rng.gen_range(lo..hi) } else { lo }
}

fn uniform_int<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (i32, i32)) -> i32 {
    if hi > lo { rng.gen_range(lo..hi) } else { lo }
}

/// Standard normal sample via Box-Muller.
fn gaussian<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = 1.0 - rng.gen::<f32>(); // (0, 1], keeps ln finite
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

fn map_pixels(img: &GrayImage, f: impl Fn(f32) -> f32) -> GrayImage {
    let mut out = img.clone();
    for px in out.pixels_mut() {
        px[0] = f(px[0] as f32).clamp(0.0, 255.0) as u8;
    }
    out
}

/// Mirror an out-of-range index back into `[0, n)`, repeating the edge
/// pixel (`fedcba|abcdef|fedcba`).
pub(crate) fn reflect(i: i64, n: i64) -> i64 {
    if n <= 1 {
        return 0;
    }
    let period = 2 * n;
    let m = i.rem_euclid(period);
    if m >= n { period - 1 - m } else { m }
}

/// Rotate by `angle_deg` (counter-clockwise) about the integer centre
/// `(w / 2, h / 2)`, sampling bilinearly with reflected borders.
pub fn rotate_reflect(img: &GrayImage, angle_deg: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let cx = (w / 2) as f32;
    let cy = (h / 2) as f32;

    let sample = |x: i64, y: i64| -> f32 {
        let sx = reflect(x, w as i64) as u32;
        let sy = reflect(y, h as i64) as u32;
        img.get_pixel(sx, sy)[0] as f32
    };

    GrayImage::from_fn(w, h, |ox, oy| {
        // Inverse map: output pixel back into the source.
        let dx = ox as f32 - cx;
        let dy = oy as f32 - cy;
        let sx = cx + cos * dx - sin * dy;
        let sy = cy + sin * dx + cos * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + sample(x0 + 1, y0) * fx * (1.0 - fy)
            + sample(x0, y0 + 1) * (1.0 - fx) * fy
            + sample(x0 + 1, y0 + 1) * fx * fy;

        Luma([val.round().clamp(0.0, 255.0) as u8])
    })
}

/// Shift content by `(tx, ty)` pixels, filling the uncovered edge by reflection.
pub fn translate_reflect(img: &GrayImage, tx: i32, ty: i32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    GrayImage::from_fn(w, h, |x, y| {
        let sx = reflect(x as i64 - tx as i64, w as i64) as u32;
        let sy = reflect(y as i64 - ty as i64, h as i64) as u32;
        *img.get_pixel(sx, sy)
    })
}
