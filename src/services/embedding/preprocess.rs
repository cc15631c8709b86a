//! 解码、缩放与随机增强

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{AppResult, ResultExt};
use crate::services::AugmentationConfig;

pub fn decode_path(path: &Path) -> AppResult<DynamicImage> {
    image::open(path).extraction_err(&format!("decode {}", path.display()))
}

pub fn decode_bytes(bytes: &[u8]) -> AppResult<DynamicImage> {
    image::load_from_memory(bytes).extraction_err("decode image bytes")
}

/// 缩放为模型输入尺寸的正方形，丢弃 alpha 通道
pub fn resize_rgb(image: &DynamicImage, size: u32) -> RgbImage {
    image.resize_exact(size, size, FilterType::Triangle).to_rgb8()
}

/// 随机翻转，外加亮度/对比度/饱和度/色相抖动
pub struct Augmenter {
    config: AugmentationConfig,
    rng: Mutex<StdRng>,
}

struct Jitter {
    flip_horizontal: bool,
    flip_vertical: bool,
    brightness: f32,
    contrast: f32,
    saturation: f32,
    hue: f32,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    fn sample(&self) -> Jitter {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let cfg = &self.config;
        Jitter {
            flip_horizontal: cfg.flip_horizontal && rng.gen_bool(0.5),
            flip_vertical: cfg.flip_vertical && rng.gen_bool(0.5),
            brightness: symmetric(&mut *rng, cfg.brightness_max_delta),
            contrast: within(&mut *rng, cfg.contrast_range),
            saturation: within(&mut *rng, cfg.saturation_range),
            hue: symmetric(&mut *rng, cfg.hue_max_delta),
        }
    }

    pub fn apply(&self, image: &mut RgbImage) {
        let jitter = self.sample();

        if jitter.flip_horizontal {
            imageops::flip_horizontal_in_place(image);
        }
        if jitter.flip_vertical {
            imageops::flip_vertical_in_place(image);
        }
        adjust_color(image, jitter.brightness, jitter.contrast, jitter.saturation);

        let degrees = (jitter.hue * 360.0).round() as i32;
        if degrees != 0 {
            *image = imageops::huerotate(&*image, degrees);
        }
    }
}

fn symmetric<R: Rng>(rng: &mut R, max_delta: f32) -> f32 {
    if !max_delta.is_finite() || max_delta <= 0.0 {
        return 0.0;
    }
    rng.gen_range(-max_delta..=max_delta)
}

fn within<R: Rng>(rng: &mut R, (a, b): (f32, f32)) -> f32 {
    if !a.is_finite() || !b.is_finite() {
        return 1.0;
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    rng.gen_range(lo..=hi)
}

/// 先调亮度，再围绕各通道均值调对比度，最后围绕亮度调饱和度
/// 在 `[0, 1]` 区间内计算
fn adjust_color(image: &mut RgbImage, brightness: f32, contrast: f32, saturation: f32) {
    let pixel_count = (image.width() as usize) * (image.height() as usize);
    if pixel_count == 0 {
        return;
    }

    let mut means = [0.0_f32; 3];
    for pixel in image.pixels() {
        for (c, mean) in means.iter_mut().enumerate() {
            *mean += (pixel[c] as f32 / 255.0 + brightness).clamp(0.0, 1.0);
        }
    }
    for mean in means.iter_mut() {
        *mean /= pixel_count as f32;
    }

    for pixel in image.pixels_mut() {
        let mut rgb = [0.0_f32; 3];
        for c in 0..3 {
            let v = (pixel[c] as f32 / 255.0 + brightness).clamp(0.0, 1.0);
            rgb[c] = ((v - means[c]) * contrast + means[c]).clamp(0.0, 1.0);
        }
        let luma = 0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2];
        for c in 0..3 {
            let v = (luma + (rgb[c] - luma) * saturation).clamp(0.0, 1.0);
            pixel[c] = (v * 255.0).round() as u8;
        }
    }
}
