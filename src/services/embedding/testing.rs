//! 测试用的确定性模型替身

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use image::RgbImage;
use tokio::sync::Notify;

use super::EmbeddingBackend;
use crate::error::{AppError, AppResult};

pub(crate) const QUADRANT_DIM: usize = 12;

/// 取图片四个象限的平均颜色，视觉上不同的合成图片得到不同的向量
pub(crate) struct QuadrantColorBackend {
    pub name: &'static str,
    /// 批次中任一图片左上角像素为该颜色时整批失败
    pub poison: Option<[u8; 3]>,
    /// 输出该长度的向量，而不是 `QUADRANT_DIM`
    pub output_len: Option<usize>,
    pub calls: Arc<AtomicUsize>,
    /// 每次调用都在此等待，直到闸门打开
    pub gate: Option<Arc<Gate>>,
}

impl QuadrantColorBackend {
    pub fn new() -> Self {
        Self {
            name: "test/quadrant-color",
            poison: None,
            output_len: None,
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }
}

impl EmbeddingBackend for QuadrantColorBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn dimension(&self) -> usize {
        QUADRANT_DIM
    }

    fn embed(&mut self, images: &[RgbImage]) -> AppResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass();
        }

        if let Some(poison) = self.poison {
            if images.iter().any(|img| near(img.get_pixel(0, 0).0, poison)) {
                return Err(AppError::Model("poisoned batch".to_string()));
            }
        }

        Ok(images
            .iter()
            .map(|img| {
                let mut v = quadrant_means(img);
                if let Some(len) = self.output_len {
                    v.resize(len, 0.5);
                }
                v
            })
            .collect())
    }
}

/// 让 blocking 线程上的推理停住，直到调用 `open`
#[derive(Default)]
pub(crate) struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    /// 每当有调用到达闸门时通知
    pub entered: Notify,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn pass(&self) {
        self.entered.notify_one();
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }
}

// 重采样可能让通道值偏移一两个单位
fn near(a: [u8; 3], b: [u8; 3]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x.abs_diff(*y) <= 2)
}

fn quadrant_means(image: &RgbImage) -> Vec<f32> {
    let (w, h) = image.dimensions();
    let mut sums = [[0.0_f32; 3]; 4];
    let mut counts = [0.0_f32; 4];
    for (x, y, pixel) in image.enumerate_pixels() {
        let q = (usize::from(y >= h / 2) << 1) | usize::from(x >= w / 2);
        counts[q] += 1.0;
        for c in 0..3 {
            sums[q][c] += pixel[c] as f32 / 255.0;
        }
    }
    sums.iter()
        .zip(counts.iter())
        .flat_map(|(sum, count)| sum.iter().map(move |s| s / count.max(1.0)))
        .collect()
}

/// 写出一张 32×32 图片，四个象限分别填充给定颜色
pub(crate) fn write_quadrant_image(path: &std::path::Path, colors: [[u8; 3]; 4]) {
    let image = RgbImage::from_fn(32, 32, |x, y| {
        let q = (usize::from(y >= 16) << 1) | usize::from(x >= 16);
        image::Rgb(colors[q])
    });
    image.save(path).unwrap();
}
