//! 向量模型后端
//!
//! 后端把已缩放的 RGB 图片映射为原始向量，视为冻结的黑盒：
//! 输入尺寸固定，输出长度固定

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};
use image::{DynamicImage, RgbImage};

use crate::error::{AppError, AppResult, ResultExt};
use crate::services::EmbeddingConfig;

/// 预训练图片模型
/// 实现无需线程安全，服务层会串行化每次调用
pub trait EmbeddingBackend: Send {
    /// 写入特征库的模型标识
    fn name(&self) -> &str;

    /// 输出维度 D
    fn dimension(&self) -> usize;

    /// 每张输入图片一个原始向量，顺序与输入一致
    fn embed(&mut self, images: &[RgbImage]) -> AppResult<Vec<Vec<f32>>>;
}

/// `fastembed` ONNX 图片模型（默认 CLIP 视觉塔）
pub struct FastEmbedBackend {
    model: ImageEmbedding,
    name: String,
    dimension: usize,
}

impl FastEmbedBackend {
    pub fn new(config: &EmbeddingConfig) -> AppResult<Self> {
        let image_model: ImageEmbeddingModel = config
            .image_embedding_model
            .parse::<ImageEmbeddingModel>()
            .map_err(|e| AppError::Config(format!("unknown image model: {}", e)))?;
        let dimension = ImageEmbedding::get_model_info(&image_model).dim;

        tracing::info!(model = %config.image_embedding_model, dimension, "loading image embedding model");
        let model = ImageEmbedding::try_new(ImageInitOptions::new(image_model))
            .model_err("load image embedding model")?;

        Ok(Self {
            model,
            name: config.image_embedding_model.clone(),
            dimension,
        })
    }
}

impl EmbeddingBackend for FastEmbedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    // fastembed 会自行做模型要求的缩放和通道归一化
    fn embed(&mut self, images: &[RgbImage]) -> AppResult<Vec<Vec<f32>>> {
        let inputs = images
            .iter()
            .map(|image| DynamicImage::ImageRgb8(image.clone()))
            .collect();

        self.model.embed_images(inputs).model_err("image embedding")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 需要下载模型文件，CI 中跳过
    // 手动运行：cargo test -- --ignored
    #[test]
    #[ignore = "requires model files"]
    fn fastembed_width_comes_from_model() {
        let config = EmbeddingConfig::default();
        let mut backend = FastEmbedBackend::new(&config).unwrap();
        assert_eq!(backend.dimension(), 512);

        let frames = vec![
            RgbImage::from_pixel(224, 224, image::Rgb([200, 120, 40])),
            RgbImage::from_pixel(224, 224, image::Rgb([30, 90, 210])),
        ];
        let vectors = backend.embed(&frames).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == backend.dimension()));
        assert_ne!(vectors[0], vectors[1]);
    }
}
