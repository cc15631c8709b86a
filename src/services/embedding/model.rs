//! EmbeddingService - 图片到单位向量

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, RgbImage};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::backend::{EmbeddingBackend, FastEmbedBackend};
use super::preprocess::{decode_bytes, decode_path, resize_rgb, Augmenter};
use crate::error::{AppError, AppResult, ResultExt};
use crate::services::EngineConfig;
use crate::utils::similarity::l2_normalize;

/// 推理前是否允许随机增强
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    /// 构建参考库；`build.augment` 开启时做增强
    Build,
    /// 在线查询，从不增强
    Query,
}

/// 持有进程内唯一的模型实例
///
/// 后端放在异步 Mutex 中，推理在持锁状态下跑在 blocking 线程池上，
/// 并发调用因此串行执行
pub struct EmbeddingService {
    backend: Arc<Mutex<Box<dyn EmbeddingBackend>>>,
    augmenter: Arc<Augmenter>,
    model_name: String,
    dimension: usize,
    input_size: u32,
    augment_build: bool,
    inference_timeout: Duration,
}

impl EmbeddingService {
    pub fn new(config: &EngineConfig) -> AppResult<Self> {
        let backend = FastEmbedBackend::new(&config.embedding)?;
        Ok(Self::with_backend(Box::new(backend), config))
    }

    pub fn with_backend(backend: Box<dyn EmbeddingBackend>, config: &EngineConfig) -> Self {
        Self {
            model_name: backend.name().to_string(),
            dimension: backend.dimension(),
            backend: Arc::new(Mutex::new(backend)),
            augmenter: Arc::new(Augmenter::new(config.augmentation.clone())),
            input_size: config.embedding.input_size.max(1),
            augment_build: config.build.augment,
            inference_timeout: Duration::from_millis(config.search.inference_timeout_ms),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn augments(&self, mode: ExtractionMode) -> bool {
        mode == ExtractionMode::Build && self.augment_build
    }

    pub async fn extract_path(&self, path: &Path, mode: ExtractionMode) -> AppResult<Vec<f32>> {
        let mut prepared = self.prepare_paths(vec![path.to_path_buf()], mode).await?;
        let image = prepared
            .pop()
            .ok_or_else(|| AppError::Extraction("no image prepared".to_string()))??;
        self.embed_single(image).await
    }

    pub async fn extract_bytes(&self, bytes: Vec<u8>, mode: ExtractionMode) -> AppResult<Vec<f32>> {
        let augmenter = self.augments(mode).then(|| self.augmenter.clone());
        let size = self.input_size;
        let image = tokio::task::spawn_blocking(move || {
            let decoded = decode_bytes(&bytes)?;
            Ok::<_, AppError>(prepare(&decoded, size, augmenter.as_deref()))
        })
        .await
        .extraction_err("preprocess task")??;
        self.embed_single(image).await
    }

    /// 逐个解码、缩放（构建模式下再增强）
    /// 每个输入对应一个结果，坏文件只影响自己
    pub async fn prepare_paths(
        &self,
        paths: Vec<PathBuf>,
        mode: ExtractionMode,
    ) -> AppResult<Vec<AppResult<RgbImage>>> {
        let augmenter = self.augments(mode).then(|| self.augmenter.clone());
        let size = self.input_size;
        tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .map(|path| -> AppResult<RgbImage> {
                    let decoded = decode_path(path)?;
                    Ok(prepare(&decoded, size, augmenter.as_deref()))
                })
                .collect::<Vec<_>>()
        })
        .await
        .extraction_err("preprocess task")
    }

    async fn embed_single(&self, image: RgbImage) -> AppResult<Vec<f32>> {
        self.embed_prepared(Arc::from(vec![image]))
            .await?
            .pop()
            .ok_or_else(|| AppError::Model("image embedding returned no vectors".to_string()))
    }

    /// 整批只调用一次后端，然后做 L2 归一化
    pub async fn embed_prepared(&self, images: Arc<[RgbImage]>) -> AppResult<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let expected = images.len();

        // 超时同时覆盖等锁和推理
        let backend = self.backend.clone();
        let inference = async move {
            let guard = backend.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                let mut model = guard;
                model.embed(&images)
            })
            .await
        };
        let raw = match timeout(self.inference_timeout, inference).await {
            Ok(joined) => joined.model_err("inference task")??,
            Err(_) => {
                return Err(AppError::Timeout {
                    operation: "embedding inference",
                    millis: self.inference_timeout.as_millis() as u64,
                })
            }
        };

        if raw.len() != expected {
            return Err(AppError::Model(format!(
                "embedding result count mismatch: expected {}, got {}",
                expected,
                raw.len()
            )));
        }

        raw.into_iter()
            .map(|mut vector| {
                if vector.len() != self.dimension {
                    return Err(AppError::Model(format!(
                        "embedding dimension mismatch: expected {}, got {}",
                        self.dimension,
                        vector.len()
                    )));
                }
                if vector.iter().any(|v| !v.is_finite()) {
                    return Err(AppError::Model("embedding contains non-finite values".to_string()));
                }
                l2_normalize(&mut vector);
                Ok(vector)
            })
            .collect()
    }
}

fn prepare(image: &DynamicImage, size: u32, augmenter: Option<&Augmenter>) -> RgbImage {
    let mut resized = resize_rgb(image, size);
    if let Some(augmenter) = augmenter {
        augmenter.apply(&mut resized);
    }
    resized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::embedding::testing::{
        write_quadrant_image, QuadrantColorBackend, QUADRANT_DIM,
    };
    use tempfile::tempdir;

    fn test_config(augment: bool) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.embedding.input_size = 16;
        config.build.augment = augment;
        config.augmentation.seed = Some(11);
        config
    }

    const SAMPLE: [[u8; 3]; 4] = [[200, 40, 40], [40, 200, 40], [40, 40, 200], [220, 220, 60]];

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[tokio::test]
    async fn extract_returns_unit_vector_of_model_dimension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cat.png");
        write_quadrant_image(&path, SAMPLE);

        let service =
            EmbeddingService::with_backend(Box::new(QuadrantColorBackend::new()), &test_config(true));
        for mode in [ExtractionMode::Query, ExtractionMode::Build] {
            let vector = service.extract_path(&path, mode).await.unwrap();
            assert_eq!(vector.len(), QUADRANT_DIM);
            assert!((norm(&vector) - 1.0).abs() < 1e-4);
        }
    }

    #[tokio::test]
    async fn query_mode_is_deterministic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cat.png");
        write_quadrant_image(&path, SAMPLE);

        let service =
            EmbeddingService::with_backend(Box::new(QuadrantColorBackend::new()), &test_config(true));
        let first = service.extract_path(&path, ExtractionMode::Query).await.unwrap();
        let second = service.extract_path(&path, ExtractionMode::Query).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn build_mode_augments_when_enabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cat.png");
        write_quadrant_image(&path, SAMPLE);

        let service =
            EmbeddingService::with_backend(Box::new(QuadrantColorBackend::new()), &test_config(true));
        let query = service.extract_path(&path, ExtractionMode::Query).await.unwrap();
        let mut differs = false;
        for _ in 0..6 {
            let built = service.extract_path(&path, ExtractionMode::Build).await.unwrap();
            differs |= built != query;
        }
        assert!(differs);
    }

    #[tokio::test]
    async fn path_and_bytes_agree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cat.png");
        write_quadrant_image(&path, SAMPLE);

        let service =
            EmbeddingService::with_backend(Box::new(QuadrantColorBackend::new()), &test_config(false));
        let from_path = service.extract_path(&path, ExtractionMode::Query).await.unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let from_bytes = service.extract_bytes(bytes, ExtractionMode::Query).await.unwrap();
        assert_eq!(from_path, from_bytes);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_extraction_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"\xff\xd8 truncated").unwrap();

        let service =
            EmbeddingService::with_backend(Box::new(QuadrantColorBackend::new()), &test_config(false));
        let err = service.extract_path(&path, ExtractionMode::Query).await.unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));

        let missing = service
            .extract_path(&dir.path().join("nope.png"), ExtractionMode::Query)
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::Extraction(_)));
    }

    #[tokio::test]
    async fn wrong_output_width_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cat.png");
        write_quadrant_image(&path, SAMPLE);

        let mut backend = QuadrantColorBackend::new();
        backend.output_len = Some(QUADRANT_DIM + 3);
        let service = EmbeddingService::with_backend(Box::new(backend), &test_config(false));
        let err = service.extract_path(&path, ExtractionMode::Query).await.unwrap_err();
        assert!(matches!(err, AppError::Model(_)));
    }

    #[tokio::test]
    async fn batch_uses_one_backend_call() {
        let dir = tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..4u8 {
            let path = dir.path().join(format!("{i}.png"));
            write_quadrant_image(&path, [[i * 40 + 10, 30, 30], SAMPLE[1], SAMPLE[2], SAMPLE[3]]);
            paths.push(path);
        }

        let backend = QuadrantColorBackend::new();
        let calls = backend.calls.clone();
        let service = EmbeddingService::with_backend(Box::new(backend), &test_config(false));

        let prepared: Vec<RgbImage> = service
            .prepare_paths(paths, ExtractionMode::Build)
            .await
            .unwrap()
            .into_iter()
            .collect::<AppResult<_>>()
            .unwrap();
        let vectors = service.embed_prepared(Arc::from(prepared)).await.unwrap();

        assert_eq!(vectors.len(), 4);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
