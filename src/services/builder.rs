//! 离线建库：`root/<class>/<image>` -> 持久化特征库

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use serde::Serialize;
use tokio::sync::Mutex;

use super::embedding::{EmbeddingService, ExtractionMode};
use super::store::{save_store, FeatureRecord, FeatureStore, StoreCache};
use crate::error::{AppError, AppResult, ResultExt};
use crate::utils::{corpus_identity, list_class_dirs, list_class_images};

/// 单次构建的统计信息
#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub processed: usize,
    pub failed: usize,
    /// `AppError::PerImageBuild` 列表
    pub failures: Vec<AppError>,
    pub per_class: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
    pub store_path: PathBuf,
}

impl BuildReport {
    /// 每秒入库图片数
    pub fn throughput(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return self.processed as f64;
        }
        self.processed as f64 / (self.elapsed_ms as f64 / 1000.0)
    }
}

#[derive(Debug, Clone)]
struct CorpusItem {
    identity: String,
    class_label: String,
    path: PathBuf,
}

pub struct CorpusBuilder {
    embedding: Arc<EmbeddingService>,
    cache: Arc<StoreCache>,
    build_lock: Mutex<()>,
}

impl CorpusBuilder {
    pub fn new(embedding: Arc<EmbeddingService>, cache: Arc<StoreCache>) -> Self {
        Self {
            embedding,
            cache,
            build_lock: Mutex::new(()),
        }
    }

    /// 从 `corpus_root` 重建整个特征库
    ///
    /// 单张图片失败只计入报告；只有语料根目录不可用、参数非法或写盘失败才会中止。
    /// 新库落盘之前，检索看到的仍是旧库
    pub async fn build(
        &self,
        corpus_root: &Path,
        max_per_class: usize,
        batch_size: usize,
    ) -> AppResult<BuildReport> {
        if max_per_class == 0 {
            return Err(AppError::Validation("max_per_class must be positive".to_string()));
        }
        if batch_size == 0 {
            return Err(AppError::Validation("batch_size must be positive".to_string()));
        }

        let _running = self.build_lock.lock().await;
        let started = Instant::now();
        let mut failures = Vec::new();

        let items = collect_corpus(corpus_root, max_per_class, &mut failures)?;
        tracing::info!(
            corpus = %corpus_root.display(),
            images = items.len(),
            max_per_class,
            batch_size,
            "starting feature extraction"
        );

        let mut store = FeatureStore::new(self.embedding.model_name(), self.embedding.dimension());
        for batch in items.chunks(batch_size) {
            self.process_batch(batch, &mut store, &mut failures).await;
            tracing::info!(processed = store.len(), failed = failures.len(), "batch done");
        }

        let store = Arc::new(store);
        let path = self.cache.path().to_path_buf();
        let to_save = store.clone();
        let save_path = path.clone();
        tokio::task::spawn_blocking(move || save_store(&to_save, &save_path))
            .await
            .model_err("store write task")??;
        self.cache.replace(store.clone()).await;

        let report = BuildReport {
            processed: store.len(),
            failed: failures.len(),
            failures,
            per_class: store.class_counts(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            store_path: path,
        };
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            images_per_sec = report.throughput(),
            build_id = %store.build_id(),
            "feature extraction completed"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        batch: &[CorpusItem],
        store: &mut FeatureStore,
        failures: &mut Vec<AppError>,
    ) {
        let paths = batch.iter().map(|item| item.path.clone()).collect();
        let prepared = match self.embedding.prepare_paths(paths, ExtractionMode::Build).await {
            Ok(prepared) => prepared,
            Err(err) => {
                for item in batch {
                    record_failure(failures, item, &err);
                }
                return;
            }
        };

        let mut ready: Vec<&CorpusItem> = Vec::with_capacity(batch.len());
        let mut images: Vec<RgbImage> = Vec::with_capacity(batch.len());
        for (item, result) in batch.iter().zip(prepared) {
            match result {
                Ok(image) => {
                    ready.push(item);
                    images.push(image);
                }
                Err(err) => record_failure(failures, item, &err),
            }
        }
        if images.is_empty() {
            return;
        }

        let images: Arc<[RgbImage]> = Arc::from(images);
        match self.embedding.embed_prepared(images.clone()).await {
            Ok(vectors) => {
                for (item, vector) in ready.into_iter().zip(vectors) {
                    insert(store, failures, item, vector);
                }
            }
            Err(err) => {
                // 逐张重试，找出出错的图片
                tracing::warn!(error = %err, size = ready.len(), "batch inference failed, retrying per image");
                for (item, image) in ready.into_iter().zip(images.iter()) {
                    match self.embedding.embed_prepared(Arc::from(vec![image.clone()])).await {
                        Ok(mut vectors) => match vectors.pop() {
                            Some(vector) => insert(store, failures, item, vector),
                            None => record_failure(failures, item, &"no vector returned"),
                        },
                        Err(err) => record_failure(failures, item, &err),
                    }
                }
            }
        }
    }
}

fn insert(
    store: &mut FeatureStore,
    failures: &mut Vec<AppError>,
    item: &CorpusItem,
    vector: Vec<f32>,
) {
    let record = FeatureRecord {
        identity: item.identity.clone(),
        vector,
        class_label: item.class_label.clone(),
    };
    if let Err(err) = store.insert(record) {
        record_failure(failures, item, &err);
    }
}

fn record_failure(failures: &mut Vec<AppError>, item: &CorpusItem, reason: &dyn std::fmt::Display) {
    let err = AppError::PerImageBuild {
        identity: item.identity.clone(),
        reason: reason.to_string(),
    };
    tracing::warn!(error = %err, "skipping corpus image");
    failures.push(err);
}

fn skip_class(failures: &mut Vec<AppError>, identity: String, reason: String) {
    let err = AppError::PerImageBuild { identity, reason };
    tracing::warn!(error = %err, "skipping class directory");
    failures.push(err);
}

/// 按名称排序的类别，每类最多 `max_per_class` 张（同样排序）
fn collect_corpus(
    corpus_root: &Path,
    max_per_class: usize,
    failures: &mut Vec<AppError>,
) -> AppResult<Vec<CorpusItem>> {
    let class_dirs = list_class_dirs(corpus_root).map_err(|e| {
        AppError::Validation(format!("cannot read corpus {}: {}", corpus_root.display(), e))
    })?;
    if class_dirs.is_empty() {
        return Err(AppError::Validation(format!(
            "no class directories under {}",
            corpus_root.display()
        )));
    }

    let mut items = Vec::new();
    for class_dir in class_dirs {
        let class_label = match class_dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => {
                let identity = corpus_identity(corpus_root, &class_dir);
                skip_class(failures, identity, "class name is not valid UTF-8".to_string());
                continue;
            }
        };
        let images = match list_class_images(&class_dir, max_per_class) {
            Ok(images) => images,
            Err(err) => {
                skip_class(failures, class_label, err.to_string());
                continue;
            }
        };
        tracing::debug!(class = %class_label, images = images.len(), "processing class");
        items.extend(images.into_iter().map(|path| CorpusItem {
            identity: corpus_identity(corpus_root, &path),
            class_label: class_label.clone(),
            path,
        }));
    }
    Ok(items)
}
