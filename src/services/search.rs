//! 相似度检索：对缓存的特征库做全量扫描

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use super::embedding::{EmbeddingService, ExtractionMode};
use super::store::{FeatureStore, StoreCache};
use crate::error::{AppError, AppResult, ResultExt};
use crate::utils::similarity::combined_similarity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub identity: String,
    pub class_label: String,
    pub score: f32,
}

pub struct SearchService {
    embedding: Arc<EmbeddingService>,
    cache: Arc<StoreCache>,
    scan_timeout: Duration,
}

impl SearchService {
    pub fn new(embedding: Arc<EmbeddingService>, cache: Arc<StoreCache>, scan_timeout: Duration) -> Self {
        Self {
            embedding,
            cache,
            scan_timeout,
        }
    }

    /// 返回与 `query` 图片最相似的前 `top_k` 条
    ///
    /// 查询图片不可读、特征库缺失或损坏、超时等失败都会记录日志并返回空列表，
    /// 需要区分时改用 `try_search`
    pub async fn search(&self, query: &Path, top_k: usize) -> Vec<SearchResult> {
        absorb(self.try_search(query, top_k).await)
    }

    pub async fn search_bytes(&self, bytes: Vec<u8>, top_k: usize) -> Vec<SearchResult> {
        absorb(self.try_search_bytes(bytes, top_k).await)
    }

    pub async fn try_search(&self, query: &Path, top_k: usize) -> AppResult<Vec<SearchResult>> {
        let store = self.cache.snapshot().await?;
        let vector = self
            .embedding
            .extract_path(query, ExtractionMode::Query)
            .await?;
        self.rank(store, vector, top_k).await
    }

    pub async fn try_search_bytes(&self, bytes: Vec<u8>, top_k: usize) -> AppResult<Vec<SearchResult>> {
        let store = self.cache.snapshot().await?;
        let vector = self
            .embedding
            .extract_bytes(bytes, ExtractionMode::Query)
            .await?;
        self.rank(store, vector, top_k).await
    }

    async fn rank(
        &self,
        store: Arc<FeatureStore>,
        query: Vec<f32>,
        top_k: usize,
    ) -> AppResult<Vec<SearchResult>> {
        if store.model() != self.embedding.model_name() {
            return Err(AppError::StoreLoad(format!(
                "store was built with model {} but queries use {}",
                store.model(),
                self.embedding.model_name()
            )));
        }
        if query.len() != store.dimension() {
            return Err(AppError::StoreLoad(format!(
                "query dimension {} does not match store dimension {} (model {})",
                query.len(),
                store.dimension(),
                store.model()
            )));
        }

        let scan = tokio::task::spawn_blocking(move || rank_records(&store, &query, top_k));
        match timeout(self.scan_timeout, scan).await {
            Ok(joined) => joined.model_err("scan task"),
            Err(_) => Err(AppError::Timeout {
                operation: "similarity scan",
                millis: self.scan_timeout.as_millis() as u64,
            }),
        }
    }
}

fn absorb(result: AppResult<Vec<SearchResult>>) -> Vec<SearchResult> {
    match result {
        Ok(results) => results,
        Err(err) => {
            tracing::warn!(error = %err, "search failed, returning no matches");
            Vec::new()
        }
    }
}

/// 对每条记录打分并保留前 `top_k` 条
///
/// 稳定排序：分数相同的记录保持入库顺序
pub fn rank_records(store: &FeatureStore, query: &[f32], top_k: usize) -> Vec<SearchResult> {
    if top_k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f32)> = store
        .records()
        .iter()
        .enumerate()
        .map(|(slot, record)| (slot, combined_similarity(query, &record.vector)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    scored
        .into_iter()
        .take(top_k)
        .map(|(slot, score)| {
            let record = &store.records()[slot];
            SearchResult {
                identity: record.identity.clone(),
                class_label: record.class_label.clone(),
                score,
            }
        })
        .collect()
}

/// `results` 中总分最高的类别，平分时取先出现的类别
pub fn predicted_class(results: &[SearchResult]) -> Option<String> {
    let mut totals: Vec<(&str, f32)> = Vec::new();
    for result in results {
        match totals.iter_mut().find(|(label, _)| *label == result.class_label) {
            Some((_, total)) => *total += result.score,
            None => totals.push((result.class_label.as_str(), result.score)),
        }
    }

    let mut best: Option<(&str, f32)> = None;
    for (label, total) in totals {
        if best.map_or(true, |(_, top)| total > top) {
            best = Some((label, total));
        }
    }
    best.map(|(label, _)| label.to_string())
}
