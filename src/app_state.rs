use std::sync::Arc;
use std::time::Duration;

use crate::error::AppResult;
use crate::services::{
    CorpusBuilder, EmbeddingBackend, EmbeddingService, EngineConfig, SearchService, StoreCache,
};

/// 全局应用状态，每个进程构建一次，通过 `Arc` 共享
///
/// 建库与检索共用同一个模型实例和特征库缓存，构建完成后下一次检索无需重新加载即可看到新库
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub embedding: Arc<EmbeddingService>,
    pub store: Arc<StoreCache>,
    pub builder: Arc<CorpusBuilder>,
    pub search: Arc<SearchService>,
}

impl AppState {
    /// 加载配置中的预训练模型
    pub fn new(config: EngineConfig) -> AppResult<Self> {
        let embedding = EmbeddingService::new(&config)?;
        Ok(Self::assemble(config, embedding))
    }

    pub fn with_backend(config: EngineConfig, backend: Box<dyn EmbeddingBackend>) -> Self {
        let embedding = EmbeddingService::with_backend(backend, &config);
        Self::assemble(config, embedding)
    }

    fn assemble(config: EngineConfig, embedding: EmbeddingService) -> Self {
        let embedding = Arc::new(embedding);
        let store = Arc::new(StoreCache::new(config.store_path()));
        let builder = Arc::new(CorpusBuilder::new(embedding.clone(), store.clone()));
        let search = Arc::new(SearchService::new(
            embedding.clone(),
            store.clone(),
            Duration::from_millis(config.search.scan_timeout_ms),
        ));

        Self {
            config: Arc::new(config),
            embedding,
            store,
            builder,
            search,
        }
    }
}
