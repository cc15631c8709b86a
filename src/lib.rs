//! 动物照片以图搜图
//!
//! 图片经预训练模型转为单位长度的向量，带标签的语料向量持久化为特征库，
//! 查询时与库中每个向量比较，按余弦、欧氏距离倒数和相关系数的加权和排序。

mod app_state;
mod error;
pub mod services;
pub mod utils;

pub use app_state::AppState;
pub use error::{AppError, AppResult, ResultExt};
pub use services::{
    predicted_class, BuildReport, ConfigService, CorpusBuilder, EmbeddingService, EngineConfig,
    ExtractionMode, FeatureRecord, FeatureStore, SearchResult, SearchService, StoreCache,
};

/// 由 `RUST_LOG` 控制的 fmt subscriber，未设置时为 `info`
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
