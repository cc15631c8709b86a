//! 图片特征向量服务
//!
//! 拆分为以下子模块：
//! - `backend`: `EmbeddingBackend` trait 背后的预训练模型
//! - `preprocess`: 解码、缩放与随机增强
//! - `model`: EmbeddingService，串行化推理并归一化输出

mod backend;
mod model;
mod preprocess;
#[cfg(test)]
pub(crate) mod testing;

pub use backend::{EmbeddingBackend, FastEmbedBackend};
pub use model::{EmbeddingService, ExtractionMode};
pub use preprocess::Augmenter;
