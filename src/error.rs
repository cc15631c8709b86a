//! 统一错误类型定义
//!
//! `AppError` 覆盖引擎的所有失败路径，`AppResult` 为全局结果类型别名。

use serde::Serialize;
use thiserror::Error;

/// 引擎统一错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 图片不可读、损坏或格式不支持
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// 持久化特征库缺失或损坏
    #[error("feature store unavailable: {0}")]
    StoreLoad(String),

    /// 建库时单张语料图片失败
    #[error("failed to index {identity}: {reason}")]
    PerImageBuild { identity: String, reason: String },

    /// 向量模型拒绝输入或返回异常结果
    #[error("embedding model error: {0}")]
    Model(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("config error: {0}")]
    Config(String),

    /// 验证错误（输入参数不合法）
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: &'static str, millis: u64 },
}

// 序列化为 `{ "type": ..., "message": ... }`，供 JSON 输出使用
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("AppError", 2)?;

        let error_type = match self {
            AppError::Extraction(_) => "extraction",
            AppError::StoreLoad(_) => "store_load",
            AppError::PerImageBuild { .. } => "per_image_build",
            AppError::Model(_) => "model",
            AppError::Io(_) => "io",
            AppError::Json(_) => "json",
            AppError::Image(_) => "image",
            AppError::Config(_) => "config",
            AppError::Validation(_) => "validation",
            AppError::Timeout { .. } => "timeout",
        };
        state.serialize_field("type", error_type)?;
        state.serialize_field("message", &self.to_string())?;

        state.end()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// 将外部错误转换为 `AppError` 的辅助方法
pub trait ResultExt<T> {
    fn extraction_err(self, msg: &str) -> AppResult<T>;

    fn store_err(self, msg: &str) -> AppResult<T>;

    fn config_err(self, msg: &str) -> AppResult<T>;

    fn model_err(self, msg: &str) -> AppResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn extraction_err(self, msg: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Extraction(format!("{}: {}", msg, e)))
    }

    fn store_err(self, msg: &str) -> AppResult<T> {
        self.map_err(|e| AppError::StoreLoad(format!("{}: {}", msg, e)))
    }

    fn config_err(self, msg: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Config(format!("{}: {}", msg, e)))
    }

    fn model_err(self, msg: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Model(format!("{}: {}", msg, e)))
    }
}
