//! 引擎配置
//! 以明文 JSON 存储；文件不存在时使用默认值
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::{AppResult, ResultExt};

pub const CONFIG_VERSION: u32 = 1;
const CONFIG_FILE_NAME: &str = "config.json";
const STORE_FILE_NAME: &str = "image_features.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// fastembed 模型代码；向量维度由模型本身决定
    pub image_embedding_model: String,
    /// 增强和推理前图片缩放到的正方形边长
    pub input_size: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            image_embedding_model: "Qdrant/clip-ViT-B-32-vision".to_string(),
            input_size: 224,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub max_per_class: usize,
    pub batch_size: usize,
    /// 建库时增强语料图片；查询从不增强
    pub augment: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_per_class: 2000,
            batch_size: 8,
            augment: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub brightness_max_delta: f32,
    pub contrast_range: (f32, f32),
    pub saturation_range: (f32, f32),
    /// 色相旋转占一整圈的比例
    pub hue_max_delta: f32,
    pub seed: Option<u64>,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            flip_horizontal: true,
            flip_vertical: true,
            brightness_max_delta: 0.3,
            contrast_range: (0.7, 1.3),
            saturation_range: (0.7, 1.3),
            hue_max_delta: 0.2,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    pub inference_timeout_ms: u64,
    pub scan_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            inference_timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: u32,
    #[serde(default)]
    pub store_path: String,
    #[serde(default)]
    pub corpus_root: String,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            store_path: String::new(),
            corpus_root: String::new(),
            embedding: EmbeddingConfig::default(),
            build: BuildConfig::default(),
            augmentation: AugmentationConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl EngineConfig {
    fn apply_defaults(&mut self, data_dir: &Path) {
        if self.store_path.trim().is_empty() {
            let path = data_dir.join("features").join(STORE_FILE_NAME);
            self.store_path = path.to_string_lossy().to_string();
        }
        if self.corpus_root.trim().is_empty() {
            let path = data_dir.join("processed").join("train");
            self.corpus_root = path.to_string_lossy().to_string();
        }
    }

    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store_path)
    }

    pub fn corpus_root(&self) -> PathBuf {
        PathBuf::from(&self.corpus_root)
    }
}

/// 负责 `EngineConfig` 的读写
pub struct ConfigService {
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl ConfigService {
    /// 平台数据目录下的配置，例如 `~/.local/share/faunafind/config.json`
    pub fn new() -> AppResult<Self> {
        let data_dir = default_data_dir()?;
        Ok(Self {
            config_path: data_dir.join(CONFIG_FILE_NAME),
            data_dir,
        })
    }

    /// 指定配置文件；相对默认路径以其所在目录为基准
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        let data_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_path,
            data_dir,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn default_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.apply_defaults(&self.data_dir);
        config
    }

    /// 读取配置，文件不存在时返回默认值
    pub fn load(&self) -> AppResult<EngineConfig> {
        if !self.config_path.exists() {
            return Ok(self.default_config());
        }

        let raw = fs::read(&self.config_path).config_err("read config")?;
        let mut config: EngineConfig =
            serde_json::from_slice(&raw).config_err("parse config")?;
        if config.version > CONFIG_VERSION {
            return Err(crate::AppError::Config(format!(
                "unsupported config version {}",
                config.version
            )));
        }
        config.apply_defaults(&self.data_dir);
        Ok(config)
    }

    pub fn save(&self, config: &EngineConfig) -> AppResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(config)?;
        fs::write(&self.config_path, json).config_err("write config")
    }
}

/// 应用数据目录
/// macOS: ~/Library/Application Support/com.faunafind.faunafind
/// Linux: ~/.local/share/faunafind
fn default_data_dir() -> AppResult<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "faunafind", "faunafind").ok_or_else(|| {
        crate::AppError::Config("could not determine application data directory".to_string())
    })?;
    Ok(proj_dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults_rooted_next_to_config() {
        let dir = tempdir().unwrap();
        let service = ConfigService::with_path(dir.path().join("config.json"));

        let config = service.load().unwrap();
        assert_eq!(config.build.batch_size, 8);
        assert_eq!(config.build.max_per_class, 2000);
        assert_eq!(config.search.top_k, 5);
        assert_eq!(
            config.store_path(),
            dir.path().join("features").join("image_features.json")
        );
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":1,"build":{"batch_size":16}}"#).unwrap();

        let config = ConfigService::with_path(&path).load().unwrap();
        assert_eq!(config.build.batch_size, 16);
        assert_eq!(config.build.max_per_class, 2000);
        assert!(config.build.augment);
        assert_eq!(config.embedding.input_size, 224);
    }

    #[test]
    fn legacy_vector_size_key_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"version":1,"embedding":{"image_embedding_model":"Qdrant/clip-ViT-B-32-vision","image_vector_size":768}}"#,
        )
        .unwrap();

        let config = ConfigService::with_path(&path).load().unwrap();
        assert_eq!(config.embedding.image_embedding_model, "Qdrant/clip-ViT-B-32-vision");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let service = ConfigService::with_path(dir.path().join("nested").join("config.json"));

        let mut config = service.load().unwrap();
        config.augmentation.seed = Some(7);
        config.search.top_k = 3;
        service.save(&config).unwrap();

        let loaded = service.load().unwrap();
        assert_eq!(loaded.augmentation.seed, Some(7));
        assert_eq!(loaded.search.top_k, 3);
    }

    #[test]
    fn rejects_newer_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":99}"#).unwrap();

        let err = ConfigService::with_path(&path).load().unwrap_err();
        assert!(matches!(err, crate::AppError::Config(_)));
    }
}
