//! 特征库：记录、磁盘格式与进程级缓存

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult, ResultExt};
use crate::utils::compute_sha256;

pub const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub identity: String,
    pub vector: Vec<f32>,
    pub class_label: String,
}

/// identity -> 记录，按插入顺序遍历
#[derive(Debug, Clone)]
pub struct FeatureStore {
    model: String,
    dimension: usize,
    build_id: Uuid,
    built_at: DateTime<Utc>,
    records: Vec<FeatureRecord>,
    index: HashMap<String, usize>,
}

impl FeatureStore {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            build_id: Uuid::new_v4(),
            built_at: Utc::now(),
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// 按 identity 插入或覆盖，覆盖时保留原位置
    pub fn insert(&mut self, record: FeatureRecord) -> AppResult<()> {
        if record.vector.len() != self.dimension {
            return Err(AppError::Validation(format!(
                "{}: vector dimension {} does not match store dimension {}",
                record.identity,
                record.vector.len(),
                self.dimension
            )));
        }
        if record.vector.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Validation(format!(
                "{}: vector contains non-finite values",
                record.identity
            )));
        }

        match self.index.get(&record.identity) {
            Some(&slot) => self.records[slot] = record,
            None => {
                self.index.insert(record.identity.clone(), self.records.len());
                self.records.push(record);
            }
        }
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<&FeatureRecord> {
        self.index.get(identity).map(|&slot| &self.records[slot])
    }

    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn build_id(&self) -> Uuid {
        self.build_id
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn class_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.class_label.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreHeader {
    format_version: u32,
    model: String,
    dimension: usize,
    record_count: usize,
    built_at: DateTime<Utc>,
    build_id: Uuid,
    /// `records` 紧凑 JSON 编码的 SHA-256
    checksum: String,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    header: StoreHeader,
    records: &'a [FeatureRecord],
}

#[derive(Deserialize)]
struct StoreFile {
    header: StoreHeader,
    records: Vec<FeatureRecord>,
}

/// 序列化并原子替换 `path` 处的文件
///
/// 先写入同目录的临时文件再重命名覆盖目标，写到一半崩溃时旧库保持不变
pub fn save_store(store: &FeatureStore, path: &Path) -> AppResult<()> {
    let records_json = serde_json::to_vec(store.records())?;
    let file = StoreFileRef {
        header: StoreHeader {
            format_version: STORE_FORMAT_VERSION,
            model: store.model.clone(),
            dimension: store.dimension,
            record_count: store.len(),
            built_at: store.built_at,
            build_id: store.build_id,
            checksum: compute_sha256(&records_json),
        },
        records: store.records(),
    };
    let bytes = serde_json::to_vec(&file)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AppError::Io(e.error))?;

    tracing::debug!(path = %path.display(), records = store.len(), "feature store written");
    Ok(())
}

/// 读取并校验持久化的特征库，任何失败都是 `StoreLoad`
pub fn load_store(path: &Path) -> AppResult<FeatureStore> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::StoreLoad(format!(
                "no feature store at {}",
                path.display()
            )))
        }
        Err(err) => return Err(AppError::StoreLoad(format!("{}: {}", path.display(), err))),
    };

    let file: StoreFile = serde_json::from_slice(&bytes).store_err("parse feature store")?;
    let header = file.header;

    if header.format_version != STORE_FORMAT_VERSION {
        return Err(AppError::StoreLoad(format!(
            "unsupported store format version {}",
            header.format_version
        )));
    }
    if header.record_count != file.records.len() {
        return Err(AppError::StoreLoad(format!(
            "header promises {} records, found {}",
            header.record_count,
            file.records.len()
        )));
    }
    let records_json = serde_json::to_vec(&file.records).store_err("re-encode records")?;
    if compute_sha256(&records_json) != header.checksum {
        return Err(AppError::StoreLoad("checksum mismatch".to_string()));
    }

    let mut store = FeatureStore {
        model: header.model,
        dimension: header.dimension,
        build_id: header.build_id,
        built_at: header.built_at,
        records: Vec::with_capacity(file.records.len()),
        index: HashMap::with_capacity(file.records.len()),
    };
    let mut seen = HashSet::with_capacity(file.records.len());
    for record in file.records {
        if !seen.insert(record.identity.clone()) {
            return Err(AppError::StoreLoad(format!(
                "duplicate identity {}",
                record.identity
            )));
        }
        store
            .insert(record)
            .map_err(|e| AppError::StoreLoad(e.to_string()))?;
    }

    Ok(store)
}

/// 持久化特征库的只读快照
///
/// 检索克隆当前的 `Arc`，互不阻塞；构建完成后换入新快照。加载失败不缓存
pub struct StoreCache {
    path: PathBuf,
    current: RwLock<Option<Arc<FeatureStore>>>,
}

impl StoreCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> AppResult<Arc<FeatureStore>> {
        if let Some(store) = self.current.read().await.as_ref() {
            return Ok(store.clone());
        }

        let mut current = self.current.write().await;
        if let Some(store) = current.as_ref() {
            return Ok(store.clone());
        }

        let path = self.path.clone();
        let store = tokio::task::spawn_blocking(move || load_store(&path))
            .await
            .store_err("store load task")??;
        let store = Arc::new(store);
        tracing::info!(
            path = %self.path.display(),
            records = store.len(),
            build_id = %store.build_id(),
            "feature store loaded"
        );
        *current = Some(store.clone());
        Ok(store)
    }

    pub async fn replace(&self, store: Arc<FeatureStore>) {
        *self.current.write().await = Some(store);
    }

    /// 丢弃快照，下次检索从磁盘重新加载
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}
