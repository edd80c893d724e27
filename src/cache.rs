use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use bincode::Options;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{CacheDir, ModelIdentity};
use crate::error::{Error, Result};

/// 磁盘上的嵌入缓存：目录指纹 + 路径到向量的映射
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub records: BTreeMap<String, CachedEmbedding>,
}

/// 单张图片的缓存记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEmbedding {
    /// 计算向量时文件的修改时间，见 [`crate::fingerprint::file_stamp`]
    pub stamp: String,
    /// 已归一化的向量
    pub embedding: Vec<f32>,
}

impl CachedEmbedding {
    pub fn new(stamp: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self { stamp: stamp.into(), embedding }
    }
}

/// 读取缓存的结果
#[derive(Debug)]
pub enum CacheLoad {
    Found(CacheEntry),
    NotFound,
    /// 文件存在但无法解析，调用方应当按冷启动处理
    Corrupt(String),
}

impl CacheLoad {
    /// 损坏的缓存视为不存在
    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            CacheLoad::Found(entry) => Some(entry),
            CacheLoad::NotFound => None,
            CacheLoad::Corrupt(reason) => {
                warn!("无法读取缓存文件，将重新索引: {reason}");
                None
            }
        }
    }
}

/// 一个 (目录, 模型) 对应的缓存文件
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl EmbeddingCache {
    pub fn new(image_dir: impl AsRef<Path>, model: &ModelIdentity) -> Self {
        let dir = CacheDir::new(image_dir);
        Self { path: dir.cache_file(model), tmp_path: dir.cache_file_tmp(model) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取缓存，任何读取或解析失败都不会返回错误
    pub fn load(&self) -> CacheLoad {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheLoad::NotFound,
            Err(e) => return CacheLoad::Corrupt(format!("{}: {e}", self.path.display())),
        };
        // 以文件大小作为上限，损坏的长度字段不会触发超大内存分配
        let limit = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => return CacheLoad::Corrupt(format!("{}: {e}", self.path.display())),
        };
        let reader = BufReader::new(file);
        match bincode_options().with_limit(limit).deserialize_from::<_, CacheEntry>(reader) {
            Ok(entry) => {
                debug!("读取缓存 {}: {} 条记录", self.path.display(), entry.records.len());
                CacheLoad::Found(entry)
            }
            Err(e) => CacheLoad::Corrupt(format!("{}: {e}", self.path.display())),
        }
    }

    /// 写入缓存
    ///
    /// 先写入临时文件再重命名，读取方不会看到写了一半的文件
    pub fn save(&self, entry: &CacheEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let file = File::create(&self.tmp_path).map_err(|e| Error::io(&self.tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        bincode_options().serialize_into(&mut writer, entry)?;
        let file = writer.into_inner().map_err(|e| Error::io(&self.tmp_path, e.into_error()))?;
        file.sync_all().map_err(|e| Error::io(&self.tmp_path, e))?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path).map_err(|e| Error::io(&self.path, e))?;
        debug!("写入缓存 {}: {} 条记录", self.path.display(), entry.records.len());
        Ok(())
    }

    /// 删除缓存文件，文件不存在时返回 false
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn model() -> ModelIdentity {
        ModelIdentity::new("ViT-B-32", "laion2b_s34b_b79k")
    }

    fn sample_entry() -> CacheEntry {
        let mut records = BTreeMap::new();
        records.insert("/img/a.jpg".to_string(), CachedEmbedding::new("1.0", vec![1.0, 0.0, 0.0]));
        records.insert("/img/b.png".to_string(), CachedEmbedding::new("2.5", vec![0.0, 0.6, 0.8]));
        CacheEntry { fingerprint: "abc123".to_string(), records }
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path(), &model());
        let entry = sample_entry();

        cache.save(&entry).unwrap();
        assert!(cache.path().exists());
        assert!(cache.path().starts_with(dir.path().join(".clip_search_cache")));

        match cache.load() {
            CacheLoad::Found(loaded) => assert_eq!(loaded, entry),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_cache_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path(), &model());
        assert!(matches!(cache.load(), CacheLoad::NotFound));
        assert!(!cache.remove().unwrap());
    }

    #[test]
    fn corrupt_cache_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path(), &model());
        fs::create_dir_all(cache.path().parent().unwrap()).unwrap();
        fs::write(cache.path(), b"definitely not bincode").unwrap();

        let load = cache.load();
        assert!(matches!(load, CacheLoad::Corrupt(_)));
        assert!(load.into_entry().is_none());
    }

    #[test]
    fn save_overwrites_and_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path(), &model());
        cache.save(&sample_entry()).unwrap();

        let newer = CacheEntry { fingerprint: "def456".to_string(), records: BTreeMap::new() };
        cache.save(&newer).unwrap();

        let entry = cache.load().into_entry().unwrap();
        assert_eq!(entry.fingerprint, "def456");
        assert!(entry.records.is_empty());
        let leftovers = fs::read_dir(cache.path().parent().unwrap())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
