use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::DynamicImage;
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;

use crate::cache::{CacheEntry, CachedEmbedding, EmbeddingCache};
use crate::config::{DEFAULT_BATCH_SIZE, ModelIdentity};
use crate::embed::{Embedder, decode_image, l2_normalize_rows};
use crate::error::{Error, Result};
use crate::fingerprint::{file_stamp, fingerprint_from_stamps};
use crate::metrics;
use crate::scan::scan_directory;
use crate::search::IndexSnapshot;

/// 索引进度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// 已有向量的图片数量，包括从缓存读取的
    pub done: usize,
    pub total: usize,
    pub message: String,
}

/// 一次索引的结果，取消不算错误
#[derive(Debug)]
pub enum IndexOutcome {
    Completed(IndexSnapshot),
    Cancelled,
}

/// 目录索引器
///
/// 扫描目录、校验缓存、分批计算缺失的向量，最后写回缓存并组装 [`IndexSnapshot`]。
/// 取消只在批次之间检查，取消后不会写入缓存。
pub struct Indexer<'a> {
    model: &'a ModelIdentity,
    embedder: &'a mut dyn Embedder,
    batch_size: usize,
    is_cancelled: Box<dyn Fn() -> bool + 'a>,
    on_progress: Box<dyn FnMut(Progress) + 'a>,
}

impl<'a> Indexer<'a> {
    pub fn new(model: &'a ModelIdentity, embedder: &'a mut dyn Embedder) -> Self {
        Self {
            model,
            embedder,
            batch_size: DEFAULT_BATCH_SIZE,
            is_cancelled: Box::new(|| false),
            on_progress: Box::new(|_| {}),
        }
    }

    /// 每批嵌入的图片数量，最小为 1
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// 设置取消条件，每个批次开始前检查一次
    pub fn cancel_when(mut self, is_cancelled: impl Fn() -> bool + 'a) -> Self {
        self.is_cancelled = Box::new(is_cancelled);
        self
    }

    pub fn on_progress(mut self, on_progress: impl FnMut(Progress) + 'a) -> Self {
        self.on_progress = Box::new(on_progress);
        self
    }

    /// 索引目录
    pub fn run(mut self, directory: impl AsRef<Path>) -> Result<IndexOutcome> {
        let start = Instant::now();
        let directory = directory.as_ref();
        let root = directory.canonicalize().map_err(|e| Error::io(directory, e))?;

        let paths = scan_directory(&root)?;
        if paths.is_empty() {
            return Err(Error::NoImagesFound);
        }
        let stamped = stamp_present(paths)?;
        let fingerprint = fingerprint_from_stamps(&stamped);
        let (paths, stamps): (Vec<_>, Vec<_>) = stamped.into_iter().unzip();
        let keys = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect::<Vec<_>>();
        let total = keys.len();

        let cache = EmbeddingCache::new(&root, self.model);
        let (mut records, fresh) = self.warm_records(&cache, &fingerprint, &keys, &stamps);
        self.report(records.len(), total, format!("从缓存读取了 {} 条特征", records.len()));

        // 指纹一致时缓存完全有效，上次解码失败的图片也不再重试
        let pending = keys
            .iter()
            .zip(&paths)
            .zip(&stamps)
            .filter(|((key, _), _)| !fresh && !records.contains_key(*key))
            .map(|((key, path), stamp)| (key, path, stamp))
            .collect::<Vec<_>>();
        info!("需要计算 {} 张图片，缓存命中 {} 张", pending.len(), records.len());

        for batch in pending.chunks(self.batch_size) {
            if (self.is_cancelled)() {
                info!("索引已取消");
                return Ok(IndexOutcome::Cancelled);
            }

            let (decoded, images) = decode_batch(batch);
            if !images.is_empty() {
                let vectors = self.embed_batch(&images)?;
                for ((key, stamp), row) in decoded.into_iter().zip(vectors.rows()) {
                    records.insert(key.clone(), CachedEmbedding::new(stamp, row.to_vec()));
                }
                metrics::inc_embedded_images(images.len());
            }

            let done = records.len();
            self.report(done, total, format!("正在索引: {done}/{total}"));
        }

        let entry = CacheEntry { fingerprint, records };
        cache.save(&entry)?;

        let snapshot = assemble_snapshot(&keys, entry.records)?;
        metrics::inc_index_runs();
        info!(
            "索引完成，共 {} 张图片，耗时 {:.2}s",
            snapshot.len(),
            start.elapsed().as_secs_f32()
        );
        Ok(IndexOutcome::Completed(snapshot))
    }

    /// 读取缓存中仍然可用的记录，同时返回指纹是否一致
    ///
    /// 指纹一致时整个缓存有效；否则只保留路径仍然存在且修改时间未变的记录，
    /// 不重新校验它们的内容
    fn warm_records(
        &self,
        cache: &EmbeddingCache,
        fingerprint: &str,
        keys: &[String],
        stamps: &[String],
    ) -> (BTreeMap<String, CachedEmbedding>, bool) {
        let Some(entry) = cache.load().into_entry() else {
            debug!("没有可用的缓存: {}", cache.path().display());
            return (BTreeMap::new(), false);
        };
        let fresh = entry.fingerprint == fingerprint;
        if fresh {
            debug!("缓存指纹一致");
        } else {
            debug!("缓存指纹不一致，复用路径仍存在的记录");
        }

        let present = keys
            .iter()
            .map(String::as_str)
            .zip(stamps.iter().map(String::as_str))
            .collect::<HashMap<_, _>>();
        let dimension = self.embedder.dimension();
        let records = entry
            .records
            .into_iter()
            .filter(|(path, record)| {
                present.get(path.as_str()) == Some(&record.stamp.as_str())
                    && record.embedding.len() == dimension
            })
            .collect();
        (records, fresh)
    }

    fn embed_batch(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>> {
        let vectors = self.embedder.embed_images(images)?;
        if vectors.nrows() != images.len() {
            return Err(Error::Model(format!(
                "模型返回了 {} 个向量，期望 {} 个",
                vectors.nrows(),
                images.len()
            )));
        }
        let dimension = self.embedder.dimension();
        if vectors.ncols() != dimension {
            return Err(Error::DimensionMismatch { expected: dimension, actual: vectors.ncols() });
        }
        Ok(l2_normalize_rows(vectors))
    }

    fn report(&mut self, done: usize, total: usize, message: String) {
        (self.on_progress)(Progress { done, total, message });
    }
}

/// 读取每个文件的修改时间，跳过扫描之后消失的文件
fn stamp_present(paths: Vec<PathBuf>) -> Result<Vec<(PathBuf, String)>> {
    let stamped = paths
        .into_iter()
        .filter_map(|path| match file_stamp(&path) {
            Ok(stamp) => Some((path, stamp)),
            Err(e) => {
                warn!("跳过无法读取的文件: {e}");
                None
            }
        })
        .collect::<Vec<_>>();
    if stamped.is_empty() {
        return Err(Error::NoImagesFound);
    }
    Ok(stamped)
}

type Pending<'k> = (&'k String, &'k PathBuf, &'k String);

/// 并行解码一个批次，解码失败的图片会被跳过
fn decode_batch<'k>(
    batch: &[Pending<'k>],
) -> (Vec<(&'k String, &'k String)>, Vec<DynamicImage>) {
    let decoded = batch
        .par_iter()
        .map(|&(key, path, stamp)| ((key, stamp), decode_image(path)))
        .collect::<Vec<_>>();

    let mut keys = Vec::with_capacity(decoded.len());
    let mut images = Vec::with_capacity(decoded.len());
    for (key, result) in decoded {
        match result {
            Ok(image) => {
                keys.push(key);
                images.push(image);
            }
            Err(e) => {
                warn!("跳过损坏的图片: {e}");
                metrics::inc_skipped_images();
            }
        }
    }
    (keys, images)
}

/// 按扫描顺序组装快照，没有向量的图片不会出现在结果中
fn assemble_snapshot(
    keys: &[String],
    mut records: BTreeMap<String, CachedEmbedding>,
) -> Result<IndexSnapshot> {
    let mut paths = Vec::with_capacity(records.len());
    let mut data = vec![];
    let mut dimension = 0;
    for key in keys {
        if let Some(record) = records.remove(key) {
            dimension = record.embedding.len();
            data.extend(record.embedding);
            paths.push(key.clone());
        }
    }
    if paths.is_empty() {
        warn!("没有任何图片可以解码");
        return Err(Error::NoImagesFound);
    }

    let matrix = Array2::from_shape_vec((paths.len(), dimension), data)
        .map_err(|e| Error::Cache(e.to_string()))?;
    IndexSnapshot::new(paths, matrix)
}
