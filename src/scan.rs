use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::{info, warn};
use regex::Regex;
use walkdir::WalkDir;

use crate::config::{CACHE_DIR_NAME, IMAGE_EXTENSIONS};
use crate::error::{Error, Result};

static RE_IMAGE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    let re = format!("(?i)^({})$", IMAGE_EXTENSIONS.join("|"));
    Regex::new(&re).expect("failed to build regex")
});

/// 判断文件后缀名是否在图片白名单中
pub fn is_image_file(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .map(|ext| RE_IMAGE_SUFFIX.is_match(&ext.to_string_lossy()))
        .unwrap_or(false)
}

/// 递归扫描目录，返回所有图片的绝对路径
///
/// 结果按文件名排序，两次扫描未变化的目录得到相同的顺序。缓存目录不会被扫描。
pub fn scan_directory(directory: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let directory = directory.as_ref();
    let root = directory.canonicalize().map_err(|e| Error::io(directory, e))?;
    info!("开始扫描目录: {}", root.display());

    let entries = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != CACHE_DIR_NAME)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("跳过无法访问的路径: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_image_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();

    info!("扫描完成，共 {} 张图片", entries.len());
    Ok(entries)
}
