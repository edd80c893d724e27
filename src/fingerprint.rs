use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{Error, Result};

/// 计算目录指纹，用于判断缓存是否仍然有效
///
/// 对路径排序后，依次将文件名和修改时间写入 blake3。
/// 文件增删、改名或修改时间变化都会改变指纹，文件内容变化但修改时间不变时无法察觉。
///
/// 如果某个文件在扫描之后被删除，返回该文件的 [`Error::Io`]，由调用方决定跳过还是中止。
pub fn compute_fingerprint<P: AsRef<Path>>(paths: &[P]) -> Result<String> {
    let stamps = paths
        .iter()
        .map(|p| file_stamp(p.as_ref()).map(|stamp| (p.as_ref(), stamp)))
        .collect::<Result<Vec<_>>>()?;
    Ok(fingerprint_from_stamps(&stamps))
}

/// 使用已经读取的修改时间计算指纹，结果与 [`compute_fingerprint`] 相同
pub fn fingerprint_from_stamps<P: AsRef<Path>>(stamps: &[(P, String)]) -> String {
    let mut sorted: Vec<(&Path, &str)> =
        stamps.iter().map(|(p, stamp)| (p.as_ref(), stamp.as_str())).collect();
    sorted.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for (path, stamp) in sorted {
        let name = path.file_name().map(|s| s.to_string_lossy()).unwrap_or_default();
        hasher.update(name.as_bytes());
        hasher.update(stamp.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// 文件修改时间的文本形式：`秒.纳秒`
pub fn file_stamp(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| Error::io(path, e))?;
    // 早于 1970 的时间按 0 处理，只要求结果稳定
    let since = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(format!("{}.{:09}", since.as_secs(), since.subsec_nanos()))
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;

    use super::*;

    fn touch(path: &Path, secs: u64) {
        let file = File::options().create(true).truncate(false).write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.png");
        touch(&a, 1_000);
        touch(&b, 2_000);

        let first = compute_fingerprint(&[&a, &b]).unwrap();
        // 输入顺序不影响结果
        let second = compute_fingerprint(&[&b, &a]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_mtime() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.png");
        touch(&a, 1_000);
        touch(&b, 2_000);
        let before = compute_fingerprint(&[&a, &b]).unwrap();

        touch(&a, 1_001);
        let after = compute_fingerprint(&[&a, &b]).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn fingerprint_changes_with_file_set() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.png");
        touch(&a, 1_000);
        touch(&b, 1_000);

        let both = compute_fingerprint(&[&a, &b]).unwrap();
        let only_a = compute_fingerprint(&[&a]).unwrap();
        assert_ne!(both, only_a);

        let c = dir.path().join("c.png");
        fs::rename(&b, &c).unwrap();
        let renamed = compute_fingerprint(&[&a, &c]).unwrap();
        assert_ne!(both, renamed);
    }

    #[test]
    fn stamps_match_direct_computation() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.jpg");
        touch(&a, 42);
        assert_eq!(file_stamp(&a).unwrap(), "42.000000000");

        let stamps = vec![(a.clone(), file_stamp(&a).unwrap())];
        assert_eq!(fingerprint_from_stamps(&stamps), compute_fingerprint(&[&a]).unwrap());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone.jpg");
        match compute_fingerprint(&[&missing]) {
            Err(Error::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
