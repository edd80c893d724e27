use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use crate::cache::EmbeddingCache;
use crate::cli::SubCommandExtend;
use crate::config::{CacheDir, ModelOptions, Opts};

#[derive(Parser, Debug, Clone)]
pub struct CleanCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    /// 删除所有模型的缓存，连同缓存目录一起删除
    #[arg(long)]
    pub all: bool,
    /// 图片目录
    pub dir: PathBuf,
}

impl SubCommandExtend for CleanCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        info!("清理缓存中……");
        if self.all {
            let cache_dir = CacheDir::new(&self.dir);
            if cache_dir.path().exists() {
                fs::remove_dir_all(cache_dir.path())
                    .with_context(|| format!("无法删除 {}", cache_dir.path().display()))?;
            }
        } else {
            let cache = EmbeddingCache::new(&self.dir, &self.model.identity()?);
            if !cache.remove()? {
                info!("缓存不存在: {}", cache.path().display());
            }
        }
        info!("清理完成");
        Ok(())
    }
}
