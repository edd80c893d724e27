use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use super::{SubCommandExtend, wait_with_progress};
use crate::config::{IndexOptions, ModelOptions, Opts};
use crate::embed::BuiltinLoader;
use crate::engine::{EngineHandle, IndexStatus};

#[derive(Parser, Debug, Clone)]
pub struct IndexCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    /// 图片目录
    pub dir: PathBuf,
}

impl SubCommandExtend for IndexCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let identity = self.model.identity()?;
        block_in_place(|| {
            let handle = EngineHandle::spawn(BuiltinLoader, self.index.batch_size)?;
            handle.load_model(identity).wait()?;

            let reply = handle.index_directory(&self.dir);
            match wait_with_progress(&handle, reply)? {
                IndexStatus::Completed { images } => {
                    info!("索引完成: {}", self.dir.display());
                    println!("已索引 {images} 张图片");
                }
                IndexStatus::Cancelled => println!("索引已取消"),
            }
            Ok(())
        })
    }
}
