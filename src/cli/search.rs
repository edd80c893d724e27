use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::debug;
use tokio::task::block_in_place;

use super::{SubCommandExtend, wait_with_progress};
use crate::config::{IndexOptions, ModelOptions, Opts, SearchOptions};
use crate::embed::BuiltinLoader;
use crate::engine::{EngineHandle, Query};
use crate::utils::print_result;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 图片目录，未索引或索引过期时会先更新索引
    pub dir: PathBuf,
    /// 使用文本描述搜索
    #[arg(long, value_name = "TEXT", conflicts_with = "image", required_unless_present = "image")]
    pub text: Option<String>,
    /// 使用图片搜索，可以是目录中的图片，也可以是外部文件
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<PathBuf>,
}

impl SearchCommand {
    fn query(&self) -> Query {
        match (&self.text, &self.image) {
            (_, Some(image)) => Query::Image(image.clone()),
            (Some(text), None) => Query::Text(text.clone()),
            (None, None) => Query::Text(String::new()),
        }
    }
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let identity = self.model.identity()?;
        let query = self.query();
        debug!("查询: {query:?}");

        let result = block_in_place(|| {
            let handle = EngineHandle::spawn(BuiltinLoader, self.index.batch_size)?;
            handle.load_model(identity).wait()?;
            wait_with_progress(&handle, handle.index_directory(&self.dir))?;
            handle.search(query, self.search.count).wait()
        })?;

        print_result(&result, self.search.output_format)
    }
}
