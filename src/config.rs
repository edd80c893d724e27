use std::fmt;
use std::path::{Path, PathBuf};

use clap::builder::TypedValueParser;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::cli::*;
use crate::error::{Error, Result};

/// 缓存子目录名，位于被索引目录之下
pub const CACHE_DIR_NAME: &str = ".clip_search_cache";

/// 支持的图片后缀名（不区分大小写）
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// 默认批次大小，显存或内存不足时调小
pub const DEFAULT_BATCH_SIZE: usize = 64;

pub const DEFAULT_TOP_K: usize = 24;

pub const MAX_TOP_K: usize = 200;

/// 模型标识，同时决定嵌入函数与缓存文件名
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub model_name: String,
    pub pretrained_tag: String,
}

impl ModelIdentity {
    pub fn new(model_name: impl Into<String>, pretrained_tag: impl Into<String>) -> Self {
        Self { model_name: model_name.into(), pretrained_tag: pretrained_tag.into() }
    }

    /// 用于文件名的标识，非字母数字字符统一替换为 `_`
    pub fn sanitized(&self) -> String {
        format!("{}_{}", self.model_name, self.pretrained_tag)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model_name, self.pretrained_tag)
    }
}

/// 模型目录中的一项
pub struct ModelEntry {
    /// 面向用户的名称
    pub key: &'static str,
    pub model_name: &'static str,
    pub pretrained_tag: &'static str,
    pub notes: &'static str,
}

impl ModelEntry {
    pub fn identity(&self) -> ModelIdentity {
        ModelIdentity::new(self.model_name, self.pretrained_tag)
    }
}

pub const DEFAULT_MODEL_KEY: &str = "thumbnail";

pub static AVAILABLE_MODELS: &[ModelEntry] = &[
    ModelEntry {
        key: "thumbnail",
        model_name: "thumbnail",
        pretrained_tag: "rgb8x8",
        notes: "内置的缩略图颜色特征，只支持以图搜图",
    },
    ModelEntry {
        key: "fast",
        model_name: "ViT-B-32",
        pretrained_tag: "laion2b_s34b_b79k",
        notes: "速度与质量均衡，推荐大多数用户使用",
    },
    ModelEntry {
        key: "high",
        model_name: "ViT-L-14",
        pretrained_tag: "laion2b_s32b_b82k",
        notes: "质量很好，需要较好的 GPU",
    },
    ModelEntry {
        key: "best",
        model_name: "ViT-H-14",
        pretrained_tag: "laion2b_s32b_b79k",
        notes: "质量最好，非常慢，需要 12GB 以上显存",
    },
];

/// 按用户名称或 `model_name/pretrained_tag` 查找模型
pub fn find_model(key: &str) -> Option<&'static ModelEntry> {
    AVAILABLE_MODELS.iter().find(|m| {
        m.key == key || format!("{}/{}", m.model_name, m.pretrained_tag) == key
    })
}

#[derive(Parser, Debug, Clone)]
pub struct ModelOptions {
    /// 使用的模型，可以是 `models` 子命令列出的名称，也可以是 `model_name/pretrained_tag`
    #[arg(short, long, value_name = "MODEL", default_value = DEFAULT_MODEL_KEY)]
    pub model: String,
}

impl ModelOptions {
    /// 解析为模型标识，目录以外的 `model_name/pretrained_tag` 原样使用
    pub fn identity(&self) -> Result<ModelIdentity> {
        if let Some(entry) = find_model(&self.model) {
            return Ok(entry.identity());
        }
        match self.model.rsplit_once('/') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() => {
                Ok(ModelIdentity::new(name, tag))
            }
            _ => Err(Error::UnknownModel(self.model.clone())),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 每个批次嵌入的图片数量
    #[arg(short, long, value_name = "SIZE", default_value_t = DEFAULT_BATCH_SIZE,
          value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    pub batch_size: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 显示的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_TOP_K,
          value_parser = clap::value_parser!(u64).range(1..=MAX_TOP_K as u64).map(|v| v as usize))]
    pub count: usize,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "clipsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 命令结束后打印 prometheus 指标
    #[arg(long, global = true)]
    pub metrics: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 索引目录中的图片
    Index(IndexCommand),
    /// 在已索引的目录中搜索图片
    Search(SearchCommand),
    /// 删除目录中的嵌入缓存
    Clean(CleanCommand),
    /// 列出可用模型
    Models(ModelsCommand),
}

/// 被索引目录下的缓存目录
#[derive(Debug, Clone)]
pub struct CacheDir {
    path: PathBuf,
}

impl CacheDir {
    pub fn new(image_dir: impl AsRef<Path>) -> Self {
        Self { path: image_dir.as_ref().join(CACHE_DIR_NAME) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回指定模型的缓存文件路径
    pub fn cache_file(&self, model: &ModelIdentity) -> PathBuf {
        self.path.join(format!("cache_{}.bin", model.sanitized()))
    }

    /// 返回缓存文件的临时路径
    pub fn cache_file_tmp(&self, model: &ModelIdentity) -> PathBuf {
        self.path.join(format!("cache_{}.bin.tmp", model.sanitized()))
    }
}
