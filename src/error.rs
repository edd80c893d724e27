use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// 引擎错误类型
///
/// 取消索引不属于错误，见 [`crate::indexer::IndexOutcome::Cancelled`]
#[derive(Error, Debug)]
pub enum Error {
    /// 目录中没有找到任何图片
    #[error("目录中没有找到图片")]
    NoImagesFound,

    /// 搜索前尚未建立索引
    #[error("请先索引一个目录再进行搜索")]
    NoIndexAvailable,

    /// 以图搜图时，查询图片不在当前索引中
    #[error("查询图片不在索引中: {0}")]
    QueryNotIndexed(String),

    /// 正在索引时拒绝搜索
    #[error("正在索引，请稍后再试")]
    IndexingInProgress,

    /// top_k 必须大于 0
    #[error("结果数量必须大于 0")]
    InvalidTopK,

    /// 尚未加载模型
    #[error("尚未加载模型")]
    NoModelLoaded,

    /// 模型目录中不存在，或加载器无法提供该模型
    #[error("未知模型: {0}")]
    UnknownModel(String),

    /// 模型调用失败
    #[error("模型错误: {0}")]
    Model(String),

    /// 单个图片解码失败，索引时跳过该图片
    #[error("无法解码图片 {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// 向量维度与索引不一致
    #[error("向量维度不一致: 期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("IO 错误 {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 缓存写入失败
    #[error("缓存错误: {0}")]
    Cache(String),

    /// 后台线程已退出
    #[error("引擎已停止")]
    EngineStopped,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Cache(err.to_string())
    }
}
