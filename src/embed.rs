use std::path::Path;

use image::DynamicImage;
use image::imageops::FilterType;
use ndarray::prelude::*;

use crate::config::{ModelIdentity, find_model};
use crate::error::{Error, Result};

/// 嵌入模型
///
/// 输出的向量不要求已经归一化，索引和搜索时会统一做 L2 归一化
pub trait Embedder: Send {
    /// 向量维度
    fn dimension(&self) -> usize;

    /// 批量计算图片向量，每张图片对应输出的一行
    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>>;

    /// 计算文本向量
    fn embed_text(&mut self, text: &str) -> Result<Array1<f32>>;
}

/// 根据模型标识创建嵌入模型
pub trait ModelLoader: Send {
    fn load(&self, model: &ModelIdentity) -> Result<Box<dyn Embedder>>;
}

/// 解码图片文件
pub fn decode_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    let path = path.as_ref();
    image::open(path)
        .map_err(|e| Error::Decode { path: path.to_path_buf(), reason: e.to_string() })
}

/// 就地对每一行做 L2 归一化，零向量保持不变
pub fn l2_normalize_rows(mut matrix: Array2<f32>) -> Array2<f32> {
    for mut row in matrix.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > f32::EPSILON && norm.is_finite() {
            row /= norm;
        }
    }
    matrix
}

pub fn l2_normalize(mut vector: Array1<f32>) -> Array1<f32> {
    let norm = vector.dot(&vector).sqrt();
    if norm > f32::EPSILON && norm.is_finite() {
        vector /= norm;
    }
    vector
}

/// 内置模型加载器，只认识缩略图模型
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinLoader;

impl ModelLoader for BuiltinLoader {
    fn load(&self, model: &ModelIdentity) -> Result<Box<dyn Embedder>> {
        let thumbnail = find_model(ThumbnailEmbedder::KEY).map(|m| m.identity());
        if thumbnail.as_ref() == Some(model) {
            Ok(Box::new(ThumbnailEmbedder::default()))
        } else {
            Err(Error::UnknownModel(model.to_string()))
        }
    }
}

/// 缩略图颜色特征
///
/// 将图片缩放到 8x8 RGB，减去均值后展开成向量，末尾追加一个常数分量，
/// 纯色图片也能得到非零向量。不支持文本查询。
#[derive(Debug, Clone)]
pub struct ThumbnailEmbedder {
    size: u32,
}

impl ThumbnailEmbedder {
    pub const KEY: &'static str = "thumbnail";
    const BIAS: f32 = 0.05;

    fn embed_one(&self, image: &DynamicImage) -> Vec<f32> {
        let rgb = image.to_rgb8();
        let thumb = image::imageops::resize(&rgb, self.size, self.size, FilterType::Triangle);
        let mut v = thumb.as_raw().iter().map(|&p| p as f32 / 255.).collect::<Vec<_>>();
        let mean = v.iter().sum::<f32>() / v.len() as f32;
        v.iter_mut().for_each(|x| *x -= mean);
        v.push(Self::BIAS);
        v
    }
}

impl Default for ThumbnailEmbedder {
    fn default() -> Self {
        Self { size: 8 }
    }
}

impl Embedder for ThumbnailEmbedder {
    fn dimension(&self) -> usize {
        (self.size * self.size * 3) as usize + 1
    }

    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>> {
        let data = images.iter().flat_map(|img| self.embed_one(img)).collect::<Vec<_>>();
        Array2::from_shape_vec((images.len(), self.dimension()), data)
            .map_err(|e| Error::Model(e.to_string()))
    }

    fn embed_text(&mut self, _text: &str) -> Result<Array1<f32>> {
        Err(Error::Model("缩略图模型不支持文本搜索，请使用 CLIP 模型".to_string()))
    }
}
