use std::cmp::Ordering;
use std::collections::HashMap;

use ndarray::prelude::*;

use crate::embed::l2_normalize;
use crate::error::{Error, Result};

/// 一次索引的结果：路径列表与按行对应的向量矩阵
///
/// `paths[i]` 对应 `matrix` 的第 i 行，构造后不再修改
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    paths: Vec<String>,
    matrix: Array2<f32>,
    positions: HashMap<String, usize>,
}

impl IndexSnapshot {
    pub fn new(paths: Vec<String>, matrix: Array2<f32>) -> Result<Self> {
        if paths.len() != matrix.nrows() {
            return Err(Error::DimensionMismatch { expected: paths.len(), actual: matrix.nrows() });
        }
        let positions = paths.iter().enumerate().map(|(i, p)| (p.clone(), i)).collect();
        Ok(Self { paths, matrix, positions })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn matrix(&self) -> ArrayView2<'_, f32> {
        self.matrix.view()
    }

    /// 返回路径所在的行
    pub fn position(&self, path: &str) -> Option<usize> {
        self.positions.get(path).copied()
    }

    pub fn embedding(&self, path: &str) -> Option<ArrayView1<'_, f32>> {
        self.position(path).map(|i| self.matrix.row(i))
    }

    /// 使用查询向量搜索，返回按分数降序排列的 (分数, 路径)
    pub fn search(&self, query: ArrayView1<'_, f32>, top_k: usize) -> Result<Vec<(f32, String)>> {
        let query = l2_normalize(query.to_owned());
        self.rank(query.view(), top_k, None)
    }

    /// 使用索引中的图片搜索，结果中不包含该图片本身
    pub fn search_by_path(&self, path: &str, top_k: usize) -> Result<Vec<(f32, String)>> {
        let row = self.position(path).ok_or_else(|| Error::QueryNotIndexed(path.to_string()))?;
        self.rank(self.matrix.row(row), top_k, Some(row))
    }

    /// 暴力计算余弦相似度并选出前 top_k 个
    ///
    /// 分数相同时按行号升序，结果对固定输入是确定的
    fn rank(
        &self,
        query: ArrayView1<'_, f32>,
        top_k: usize,
        exclude: Option<usize>,
    ) -> Result<Vec<(f32, String)>> {
        if self.is_empty() {
            return Err(Error::NoIndexAvailable);
        }
        if top_k == 0 {
            return Err(Error::InvalidTopK);
        }
        if query.len() != self.dimension() {
            let expected = self.dimension();
            return Err(Error::DimensionMismatch { expected, actual: query.len() });
        }

        let scores = self.matrix.dot(&query);
        let mut candidates = scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, _)| Some(*i) != exclude)
            .collect::<Vec<_>>();

        let k = top_k.min(candidates.len());
        if k == 0 {
            return Ok(vec![]);
        }
        if k < candidates.len() {
            candidates.select_nth_unstable_by(k - 1, compare);
            candidates.truncate(k);
        }
        candidates.sort_unstable_by(compare);

        Ok(candidates.into_iter().map(|(i, score)| (score, self.paths[i].clone())).collect())
    }
}

/// 分数降序，行号升序
fn compare(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}
