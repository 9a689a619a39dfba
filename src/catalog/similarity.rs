// 该文件是 Yingyang （营养） 项目的一部分。
// src/catalog/similarity.rs - 名称相似度
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::HashSet;

/// 编辑距离（按字符计），两行滚动数组
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
  let a: Vec<char> = a.chars().collect();
  let b: Vec<char> = b.chars().collect();

  if a.is_empty() {
    return b.len();
  }
  if b.is_empty() {
    return a.len();
  }

  let mut prev: Vec<usize> = (0..=b.len()).collect();
  let mut curr = vec![0; b.len() + 1];

  for i in 1..=a.len() {
    curr[0] = i;
    for j in 1..=b.len() {
      let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
      curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
    }
    std::mem::swap(&mut prev, &mut curr);
  }

  prev[b.len()]
}

/// 1 - 距离 / 较长串长度，取值 [0, 1]
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
  let longest = a.chars().count().max(b.chars().count());
  if longest == 0 {
    return 1.0;
  }
  1.0 - levenshtein_distance(a, b) as f64 / longest as f64
}

/// 词集合的 Jaccard 系数
pub fn token_overlap(a: &str, b: &str) -> f64 {
  let a: HashSet<&str> = a.split_whitespace().collect();
  let b: HashSet<&str> = b.split_whitespace().collect();
  if a.is_empty() && b.is_empty() {
    return 1.0;
  }
  let union = a.union(&b).count();
  if union == 0 {
    return 0.0;
  }
  a.intersection(&b).count() as f64 / union as f64
}

/// 两种度量取较大值：拼写错误靠编辑距离，词序变化靠词集合
pub fn similarity(a: &str, b: &str) -> f64 {
  levenshtein_similarity(a, b).max(token_overlap(a, b))
}
