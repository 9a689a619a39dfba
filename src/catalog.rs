// 该文件是 Yingyang （营养） 项目的一部分。
// src/catalog.rs - 营养库
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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

mod similarity;
mod source;

pub use self::similarity::{levenshtein_distance, levenshtein_similarity, similarity, token_overlap};
pub use self::source::{CatalogEntry, CatalogSource};

/// 营养素编号 → 每参考份量的含量
pub type NutrientAmounts = BTreeMap<String, f64>;

#[derive(Error, Debug)]
pub enum CatalogError {
  #[error("营养库不可用: {origin}: {reason}")]
  Unavailable { origin: String, reason: String },
  #[error("营养库条目无效: {name}: {reason}")]
  InvalidEntry { name: String, reason: String },
  #[error("营养库为空")]
  Empty,
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("营养库句柄已损坏")]
  Poisoned,
}

static SEPARATORS: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"[_\-]+").expect("分隔符正则无效"));
static NON_WORD: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"[^\p{Alphabetic}\p{N}\s]").expect("标点正则无效"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("空白正则无效"));

/// 规范形式：小写，`_`/`-` 视为空格，去掉其余标点，压缩空白
pub fn normalize(name: &str) -> String {
  let lower = name.to_lowercase();
  let s = SEPARATORS.replace_all(&lower, " ");
  let s = NON_WORD.replace_all(&s, "");
  SPACES.replace_all(s.trim(), " ").into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutrientProfile {
  /// 规范化后的名称，查找主键
  pub canonical_name: String,
  /// 数据源中的原始名称
  pub display_name: String,
  pub category: Option<String>,
  /// 规范化后的别名
  pub aliases: BTreeSet<String>,
  pub nutrients: NutrientAmounts,
}

impl NutrientProfile {
  /// 缺失的营养素按 0 计
  pub fn amount(&self, nutrient: &str) -> f64 {
    self.nutrients.get(nutrient).copied().unwrap_or(0.0)
  }

  /// 所有可匹配的键：规范名在前，别名随后
  pub fn keys(&self) -> impl Iterator<Item = &str> {
    std::iter::once(self.canonical_name.as_str()).chain(self.aliases.iter().map(String::as_str))
  }
}

/// 模糊匹配候选
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub profile: Arc<NutrientProfile>,
  pub score: f64,
}

/// 加载完成后只读的营养库
#[derive(Debug, Default)]
pub struct NutrientCatalog {
  profiles: Vec<Arc<NutrientProfile>>,
  /// 规范名与别名 → 档案下标
  index: HashMap<String, usize>,
  /// 规范化分类 → 该分类下最先加载的档案
  categories: HashMap<String, usize>,
  /// 与 `profiles` 对齐的规范化分类
  category_keys: Vec<Option<String>>,
}

impl NutrientCatalog {
  pub fn from_entries<I>(entries: I) -> Result<Self, CatalogError>
  where
    I: IntoIterator<Item = CatalogEntry>,
  {
    let mut profiles = Vec::new();
    let mut index = HashMap::new();

    for entry in entries {
      let profile = entry.into_profile()?;
      if index.contains_key(&profile.canonical_name) {
        return Err(CatalogError::InvalidEntry {
          name: profile.display_name,
          reason: format!("规范名称 '{}' 重复", profile.canonical_name),
        });
      }
      index.insert(profile.canonical_name.clone(), profiles.len());
      profiles.push(Arc::new(profile));
    }

    if profiles.is_empty() {
      return Err(CatalogError::Empty);
    }

    // 规范名称优先占用键，别名在第二轮登记
    for (idx, profile) in profiles.iter().enumerate() {
      for alias in &profile.aliases {
        match index.get(alias) {
          Some(&owner) if owner != idx => {
            warn!(
              "别名 '{}' 已属于 '{}'，忽略 '{}' 的同名别名",
              alias, profiles[owner].canonical_name, profile.canonical_name
            );
          }
          Some(_) => {}
          None => {
            index.insert(alias.clone(), idx);
          }
        }
      }
    }

    let category_keys: Vec<Option<String>> = profiles
      .iter()
      .map(|profile| {
        profile
          .category
          .as_deref()
          .map(normalize)
          .filter(|category| !category.is_empty())
      })
      .collect();
    let mut categories = HashMap::new();
    for (idx, category) in category_keys.iter().enumerate() {
      if let Some(category) = category {
        categories.entry(category.clone()).or_insert(idx);
      }
    }

    info!(
      "营养库加载完成: {} 个条目, {} 个键, {} 个分类",
      profiles.len(),
      index.len(),
      categories.len()
    );
    Ok(Self {
      profiles,
      index,
      categories,
      category_keys,
    })
  }

  pub fn len(&self) -> usize {
    self.profiles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.profiles.is_empty()
  }

  pub fn profiles(&self) -> &[Arc<NutrientProfile>] {
    &self.profiles
  }

  /// 仅按规范名或别名精确匹配
  pub fn lookup(&self, name: &str) -> Option<Arc<NutrientProfile>> {
    let key = normalize(name);
    self
      .index
      .get(&key)
      .map(|&idx| Arc::clone(&self.profiles[idx]))
  }

  /// 按分类精确匹配，返回该分类下最先加载的档案
  ///
  /// 检测标签往往是泛称（如 `apple`），数据集中的条目名更具体
  /// （如 `Apple, gala, unpeeled, raw`），分类是两者之间的桥梁。
  pub fn lookup_category(&self, category: &str) -> Option<Arc<NutrientProfile>> {
    let key = normalize(category);
    self
      .categories
      .get(&key)
      .map(|&idx| Arc::clone(&self.profiles[idx]))
  }

  /// 先按规范名/别名，再按分类精确匹配
  pub fn lookup_exact(&self, name: &str) -> Option<Arc<NutrientProfile>> {
    self.lookup(name).or_else(|| self.lookup_category(name))
  }

  /// 按相似度降序返回至多 k 个候选，同分按加载顺序
  ///
  /// 档案得分取规范名、别名与分类中的最高分。
  pub fn fuzzy_candidates(&self, name: &str, k: usize) -> Vec<Candidate> {
    let query = normalize(name);
    if query.is_empty() || k == 0 {
      return Vec::new();
    }

    let mut candidates: Vec<Candidate> = self
      .profiles
      .iter()
      .zip(&self.category_keys)
      .filter_map(|(profile, category)| {
        let score = profile
          .keys()
          .chain(category.as_deref())
          .map(|key| similarity(&query, key))
          .fold(0.0_f64, f64::max);
        (score > 0.0).then(|| Candidate {
          profile: Arc::clone(profile),
          score,
        })
      })
      .collect();

    // sort_by 是稳定排序，同分保持加载顺序
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(k);

    debug!(
      "模糊匹配 '{}': {:?}",
      query,
      candidates
        .iter()
        .map(|c| (c.profile.canonical_name.as_str(), c.score))
        .collect::<Vec<_>>()
    );
    candidates
  }
}

/// 进程内共享的营养库句柄，重新加载时整体替换
#[derive(Debug, Clone)]
pub struct CatalogHandle {
  inner: Arc<RwLock<Arc<NutrientCatalog>>>,
}

impl CatalogHandle {
  pub fn new(catalog: NutrientCatalog) -> Self {
    Self {
      inner: Arc::new(RwLock::new(Arc::new(catalog))),
    }
  }

  pub fn load(source: &CatalogSource) -> Result<Self, CatalogError> {
    Ok(Self::new(source.load()?))
  }

  /// 一次请求内使用同一份快照
  pub fn snapshot(&self) -> Result<Arc<NutrientCatalog>, CatalogError> {
    let guard = self.inner.read().map_err(|_| CatalogError::Poisoned)?;
    Ok(Arc::clone(&guard))
  }

  pub fn replace(&self, catalog: NutrientCatalog) -> Result<(), CatalogError> {
    let catalog = Arc::new(catalog);
    let mut guard = self.inner.write().map_err(|_| CatalogError::Poisoned)?;
    *guard = catalog;
    Ok(())
  }

  /// 新营养库完整构建成功后才替换；失败时保留旧营养库
  pub fn reload(&self, source: &CatalogSource) -> Result<usize, CatalogError> {
    info!("重新加载营养库: {}", source);
    let catalog = source.load().inspect_err(|e| {
      warn!("重新加载营养库失败，继续使用旧数据: {}", e);
    })?;
    let len = catalog.len();
    self.replace(catalog)?;
    Ok(len)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn entry(name: &str, aliases: &[&str], nutrients: &[(&str, f64)]) -> CatalogEntry {
    CatalogEntry {
      name: name.to_string(),
      aliases: aliases.iter().map(|a| a.to_string()).collect(),
      category: None,
      nutrients: nutrients
        .iter()
        .map(|(k, v)| (k.to_string(), Some(*v)))
        .collect(),
    }
  }

  pub(crate) fn fruit_catalog() -> NutrientCatalog {
    NutrientCatalog::from_entries(vec![
      entry("Apple", &["red apple", "Malus"], &[("calories", 95.0), ("fiber_g", 4.4)]),
      entry("Banana", &[], &[("calories", 105.0), ("potassium_mg", 422.0)]),
      entry("Hot_Dog", &["frankfurter"], &[("calories", 290.0), ("protein_g", 10.4)]),
      entry("Orange", &["navel orange"], &[("calories", 62.0)]),
    ])
    .unwrap()
  }

  #[test]
  fn normalize_strips_case_punctuation_and_spacing() {
    assert_eq!(normalize("  Hot_Dog!! "), "hot dog");
    assert_eq!(normalize("Crème  Brûlée"), "crème brûlée");
    assert_eq!(normalize("stir-fry (beef)"), "stir fry beef");
    assert_eq!(normalize("!@#"), "");
  }

  #[test]
  fn lookup_is_format_insensitive() {
    let catalog = fruit_catalog();
    let apple = catalog.lookup("APPLE.").unwrap();
    assert_eq!(apple.canonical_name, "apple");
    assert_eq!(catalog.lookup("red-apple").unwrap(), apple);
    assert_eq!(catalog.lookup("hot dog").unwrap().canonical_name, "hot dog");
    assert!(catalog.lookup("pear").is_none());
  }

  #[test]
  fn canonical_names_win_over_aliases() {
    let catalog = NutrientCatalog::from_entries(vec![
      entry("Apple", &["banana"], &[("calories", 95.0)]),
      entry("Banana", &[], &[("calories", 105.0)]),
    ])
    .unwrap();
    assert_eq!(catalog.lookup("banana").unwrap().canonical_name, "banana");
  }

  #[test]
  fn duplicate_canonical_name_is_rejected() {
    let result = NutrientCatalog::from_entries(vec![
      entry("Apple", &[], &[("calories", 95.0)]),
      entry("apple!", &[], &[("calories", 90.0)]),
    ]);
    assert!(matches!(result, Err(CatalogError::InvalidEntry { .. })));
  }

  #[test]
  fn negative_amount_is_rejected() {
    let result = NutrientCatalog::from_entries(vec![entry("Apple", &[], &[("calories", -1.0)])]);
    assert!(matches!(result, Err(CatalogError::InvalidEntry { .. })));
  }

  #[test]
  fn empty_catalog_is_rejected() {
    let result = NutrientCatalog::from_entries(Vec::new());
    assert!(matches!(result, Err(CatalogError::Empty)));
  }

  #[test]
  fn fuzzy_candidates_sorted_and_bounded() {
    let catalog = fruit_catalog();
    let candidates = catalog.fuzzy_candidates("bannana", 3);
    assert!(candidates.len() <= 3);
    assert_eq!(candidates[0].profile.canonical_name, "banana");
    assert!(candidates[0].score >= 0.85);
    for pair in candidates.windows(2) {
      assert!(pair[0].score >= pair[1].score);
    }
  }

  #[test]
  fn fuzzy_ties_follow_insertion_order() {
    let catalog = NutrientCatalog::from_entries(vec![
      entry("abcx", &[], &[("calories", 1.0)]),
      entry("abcy", &[], &[("calories", 2.0)]),
    ])
    .unwrap();
    let candidates = catalog.fuzzy_candidates("abcz", 3);
    assert_eq!(candidates[0].score, candidates[1].score);
    assert_eq!(candidates[0].profile.canonical_name, "abcx");
    assert_eq!(candidates[1].profile.canonical_name, "abcy");
  }

  #[test]
  fn fuzzy_candidates_empty_for_blank_query() {
    let catalog = fruit_catalog();
    assert!(catalog.fuzzy_candidates("   ", 3).is_empty());
    assert!(catalog.fuzzy_candidates("apple", 0).is_empty());
  }

  fn categorized(name: &str, category: &str, calories: f64) -> CatalogEntry {
    CatalogEntry {
      category: Some(category.to_string()),
      ..entry(name, &[], &[("calories", calories)])
    }
  }

  #[test]
  fn category_resolves_generic_label() {
    let catalog = NutrientCatalog::from_entries(vec![
      categorized("Apple, gala, unpeeled, raw", "Apple", 80.0),
      categorized("Apple, fuji, raw", "Apple", 90.0),
      categorized("Banana, raw", "Banana", 105.0),
    ])
    .unwrap();

    assert!(catalog.lookup("apple").is_none());
    let apple = catalog.lookup_category("APPLE").unwrap();
    assert_eq!(apple.canonical_name, "apple gala unpeeled raw");
    assert_eq!(catalog.lookup_exact("apple").unwrap(), apple);
    assert_eq!(
      catalog.lookup_exact("banana").unwrap().canonical_name,
      "banana raw"
    );
    assert!(catalog.lookup_exact("pear").is_none());
  }

  #[test]
  fn name_wins_over_category() {
    let catalog = NutrientCatalog::from_entries(vec![
      categorized("Apple pie", "Apple", 240.0),
      categorized("Apple", "Fruit", 95.0),
    ])
    .unwrap();
    assert_eq!(catalog.lookup_exact("apple").unwrap().canonical_name, "apple");
    assert_eq!(catalog.lookup_exact("fruit").unwrap().canonical_name, "apple");
  }

  #[test]
  fn fuzzy_candidates_score_category() {
    let catalog = NutrientCatalog::from_entries(vec![
      categorized("Apple, gala, unpeeled, raw", "Apple", 80.0),
      categorized("Banana, raw", "Banana", 105.0),
    ])
    .unwrap();
    let candidates = catalog.fuzzy_candidates("aple", 3);
    assert_eq!(candidates[0].profile.canonical_name, "apple gala unpeeled raw");
    assert!(candidates[0].score >= 0.8);
  }

  #[test]
  fn handle_reload_swaps_whole_catalog() {
    let handle = CatalogHandle::new(fruit_catalog());
    let before = handle.snapshot().unwrap();

    let source = CatalogSource::Inline(vec![entry("Pear", &[], &[("calories", 101.0)])]);
    assert_eq!(handle.reload(&source).unwrap(), 1);

    let after = handle.snapshot().unwrap();
    assert!(after.lookup("pear").is_some());
    assert!(after.lookup("apple").is_none());
    // 旧快照不受影响
    assert!(before.lookup("apple").is_some());
  }

  #[test]
  fn failed_reload_keeps_old_catalog() {
    let handle = CatalogHandle::new(fruit_catalog());
    let source = CatalogSource::Inline(Vec::new());
    assert!(handle.reload(&source).is_err());
    assert!(handle.snapshot().unwrap().lookup("apple").is_some());
  }
}
