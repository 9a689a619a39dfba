// 该文件是 Yingyang （营养） 项目的一部分。
// src/catalog/source.rs - 营养库数据源
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

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{CatalogError, NutrientCatalog, NutrientProfile, normalize};
use crate::{FromUrl, FromUrlWithScheme, decoded_path};

/// 数据集中的一行
///
/// 营养素允许为 `null`（数据表中的空单元格），加载时跳过。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
  pub name: String,
  #[serde(default)]
  pub aliases: Vec<String>,
  #[serde(default)]
  pub category: Option<String>,
  pub nutrients: BTreeMap<String, Option<f64>>,
}

impl CatalogEntry {
  pub(super) fn into_profile(self) -> Result<NutrientProfile, CatalogError> {
    let canonical_name = normalize(&self.name);
    if canonical_name.is_empty() {
      return Err(CatalogError::InvalidEntry {
        name: self.name,
        reason: "规范化后名称为空".to_string(),
      });
    }

    let mut nutrients = BTreeMap::new();
    for (nutrient, amount) in self.nutrients {
      let Some(amount) = amount else {
        continue;
      };
      if !amount.is_finite() || amount < 0.0 {
        return Err(CatalogError::InvalidEntry {
          name: self.name,
          reason: format!("营养素 '{}' 含量无效: {}", nutrient, amount),
        });
      }
      nutrients.insert(nutrient, amount);
    }

    let aliases = self
      .aliases
      .iter()
      .map(|alias| normalize(alias))
      .filter(|alias| !alias.is_empty() && *alias != canonical_name)
      .collect();

    Ok(NutrientProfile {
      canonical_name,
      display_name: self.name,
      category: self.category,
      aliases,
      nutrients,
    })
  }
}

#[derive(Debug, Clone)]
pub enum CatalogSource {
  /// JSON 数组文件
  JsonFile(PathBuf),
  /// 内存中的条目
  Inline(Vec<CatalogEntry>),
}

impl FromUrlWithScheme for CatalogSource {
  const SCHEME: &'static str = "json";
}

impl FromUrl for CatalogSource {
  type Error = CatalogError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CatalogError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    Ok(CatalogSource::JsonFile(decoded_path(url)))
  }
}

impl fmt::Display for CatalogSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CatalogSource::JsonFile(path) => write!(f, "json://{}", path.display()),
      CatalogSource::Inline(entries) => write!(f, "inline({} entries)", entries.len()),
    }
  }
}

impl CatalogSource {
  pub fn load(&self) -> Result<NutrientCatalog, CatalogError> {
    match self {
      CatalogSource::JsonFile(path) => {
        info!("读取营养库文件: {}", path.display());
        let data = std::fs::read(path).map_err(|e| CatalogError::Unavailable {
          origin: self.to_string(),
          reason: e.to_string(),
        })?;
        debug!("营养库文件大小: {:.2} KB", data.len() as f64 / 1024.0);
        let entries: Vec<CatalogEntry> =
          serde_json::from_slice(&data).map_err(|e| CatalogError::Unavailable {
            origin: self.to_string(),
            reason: e.to_string(),
          })?;
        NutrientCatalog::from_entries(entries)
      }
      CatalogSource::Inline(entries) => NutrientCatalog::from_entries(entries.clone()),
    }
  }
}
