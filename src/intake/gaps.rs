// 该文件是 Yingyang （营养） 项目的一部分。
// src/intake/gaps.rs - 推荐摄入量与营养缺口
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
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::NutrientAmounts;

/// 缺省的能量营养素编号
pub const DEFAULT_ENERGY_KEY: &str = "calories";

#[derive(Error, Debug)]
pub enum GapError {
  #[error("无法读取推荐摄入量表 {path}: {reason}")]
  Unavailable { path: String, reason: String },
  #[error("没有 {age} 岁 {gender} 的推荐摄入量")]
  NoRecommendation { age: u32, gender: String },
}

/// 推荐摄入量表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedIntake {
  pub nutrient: String,
  pub unit: String,
  pub age: u32,
  pub gender: String,
  pub intake: f64,
  #[serde(default)]
  pub category: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecommendedIntakeTable {
  rows: Vec<RecommendedIntake>,
}

impl RecommendedIntakeTable {
  pub fn new(rows: Vec<RecommendedIntake>) -> Self {
    Self { rows }
  }

  pub fn from_json_file(path: &Path) -> Result<Self, GapError> {
    let unavailable = |reason: String| GapError::Unavailable {
      path: path.display().to_string(),
      reason,
    };
    let data = std::fs::read(path).map_err(|e| unavailable(e.to_string()))?;
    let rows: Vec<RecommendedIntake> =
      serde_json::from_slice(&data).map_err(|e| unavailable(e.to_string()))?;
    info!("推荐摄入量表加载完成: {} 行", rows.len());
    Ok(Self::new(rows))
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  /// 按年龄与性别选取推荐值，性别不区分大小写
  pub fn for_profile(&self, age: u32, gender: &str) -> Result<Vec<&RecommendedIntake>, GapError> {
    let rows: Vec<&RecommendedIntake> = self
      .rows
      .iter()
      .filter(|row| row.age == age && row.gender.eq_ignore_ascii_case(gender))
      .collect();
    if rows.is_empty() {
      return Err(GapError::NoRecommendation {
        age,
        gender: gender.to_string(),
      });
    }
    Ok(rows)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NutrientGap {
  pub recommended: f64,
  pub current: f64,
  pub unit: String,
  /// 推荐值 − 当前值；负数表示超量
  pub gap: f64,
  pub gap_percentage: f64,
  pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapReport {
  pub gaps: BTreeMap<String, NutrientGap>,
  /// 当前摄入为 0 的营养素
  pub missing: Vec<String>,
  /// 超过推荐值的营养素
  pub excess: Vec<String>,
  pub total_energy: f64,
}

pub fn calculate_gaps(
  recommended: &[&RecommendedIntake],
  totals: &NutrientAmounts,
  energy_key: &str,
) -> GapReport {
  let mut gaps = BTreeMap::new();
  let mut missing = Vec::new();
  let mut excess = Vec::new();

  for row in recommended {
    let current = totals.get(&row.nutrient).copied().unwrap_or(0.0);
    let gap = row.intake - current;
    let gap_percentage = if row.intake > 0.0 {
      gap / row.intake * 100.0
    } else {
      0.0
    };

    if current == 0.0 {
      missing.push(row.nutrient.clone());
    } else if gap < 0.0 {
      excess.push(row.nutrient.clone());
    }

    gaps.insert(
      row.nutrient.clone(),
      NutrientGap {
        recommended: row.intake,
        current,
        unit: row.unit.clone(),
        gap,
        gap_percentage,
        category: row.category.clone(),
      },
    );
  }

  let total_energy = totals.get(energy_key).copied().unwrap_or(0.0);
  debug!(
    "缺口分析: {} 项, 缺失 {}, 超量 {}",
    gaps.len(),
    missing.len(),
    excess.len()
  );
  GapReport {
    gaps,
    missing,
    excess,
    total_energy,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn row(nutrient: &str, age: u32, gender: &str, intake: f64) -> RecommendedIntake {
    RecommendedIntake {
      nutrient: nutrient.to_string(),
      unit: "g".to_string(),
      age,
      gender: gender.to_string(),
      intake,
      category: None,
    }
  }

  #[test]
  fn gaps_classify_missing_and_excess() {
    let rows = [
      row("protein_g", 6, "girl", 30.0),
      row("fiber_g", 6, "girl", 20.0),
      row("sugar_g", 6, "girl", 10.0),
      row("trace_g", 6, "girl", 0.0),
    ];
    let refs: Vec<&RecommendedIntake> = rows.iter().collect();
    let totals = NutrientAmounts::from([
      ("protein_g".to_string(), 15.0),
      ("sugar_g".to_string(), 25.0),
      ("trace_g".to_string(), 1.0),
      ("calories".to_string(), 800.0),
    ]);

    let report = calculate_gaps(&refs, &totals, DEFAULT_ENERGY_KEY);
    assert_eq!(report.total_energy, 800.0);
    assert_eq!(report.missing, vec!["fiber_g".to_string()]);
    assert_eq!(report.excess, vec!["sugar_g".to_string(), "trace_g".to_string()]);
    assert_eq!(report.gaps["protein_g"].gap, 15.0);
    assert_eq!(report.gaps["protein_g"].gap_percentage, 50.0);
    assert_eq!(report.gaps["sugar_g"].gap, -15.0);
    assert_eq!(report.gaps["trace_g"].gap_percentage, 0.0);
  }

  #[test]
  fn table_selects_by_age_and_gender() {
    let table = RecommendedIntakeTable::new(vec![
      row("protein_g", 6, "girl", 30.0),
      row("protein_g", 6, "boy", 32.0),
      row("protein_g", 7, "girl", 34.0),
    ]);
    let rows = table.for_profile(6, "Boy").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].intake, 32.0);
    assert!(matches!(
      table.for_profile(9, "girl"),
      Err(GapError::NoRecommendation { age: 9, .. })
    ));
  }

  #[test]
  fn table_loads_from_json() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
      file,
      r#"[{{"nutrient": "calcium_mg", "unit": "mg", "age": 6, "gender": "girl", "intake": 800, "category": "mineral"}}]"#
    )
    .unwrap();
    let table = RecommendedIntakeTable::from_json_file(file.path()).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(
      table.for_profile(6, "girl").unwrap()[0].category.as_deref(),
      Some("mineral")
    );
  }
}
