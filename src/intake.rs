// 该文件是 Yingyang （营养） 项目的一部分。
// src/intake.rs - 摄入记录与每日汇总
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

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::NutrientAmounts;
use crate::reconcile::{DEFAULT_QUANTITY, ReconciledItem};

pub mod gaps;
pub mod ledger;

pub use self::gaps::{GapError, GapReport, NutrientGap, RecommendedIntake, RecommendedIntakeTable, calculate_gaps};
pub use self::ledger::{IntakeLedger, LedgerError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
  #[error("第 {index} 项的份量无效: {quantity}")]
  InvalidQuantity { index: usize, quantity: f64 },
  #[error("默认份量无效: {0}")]
  InvalidDefaultQuantity(f64),
  #[error("记录属于 {actual_user}/{actual_date}，汇总属于 {expected_user}/{expected_date}")]
  SummaryMismatch {
    expected_user: String,
    expected_date: NaiveDate,
    actual_user: String,
    actual_date: NaiveDate,
  },
}

/// 按检测项下标给出的份量倍数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantityHints(BTreeMap<usize, f64>);

impl QuantityHints {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, index: usize, quantity: f64) -> Self {
    self.0.insert(index, quantity);
    self
  }

  pub fn get(&self, index: usize) -> Option<f64> {
    self.0.get(&index).copied()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl FromIterator<(usize, f64)> for QuantityHints {
  fn from_iter<T: IntoIterator<Item = (usize, f64)>>(iter: T) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// 一次成功流水线运行的产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeRecord {
  /// 提交编号，持久化层以此去重
  pub submission_id: Uuid,
  pub user_id: String,
  pub timestamp: DateTime<Utc>,
  pub items: Vec<ReconciledItem>,
  pub totals: NutrientAmounts,
}

impl IntakeRecord {
  /// 归属的自然日（UTC）
  pub fn date(&self) -> NaiveDate {
    self.timestamp.date_naive()
  }

  pub fn accepted_count(&self) -> usize {
    self.items.iter().filter(|item| item.accepted).count()
  }
}

/// 被接受项按份量缩放后的逐营养素合计
pub fn sum_totals(items: &[ReconciledItem]) -> NutrientAmounts {
  let mut totals = NutrientAmounts::new();
  for item in items {
    let Some(profile) = item.accepted_profile() else {
      continue;
    };
    for (nutrient, amount) in &profile.nutrients {
      *totals.entry(nutrient.clone()).or_insert(0.0) += amount * item.quantity;
    }
  }
  totals
}

fn add_totals(into: &mut NutrientAmounts, from: &NutrientAmounts) {
  for (nutrient, amount) in from {
    *into.entry(nutrient.clone()).or_insert(0.0) += amount;
  }
}

fn valid_quantity(quantity: f64) -> bool {
  quantity.is_finite() && quantity >= 0.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregator {
  default_quantity: f64,
}

impl Default for Aggregator {
  fn default() -> Self {
    Self {
      default_quantity: DEFAULT_QUANTITY,
    }
  }
}

impl Aggregator {
  pub fn new(default_quantity: f64) -> Result<Self, AggregationError> {
    if !default_quantity.is_finite() || default_quantity <= 0.0 {
      return Err(AggregationError::InvalidDefaultQuantity(default_quantity));
    }
    Ok(Self { default_quantity })
  }

  pub fn default_quantity(&self) -> f64 {
    self.default_quantity
  }

  /// 生成摄入记录
  ///
  /// 每项的份量取提示值，缺省为默认份量；只有被接受的项计入合计。
  /// 被接受项上的非法份量使整条记录失败；未被接受的项不计入合计，
  /// 其非法份量只记录日志并改用默认份量。
  pub fn build_record(
    &self,
    user_id: impl Into<String>,
    timestamp: DateTime<Utc>,
    mut items: Vec<ReconciledItem>,
    hints: &QuantityHints,
  ) -> Result<IntakeRecord, AggregationError> {
    for index in hints.0.keys().filter(|index| **index >= items.len()) {
      warn!("份量提示下标 {} 超出检测项数量 {}，忽略", index, items.len());
    }

    for (index, item) in items.iter_mut().enumerate() {
      let quantity = hints.get(index).unwrap_or(self.default_quantity);
      item.quantity = match (valid_quantity(quantity), item.accepted) {
        (true, _) => quantity,
        (false, true) => return Err(AggregationError::InvalidQuantity { index, quantity }),
        (false, false) => {
          warn!("未识别项 {} 的份量 {} 无效，改用默认份量", index, quantity);
          self.default_quantity
        }
      };
    }

    let totals = sum_totals(&items);
    let record = IntakeRecord {
      submission_id: Uuid::new_v4(),
      user_id: user_id.into(),
      timestamp,
      items,
      totals,
    };
    debug!(
      "生成摄入记录 {}: {} 项, {} 种营养素",
      record.submission_id,
      record.items.len(),
      record.totals.len()
    );
    Ok(record)
  }
}

/// 某用户某日的摄入汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyIntakeSummary {
  pub user_id: String,
  pub date: NaiveDate,
  pub totals: NutrientAmounts,
  pub record_count: u64,
}

impl DailyIntakeSummary {
  pub fn empty(user_id: impl Into<String>, date: NaiveDate) -> Self {
    Self {
      user_id: user_id.into(),
      date,
      totals: NutrientAmounts::new(),
      record_count: 0,
    }
  }

  pub fn for_record(record: &IntakeRecord) -> Self {
    Self::empty(record.user_id.clone(), record.date())
  }

  fn check_owner(&self, user_id: &str, date: NaiveDate) -> Result<(), AggregationError> {
    if self.user_id != user_id || self.date != date {
      return Err(AggregationError::SummaryMismatch {
        expected_user: self.user_id.clone(),
        expected_date: self.date,
        actual_user: user_id.to_string(),
        actual_date: date,
      });
    }
    Ok(())
  }
}

/// 把一条记录并入汇总
///
/// 纯函数；同一记录并入两次会重复计数，去重由调用方负责。
pub fn fold(
  mut summary: DailyIntakeSummary,
  record: &IntakeRecord,
) -> Result<DailyIntakeSummary, AggregationError> {
  summary.check_owner(&record.user_id, record.date())?;
  add_totals(&mut summary.totals, &record.totals);
  summary.record_count += 1;
  Ok(summary)
}

/// 合并同一用户同一日的两份汇总
pub fn merge(
  mut left: DailyIntakeSummary,
  right: &DailyIntakeSummary,
) -> Result<DailyIntakeSummary, AggregationError> {
  left.check_owner(&right.user_id, right.date)?;
  add_totals(&mut left.totals, &right.totals);
  left.record_count += right.record_count;
  Ok(left)
}
