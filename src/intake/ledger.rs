// 该文件是 Yingyang （营养） 项目的一部分。
// src/intake/ledger.rs - 进程内摄入账本
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

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::{AggregationError, DailyIntakeSummary, IntakeRecord, fold};

#[derive(Error, Debug)]
pub enum LedgerError {
  #[error("记录 {0} 已提交过")]
  DuplicateRecord(Uuid),
  #[error("汇总错误: {0}")]
  Aggregation(#[from] AggregationError),
  #[error("账本锁已损坏")]
  Poisoned,
}

#[derive(Debug, Default)]
struct LedgerState {
  summaries: HashMap<(String, NaiveDate), DailyIntakeSummary>,
  committed: HashSet<Uuid>,
}

/// 每用户每日汇总的账本
///
/// 同一把锁内完成去重与读改写，同一用户同一日的并发提交被串行化。
#[derive(Debug, Default)]
pub struct IntakeLedger {
  state: Mutex<LedgerState>,
}

impl IntakeLedger {
  pub fn new() -> Self {
    Self::default()
  }

  /// 提交一条记录，返回更新后的当日汇总
  pub fn commit(&self, record: &IntakeRecord) -> Result<DailyIntakeSummary, LedgerError> {
    let mut state = self.state.lock().map_err(|_| LedgerError::Poisoned)?;

    if state.committed.contains(&record.submission_id) {
      warn!("重复提交的记录 {}，拒绝", record.submission_id);
      return Err(LedgerError::DuplicateRecord(record.submission_id));
    }

    let key = (record.user_id.clone(), record.date());
    let current = state
      .summaries
      .get(&key)
      .cloned()
      .unwrap_or_else(|| DailyIntakeSummary::for_record(record));
    let updated = fold(current, record)?;

    state.committed.insert(record.submission_id);
    state.summaries.insert(key, updated.clone());
    info!(
      "用户 {} 在 {} 的第 {} 条记录已入账",
      updated.user_id, updated.date, updated.record_count
    );
    Ok(updated)
  }

  pub fn summary(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyIntakeSummary>, LedgerError> {
    let state = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
    Ok(state.summaries.get(&(user_id.to_string(), date)).cloned())
  }

  /// 某用户的全部每日汇总，按日期升序
  pub fn summaries_for(&self, user_id: &str) -> Result<Vec<DailyIntakeSummary>, LedgerError> {
    let state = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
    let mut summaries: Vec<DailyIntakeSummary> = state
      .summaries
      .iter()
      .filter(|((user, _), _)| user == user_id)
      .map(|(_, summary)| summary.clone())
      .collect();
    summaries.sort_by_key(|summary| summary.date);
    Ok(summaries)
  }

  pub fn record_count(&self) -> Result<usize, LedgerError> {
    let state = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
    Ok(state.committed.len())
  }
}
