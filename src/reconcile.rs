// 该文件是 Yingyang （营养） 项目的一部分。
// src/reconcile.rs - 检测标签与营养库对齐
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

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{CatalogError, NutrientCatalog, NutrientProfile};
use crate::detector::Detection;

pub const DEFAULT_ACCEPTANCE_THRESHOLD: f64 = 0.8;
/// 模糊匹配至少取的候选数
pub const MIN_FUZZY_CANDIDATES: usize = 3;
pub const DEFAULT_QUANTITY: f64 = 1.0;

#[derive(Error, Debug)]
pub enum ReconcileError {
  #[error("无法读取营养库: {0}")]
  CatalogUnreadable(#[from] CatalogError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilePolicy {
  pub acceptance_threshold: f64,
  /// 模糊候选数 k，实际取 `max(k, 3)`
  pub candidates: usize,
}

impl Default for ReconcilePolicy {
  fn default() -> Self {
    Self {
      acceptance_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
      candidates: MIN_FUZZY_CANDIDATES,
    }
  }
}

/// 模糊匹配得分达到阈值才接受
pub fn accept_candidate(score: f64, threshold: f64) -> bool {
  score >= threshold
}

/// 对齐后的检测项
///
/// 未被接受的项保留最接近的候选（如果有），方便提示“是否是 …”，
/// 但不参与营养合计。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledItem {
  pub detection: Detection,
  pub profile: Option<Arc<NutrientProfile>>,
  pub match_confidence: f64,
  pub accepted: bool,
  /// 参考份量的倍数
  pub quantity: f64,
}

impl ReconciledItem {
  /// 计入合计时使用的营养档案
  pub fn accepted_profile(&self) -> Option<&NutrientProfile> {
    if self.accepted {
      self.profile.as_deref()
    } else {
      None
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
  policy: ReconcilePolicy,
}

impl Reconciler {
  pub fn new(policy: ReconcilePolicy) -> Self {
    Self { policy }
  }

  pub fn policy(&self) -> &ReconcilePolicy {
    &self.policy
  }

  /// 逐项对齐，输出与输入一一对应、顺序相同
  pub fn reconcile(&self, detections: &[Detection], catalog: &NutrientCatalog) -> Vec<ReconciledItem> {
    let items: Vec<ReconciledItem> = detections
      .iter()
      .map(|detection| self.reconcile_one(detection, catalog))
      .collect();

    let accepted = items.iter().filter(|item| item.accepted).count();
    info!("标签对齐完成: {}/{} 项被接受", accepted, items.len());
    items
  }

  fn reconcile_one(&self, detection: &Detection, catalog: &NutrientCatalog) -> ReconciledItem {
    if let Some(profile) = catalog.lookup_exact(detection.label()) {
      debug!("'{}' 精确匹配 '{}'", detection.label(), profile.canonical_name);
      return ReconciledItem {
        detection: detection.clone(),
        profile: Some(profile),
        match_confidence: 1.0,
        accepted: true,
        quantity: DEFAULT_QUANTITY,
      };
    }

    let k = self.policy.candidates.max(MIN_FUZZY_CANDIDATES);
    let best = catalog.fuzzy_candidates(detection.label(), k).into_iter().next();

    match best {
      Some(candidate) => {
        let accepted = accept_candidate(candidate.score, self.policy.acceptance_threshold);
        debug!(
          "'{}' 模糊匹配 '{}' 得分 {:.3}, {}",
          detection.label(),
          candidate.profile.canonical_name,
          candidate.score,
          if accepted { "接受" } else { "拒绝" }
        );
        ReconciledItem {
          detection: detection.clone(),
          profile: Some(candidate.profile),
          match_confidence: candidate.score,
          accepted,
          quantity: DEFAULT_QUANTITY,
        }
      }
      None => {
        debug!("'{}' 无任何候选", detection.label());
        ReconciledItem {
          detection: detection.clone(),
          profile: None,
          match_confidence: 0.0,
          accepted: false,
          quantity: DEFAULT_QUANTITY,
        }
      }
    }
  }
}
