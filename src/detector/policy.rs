// 该文件是 Yingyang （营养） 项目的一部分。
// src/detector/policy.rs - 置信度过滤与非极大值抑制
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

use tracing::debug;

use super::{BoundingBox, Detection};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// 检测后处理策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionPolicy {
  /// 低于该置信度的检测被丢弃
  pub confidence_threshold: f32,
  /// 同类检测框 IoU 超过该值时只保留置信度最高者
  pub iou_threshold: f32,
}

impl Default for DetectionPolicy {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
    }
  }
}

impl DetectionPolicy {
  pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
    let total = detections.len();
    let kept = filter_by_confidence(detections, self.confidence_threshold);
    let filtered = kept.len();
    let result = non_max_suppression(kept, self.iou_threshold);
    debug!(
      "后处理: {} 个候选 → 置信度过滤后 {} → NMS 后 {}",
      total,
      filtered,
      result.len()
    );
    result
  }
}

/// 保留置信度不低于阈值的检测，顺序不变
pub fn filter_by_confidence(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
  detections
    .into_iter()
    .filter(|d| d.confidence() >= threshold)
    .collect()
}

/// 交并比
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
  let x1 = a.x_min.max(b.x_min);
  let y1 = a.y_min.max(b.y_min);
  let x2 = a.x_max.min(b.x_max);
  let y2 = a.y_max.min(b.y_max);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = a.area() + b.area() - intersection;

  if union <= 0.0 {
    0.0
  } else {
    intersection / union
  }
}

/// 按类别的非极大值抑制
///
/// 结果按置信度降序排列；同分时保持输入顺序。
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  detections.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));

  let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
  for candidate in detections {
    let suppressed = keep.iter().any(|kept| {
      kept.label() == candidate.label() && iou(kept.bbox(), candidate.bbox()) > iou_threshold
    });
    if !suppressed {
      keep.push(candidate);
    }
  }
  keep
}
