// 该文件是 Yingyang （营养） 项目的一部分。
// src/config.rs - 流水线参数配置
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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::detector::DetectionPolicy;
use crate::detector::policy::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IOU_THRESHOLD};
use crate::reconcile::{DEFAULT_ACCEPTANCE_THRESHOLD, DEFAULT_QUANTITY, MIN_FUZZY_CANDIDATES, ReconcilePolicy};

const DEFAULT_DETECTION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_CONCURRENT_DETECTIONS: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {path}: {reason}")]
  Unreadable { path: String, reason: String },
  #[error("{name} 必须在 [0, 1] 之间: {value}")]
  ThresholdOutOfRange { name: &'static str, value: f64 },
  #[error("默认份量必须是正有限数: {0}")]
  InvalidQuantity(f64),
  #[error("同时进行的检测数必须大于 0")]
  NoDetectionSlots,
}

/// 流水线可识别的全部参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// 检测置信度下限
  pub confidence_threshold: f32,
  /// NMS 重叠阈值
  pub iou_threshold: f32,
  /// 模糊匹配接受阈值
  pub acceptance_threshold: f64,
  /// 没有份量提示时的份量倍数
  pub default_quantity: f64,
  /// 模糊候选数，不少于 3
  pub fuzzy_candidates: usize,
  /// 检测阶段超时（毫秒），0 表示不限
  pub detection_timeout_ms: u64,
  /// 同时运行的检测线程上限，含超时后仍未结束的线程
  pub max_concurrent_detections: usize,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      acceptance_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
      default_quantity: DEFAULT_QUANTITY,
      fuzzy_candidates: MIN_FUZZY_CANDIDATES,
      detection_timeout_ms: DEFAULT_DETECTION_TIMEOUT_MS,
      max_concurrent_detections: DEFAULT_MAX_CONCURRENT_DETECTIONS,
    }
  }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::ThresholdOutOfRange { name, value })
  }
}

impl PipelineConfig {
  pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
    let unreadable = |reason: String| ConfigError::Unreadable {
      path: path.display().to_string(),
      reason,
    };
    let data = std::fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    let config: PipelineConfig = serde_json::from_slice(&data).map_err(|e| unreadable(e.to_string()))?;
    info!("读取配置文件: {}", path.display());
    config.validate()
  }

  pub fn validate(self) -> Result<Self, ConfigError> {
    check_unit("confidence_threshold", f64::from(self.confidence_threshold))?;
    check_unit("iou_threshold", f64::from(self.iou_threshold))?;
    check_unit("acceptance_threshold", self.acceptance_threshold)?;
    if !self.default_quantity.is_finite() || self.default_quantity <= 0.0 {
      return Err(ConfigError::InvalidQuantity(self.default_quantity));
    }
    if self.max_concurrent_detections == 0 {
      return Err(ConfigError::NoDetectionSlots);
    }
    Ok(self)
  }

  pub fn detection_policy(&self) -> DetectionPolicy {
    DetectionPolicy {
      confidence_threshold: self.confidence_threshold,
      iou_threshold: self.iou_threshold,
    }
  }

  pub fn reconcile_policy(&self) -> ReconcilePolicy {
    ReconcilePolicy {
      acceptance_threshold: self.acceptance_threshold,
      candidates: self.fuzzy_candidates.max(MIN_FUZZY_CANDIDATES),
    }
  }

  pub fn detection_timeout(&self) -> Option<Duration> {
    (self.detection_timeout_ms > 0).then(|| Duration::from_millis(self.detection_timeout_ms))
  }
}

/// 命令行参数覆盖
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConfigArgs {
  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub nms_threshold: Option<f32>,

  /// 模糊匹配接受阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub acceptance: Option<f64>,

  /// 默认份量倍数
  #[arg(long, value_name = "QUANTITY")]
  pub quantity: Option<f64>,

  /// 检测超时（毫秒），0 表示不限
  #[arg(long, value_name = "MILLIS")]
  pub timeout_ms: Option<u64>,

  /// 同时运行的检测线程上限
  #[arg(long, value_name = "N")]
  pub max_detections: Option<usize>,
}

impl ConfigArgs {
  /// 配置文件（或默认值）之上叠加命令行参数，最后统一校验
  pub fn resolve(&self) -> Result<PipelineConfig, ConfigError> {
    let mut config = match &self.config {
      Some(path) => PipelineConfig::from_json_file(path)?,
      None => PipelineConfig::default(),
    };
    if let Some(v) = self.confidence {
      config.confidence_threshold = v;
    }
    if let Some(v) = self.nms_threshold {
      config.iou_threshold = v;
    }
    if let Some(v) = self.acceptance {
      config.acceptance_threshold = v;
    }
    if let Some(v) = self.quantity {
      config.default_quantity = v;
    }
    if let Some(v) = self.timeout_ms {
      config.detection_timeout_ms = v;
    }
    if let Some(v) = self.max_detections {
      config.max_concurrent_detections = v;
    }
    config.validate()
  }
}
