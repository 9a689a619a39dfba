// 该文件是 Yingyang （营养） 项目的一部分。
// src/detector.rs - 食物检测适配器
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

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame::{Frame, FrameError};
use crate::model::{DetectItem, Model};

pub mod policy;

pub use self::policy::{DetectionPolicy, filter_by_confidence, iou, non_max_suppression};

/// 边界框，像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl From<[f32; 4]> for BoundingBox {
  fn from([x_min, y_min, x_max, y_max]: [f32; 4]) -> Self {
    Self {
      x_min,
      y_min,
      x_max,
      y_max,
    }
  }
}

impl BoundingBox {
  pub fn width(&self) -> f32 {
    (self.x_max - self.x_min).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.y_max - self.y_min).max(0.0)
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  fn is_well_formed(&self) -> bool {
    [self.x_min, self.y_min, self.x_max, self.y_max]
      .iter()
      .all(|v| v.is_finite())
      && self.x_min <= self.x_max
      && self.y_min <= self.y_max
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidDetection {
  #[error("置信度超出 [0, 1]: {0}")]
  ConfidenceOutOfRange(f32),
  #[error("边界框无效: {0:?}")]
  InvalidBox(BoundingBox),
  #[error("类别标签为空")]
  EmptyLabel,
}

/// 单个检测区域，构造后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  label: String,
  confidence: f32,
  bbox: BoundingBox,
}

impl Detection {
  pub fn new(
    label: impl Into<String>,
    confidence: f32,
    bbox: BoundingBox,
  ) -> Result<Self, InvalidDetection> {
    let label = label.into();
    if label.trim().is_empty() {
      return Err(InvalidDetection::EmptyLabel);
    }
    // NaN 也落在这里
    if !(0.0..=1.0).contains(&confidence) {
      return Err(InvalidDetection::ConfidenceOutOfRange(confidence));
    }
    if !bbox.is_well_formed() {
      return Err(InvalidDetection::InvalidBox(bbox));
    }
    Ok(Self {
      label,
      confidence,
      bbox,
    })
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }

  pub fn bbox(&self) -> &BoundingBox {
    &self.bbox
  }
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("无法解码图像: {0}")]
  Decode(#[from] FrameError),
  #[error("模型推理失败: {0}")]
  Model(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 一次检测的结果
#[derive(Debug, Clone, Serialize)]
pub struct DetectResult {
  pub items: Vec<Detection>,
  pub image_width: u32,
  pub image_height: u32,
  /// 解码 + 推理 + 后处理耗时
  pub elapsed: Duration,
  /// 后端给出的原始候选数
  pub candidates: usize,
}

/// 图像字节 → 检测结果
///
/// 实现者在进程内共享，必须可被多个请求并发调用。
/// 置信度阈值与 NMS 由调用方的 `policy` 决定。
pub trait Detect: Send + Sync {
  fn detect(&self, image: &[u8], policy: &DetectionPolicy) -> Result<DetectResult, InferenceError>;
}

/// 以任意检测模型为后端的食物检测器
pub struct FoodDetector<M> {
  model: M,
}

impl<M> FoodDetector<M> {
  pub fn new(model: M) -> Self {
    Self { model }
  }

  pub fn model(&self) -> &M {
    &self.model
  }
}

/// 归一化候选 → 像素坐标检测，非法候选丢弃
fn to_detections(items: Vec<DetectItem>, width: u32, height: u32) -> Vec<Detection> {
  let (w, h) = (width as f32, height as f32);
  items
    .into_iter()
    .filter_map(|item| {
      let bbox = BoundingBox {
        x_min: item.bbox[0] * w,
        y_min: item.bbox[1] * h,
        x_max: item.bbox[2] * w,
        y_max: item.bbox[3] * h,
      };
      match Detection::new(item.label, item.score, bbox) {
        Ok(detection) => Some(detection),
        Err(e) => {
          warn!("丢弃无效检测: {}", e);
          None
        }
      }
    })
    .collect()
}

impl<M, E> Detect for FoodDetector<M>
where
  M: Model<Input = Frame, Output = Vec<DetectItem>, Error = E> + Send + Sync,
  E: std::error::Error + Send + Sync + 'static,
{
  fn detect(&self, image: &[u8], policy: &DetectionPolicy) -> Result<DetectResult, InferenceError> {
    let now = Instant::now();
    let frame = Frame::decode(image)?;
    debug!("图像解码完成: {}x{}", frame.width(), frame.height());

    let raw = self
      .model
      .infer(&frame)
      .map_err(|e| InferenceError::Model(Box::new(e)))?;
    let candidates = raw.len();

    let detections = to_detections(raw, frame.width(), frame.height());
    let items = policy.apply(detections);
    let elapsed = now.elapsed();
    info!(
      "检测完成: {} 个候选, 保留 {} 个, 耗时 {:.2?}",
      candidates,
      items.len(),
      elapsed
    );

    Ok(DetectResult {
      items,
      image_width: frame.width(),
      image_height: frame.height(),
      elapsed,
      candidates,
    })
  }
}
