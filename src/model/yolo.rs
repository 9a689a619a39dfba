// 该文件是 Yingyang （营养） 项目的一部分。
// src/model/yolo.rs - ONNX YOLO 检测模型
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, error, info};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  frame::Frame,
  model::{DetectItem, LabelError, LabelTable, Model},
  query_value,
};

const YOLO_SCHEME: &str = "onnx";
const YOLO_DEFAULT_INPUT_SIZE: u32 = 640;
const YOLO_BOX_FEATURES: usize = 4;
/// 进入 NMS 的候选上限
const YOLO_MAX_CANDIDATES: usize = 300;

type OnnxPlan = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, String),
  #[error("推理错误: {0}")]
  TractError(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("标签错误: {0}")]
  LabelError(#[from] LabelError),
  #[error("输出形状无效: {0:?}, 类别数 {1}")]
  InvalidOutputShape(Vec<usize>, usize),
}

impl From<TractError> for YoloError {
  fn from(err: TractError) -> Self {
    YoloError::TractError(format!("{:#}", err))
  }
}

impl YoloError {
  fn invalid(msg: &str, e: TractError) -> Self {
    YoloError::ModelInvalid(msg.to_string(), format!("{:#}", e))
  }
}

pub struct YoloOnnxBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  input_size: u32,
}

impl FromUrlWithScheme for YoloOnnxBuilder {
  const SCHEME: &'static str = YOLO_SCHEME;
}

impl FromUrl for YoloOnnxBuilder {
  type Error = YoloError;

  /// `onnx:///path/model.onnx?labels=/path/labels.txt&size=640`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != YOLO_SCHEME {
      return Err(YoloError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        YOLO_SCHEME
      )));
    }

    let mut builder = YoloOnnxBuilder::new(decoded_path(url));
    if let Some(labels) = query_value(url, "labels") {
      builder = builder.labels(labels);
    }
    if let Some(size) = query_value(url, "size") {
      let size = size
        .parse::<u32>()
        .map_err(|e| YoloError::ModelPathError(format!("输入尺寸无效 '{}': {}", size, e)))?;
      builder = builder.input_size(size);
    }
    Ok(builder)
  }
}

impl YoloOnnxBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      input_size: YOLO_DEFAULT_INPUT_SIZE,
    }
  }

  pub fn labels(mut self, path: impl Into<PathBuf>) -> Self {
    self.labels_path = Some(path.into());
    self
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size;
    self
  }

  /// 加载并优化模型，随后空跑一次校验输出形状
  pub fn build(self) -> Result<YoloOnnx, YoloError> {
    if self.input_size == 0 || self.input_size % 32 != 0 {
      return Err(YoloError::ModelPathError(format!(
        "输入尺寸必须是 32 的正整数倍: {}",
        self.input_size
      )));
    }

    if !self.model_path.is_file() {
      error!("模型文件不存在: {}", self.model_path.display());
      return Err(YoloError::ModelPathError(format!(
        "模型文件不存在: {}",
        self.model_path.display()
      )));
    }

    let labels = match &self.labels_path {
      Some(path) => LabelTable::from_file(path)?,
      None => LabelTable::coco(),
    };
    debug!("类别数量: {}", labels.len());

    info!("加载模型文件: {}", self.model_path.display());
    let size = self.input_size as usize;
    let plan = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .map_err(|e| YoloError::invalid("无法解析 ONNX 模型", e))?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
      )
      .map_err(|e| YoloError::invalid("无法设置输入形状", e))?
      .into_optimized()
      .map_err(|e| YoloError::invalid("模型优化失败", e))?
      .into_runnable()
      .map_err(|e| YoloError::invalid("无法创建推理计划", e))?;

    let model = YoloOnnx {
      plan,
      labels,
      input_size: self.input_size,
    };

    info!("空跑校验模型输出");
    let blank = vec![0f32; 3 * size * size];
    let (shape, _) = model.run_plan(blank)?;
    if output_layout(&shape, model.labels.len()).is_none() {
      error!("模型输出形状 {:?} 与 {} 个类别不符", shape, model.labels.len());
      return Err(YoloError::InvalidOutputShape(shape, model.labels.len()));
    }
    info!("模型加载完成, 输出形状 {:?}", shape);

    Ok(model)
  }
}

/// 只读共享的 YOLO 推理计划，可被多个请求并发调用
pub struct YoloOnnx {
  plan: OnnxPlan,
  labels: LabelTable,
  input_size: u32,
}

impl YoloOnnx {
  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  pub fn input_size(&self) -> u32 {
    self.input_size
  }

  fn run_plan(&self, data: Vec<f32>) -> Result<(Vec<usize>, Vec<f32>), YoloError> {
    let size = self.input_size as usize;
    let input: Tensor = tract_ndarray::Array4::from_shape_vec((1, 3, size, size), data)
      .map_err(|e| YoloError::TractError(e.to_string()))?
      .into();
    let outputs = self.plan.run(tvec!(input.into()))?;
    let output = outputs
      .first()
      .ok_or_else(|| YoloError::TractError("模型没有输出".to_string()))?;
    let view = output.to_array_view::<f32>()?;
    Ok((view.shape().to_vec(), view.iter().copied().collect()))
  }
}

impl Model for YoloOnnx {
  type Input = Frame;
  type Output = Vec<DetectItem>;
  type Error = YoloError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("设置模型输入 {}x{}", input.width(), input.height());
    let tensor = input.to_nchw(self.input_size, self.input_size);

    debug!("执行模型推理");
    let (shape, data) = self.run_plan(tensor.into_vec())?;

    decode_output(&shape, &data, &self.labels, self.input_size as f32)
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Layout {
  /// [1, 4 + C, N]，YOLOv8 默认导出
  FeaturesFirst { anchors: usize },
  /// [1, N, 4 + C]
  AnchorsFirst { anchors: usize },
}

fn output_layout(shape: &[usize], num_classes: usize) -> Option<Layout> {
  let features = YOLO_BOX_FEATURES + num_classes;
  match shape {
    [1, f, n] if *f == features => Some(Layout::FeaturesFirst { anchors: *n }),
    [1, n, f] if *f == features => Some(Layout::AnchorsFirst { anchors: *n }),
    _ => None,
  }
}

/// 解码 YOLO 输出张量为归一化的候选框
///
/// 框坐标以模型输入像素为单位（中心点 + 宽高），按 `input_size` 归一化后
/// 裁剪到 [0, 1]。每个锚点只保留得分最高的类别。
pub fn decode_output(
  shape: &[usize],
  data: &[f32],
  labels: &LabelTable,
  input_size: f32,
) -> Result<Vec<DetectItem>, YoloError> {
  let num_classes = labels.len();
  let layout = output_layout(shape, num_classes)
    .ok_or_else(|| YoloError::InvalidOutputShape(shape.to_vec(), num_classes))?;
  let features = YOLO_BOX_FEATURES + num_classes;

  let (anchors, at): (usize, Box<dyn Fn(usize, usize) -> f32 + '_>) = match layout {
    Layout::FeaturesFirst { anchors } => (anchors, Box::new(move |f, n| data[f * anchors + n])),
    Layout::AnchorsFirst { anchors } => (anchors, Box::new(move |f, n| data[n * features + f])),
  };

  if data.len() != anchors * features {
    return Err(YoloError::InvalidOutputShape(shape.to_vec(), num_classes));
  }

  let mut items = Vec::new();
  for n in 0..anchors {
    let (class_id, score) = (0..num_classes)
      .map(|c| (c, at(YOLO_BOX_FEATURES + c, n)))
      .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if !score.is_finite() {
      continue;
    }

    let (cx, cy, w, h) = (at(0, n), at(1, n), at(2, n), at(3, n));
    let bbox = [
      ((cx - w / 2.0) / input_size).clamp(0.0, 1.0),
      ((cy - h / 2.0) / input_size).clamp(0.0, 1.0),
      ((cx + w / 2.0) / input_size).clamp(0.0, 1.0),
      ((cy + h / 2.0) / input_size).clamp(0.0, 1.0),
    ];
    if bbox[0] >= bbox[2] || bbox[1] >= bbox[3] {
      continue;
    }

    let Some(label) = labels.name(class_id) else {
      continue;
    };
    items.push(DetectItem {
      label: label.to_string(),
      score,
      bbox,
    });
  }

  if items.len() > YOLO_MAX_CANDIDATES {
    debug!("候选数 {} 超过上限，截断到 {}", items.len(), YOLO_MAX_CANDIDATES);
    items.sort_by(|a, b| b.score.total_cmp(&a.score));
    items.truncate(YOLO_MAX_CANDIDATES);
  }

  debug!("检测到 {} 个候选", items.len());
  Ok(items)
}
