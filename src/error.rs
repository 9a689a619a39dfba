// 该文件是 Yingyang （营养） 项目的一部分。
// src/error.rs - 启动期错误
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

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
#[cfg(feature = "model_yolo_onnx")]
use crate::model::YoloError;

/// 致命错误：出现时服务不应开始接收请求
#[derive(Error, Debug)]
pub enum StartupError {
  #[error("模型不可用: {0}")]
  ModelUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("营养库不可用: {0}")]
  CatalogUnavailable(#[from] CatalogError),
  #[error("配置无效: {0}")]
  InvalidConfig(#[from] ConfigError),
}

#[cfg(feature = "model_yolo_onnx")]
impl From<YoloError> for StartupError {
  fn from(err: YoloError) -> Self {
    StartupError::ModelUnavailable(Box::new(err))
  }
}
