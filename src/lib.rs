// 该文件是 Yingyang （营养） 项目的一部分。
// src/lib.rs - 库主文件
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

//! 食物照片 → 检测 → 营养库对齐 → 摄入记录。
//!
//! 流水线各阶段通过构造时注入的只读句柄（模型、营养库）协作，
//! 不依赖任何全局单例。

pub mod catalog;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod input;
pub mod intake;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod reconcile;
pub mod task;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// URL 路径经过百分号编码，这里还原成文件系统路径
pub(crate) fn decoded_path(url: &url::Url) -> std::path::PathBuf {
  let raw = url.path();
  match urlencoding::decode(raw) {
    Ok(path) => std::path::PathBuf::from(path.into_owned()),
    Err(_) => std::path::PathBuf::from(raw),
  }
}

/// 读取 URL 查询参数中的某一项
pub(crate) fn query_value(url: &url::Url, key: &str) -> Option<String> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, v)| v.into_owned())
}
