// 该文件是 Yingyang （营养） 项目的一部分。
// src/output/directory_record.rs - 按日期归档的记录输出
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
use std::sync::{Arc, Mutex};

use chrono::Datelike;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  frame::{Frame, FrameError},
  input::Submission,
  intake::IntakeRecord,
  output::{
    Render,
    draw::{Draw, DrawError},
  },
  query_value,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("无法解码提交的图像: {0}")]
  FrameError(#[from] FrameError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("帧计数器锁已损坏")]
  Poisoned,
}

pub enum DrawWrapper {
  /// 标注图像 + JSON 记录
  Draw(Box<Draw>),
  /// 仅 JSON 记录
  Record,
}

impl DrawWrapper {
  pub fn save_result(
    &self,
    path: &Path,
    frame: &Submission,
    result: &IntakeRecord,
  ) -> Result<(), DirectoryRecordOutputError> {
    if let DrawWrapper::Draw(draw) = self {
      let mut image = Frame::decode(&frame.bytes)?.into_image();
      draw.draw_record(&mut image, result);
      image.save(path.with_extension("png"))?;
    }
    std::fs::write(path.with_extension("json"), serde_json::to_vec_pretty(result)?)?;
    Ok(())
  }
}

/// `folder:///records?record&always&font=/path/font.ttf`
///
/// 记录按提交日期归档到 `YYYY/MM/DD` 子目录；默认跳过没有检测项的提交，
/// 带 `always` 时全部保存。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: DrawWrapper,
  frame_counters: Arc<Mutex<u16>>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let record_only = uri.query_pairs().any(|(k, _)| k == "record");
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    let draw = if record_only {
      DrawWrapper::Record
    } else {
      let mut draw = Draw::default();
      if let Some(font) = query_value(uri, "font") {
        draw = draw.with_font_file(Path::new(&font))?;
      }
      DrawWrapper::Draw(Box::new(draw))
    };

    Ok(DirectoryRecordOutput {
      directory: decoded_path(uri),
      draw,
      frame_counters: Arc::new(Mutex::new(0)),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_id(&self) -> Result<u16, DirectoryRecordOutputError> {
    let mut counter = self
      .frame_counters
      .lock()
      .map_err(|_| DirectoryRecordOutputError::Poisoned)?;
    let id = counter.wrapping_add(1);
    *counter = id;
    Ok(id)
  }

  fn frame_path(&self, record: &IntakeRecord) -> Result<PathBuf, DirectoryRecordOutputError> {
    let time = record.timestamp;
    let directory = self
      .directory
      .join(time.year().to_string())
      .join(format!("{:02}", time.month()))
      .join(format!("{:02}", time.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}",
      time.format("%H-%M-%S"),
      self.frame_id()?
    )))
  }
}

impl Render<Submission, IntakeRecord> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &Submission, result: &IntakeRecord) -> Result<(), Self::Error> {
    if !self.always && result.items.is_empty() {
      debug!("{} 没有检测项，跳过保存", frame.name);
      return Ok(());
    }
    let path = self.frame_path(result)?;
    self.draw.save_result(&path, frame, result)?;
    debug!("保存记录 {} → {}", frame.name, path.display());
    Ok(())
  }
}
