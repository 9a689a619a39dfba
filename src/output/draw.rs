// 该文件是 Yingyang （营养） 项目的一部分。
// src/output/draw.rs - 摄入记录可视化
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

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::debug;

use crate::intake::IntakeRecord;
use crate::reconcile::ReconciledItem;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const ACCEPTED_COLOR: [u8; 3] = [0, 176, 80]; // 绿色
const REJECTED_COLOR: [u8; 3] = [220, 20, 60]; // 红色

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件: {0}")]
  FontIo(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(String),
}

/// 在原图上标出每个检测项
///
/// 被接受的项用绿色，未识别的项用红色；提供字体时附带名称与置信度。
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  accepted_color: [u8; 3],
  rejected_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      accepted_color: ACCEPTED_COLOR,
      rejected_color: REJECTED_COLOR,
    }
  }
}

impl Draw {
  pub fn with_font_file(mut self, path: &Path) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data).map_err(|e| DrawError::InvalidFont(e.to_string()))?;
    self.font = Some(font);
    Ok(self)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  fn caption(item: &ReconciledItem) -> String {
    match item.accepted_profile() {
      Some(profile) => format!(
        "{} {:.2} x{}",
        profile.display_name,
        item.detection.confidence(),
        item.quantity
      ),
      None => format!("{}? {:.2}", item.detection.label(), item.detection.confidence()),
    }
  }

  fn draw_item(&self, image: &mut RgbImage, item: &ReconciledItem) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let bbox = item.detection.bbox();

    let x_min = (bbox.x_min.floor() as i32).clamp(0, w - 1);
    let y_min = (bbox.y_min.floor() as i32).clamp(0, h - 1);
    let x_max = (bbox.x_max.ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox.y_max.ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = if item.accepted {
      self.accepted_color
    } else {
      self.rejected_color
    };

    // 绘制边框（加粗为2像素）
    for thickness in 0..2 {
      let width = (x_max - x_min - 2 * thickness + 1).max(0) as u32;
      let height = (y_max - y_min - 2 * thickness + 1).max(0) as u32;
      if width == 0 || height == 0 {
        break;
      }
      let rect = Rect::at(x_min + thickness, y_min + thickness).of_size(width, height);
      draw_hollow_rect_mut(image, rect, Rgb(color));
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = Self::caption(item);
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;
    let label_height = self.label_text_height as u32;

    if label_width > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width, label_height);
      draw_filled_rect_mut(image, rect, Rgb(color));
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x,
        label_y + self.label_text_vertical_padding,
        PxScale::from(self.font_size),
        font,
        &label,
      );
    }
  }

  pub fn draw_record(&self, image: &mut RgbImage, record: &IntakeRecord) {
    for item in &record.items {
      self.draw_item(image, item);
    }
    debug!("绘制 {} 个检测项", record.items.len());
  }
}
