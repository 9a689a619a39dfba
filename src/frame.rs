// 该文件是 Yingyang （营养） 项目的一部分。
// src/frame.rs - 图像帧与 NCHW 张量
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

use image::RgbImage;
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

/// 解码后像素上限（1 亿像素），防止解压炸弹
const MAX_PIXELS: u64 = 100_000_000;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("图像数据为空")]
  Empty,
  #[error("图像解码错误: {0}")]
  Decode(#[from] image::ImageError),
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
}

/// 解码后的 RGB 图像
#[derive(Debug, Clone)]
pub struct Frame {
  image: RgbImage,
}

impl Frame {
  /// 从任意常见栅格格式的字节解码
  pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
    if bytes.is_empty() {
      return Err(FrameError::Empty);
    }
    let image = image::load_from_memory(bytes)?.to_rgb8();
    Self::from_rgb(image)
  }

  pub fn from_rgb(image: RgbImage) -> Result<Self, FrameError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || u64::from(width) * u64::from(height) > MAX_PIXELS {
      return Err(FrameError::InvalidDimensions { width, height });
    }
    Ok(Self { image })
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_image(self) -> RgbImage {
    self.image
  }

  /// 缩放到模型输入尺寸并转为 NCHW，像素归一化到 [0, 1]
  pub fn to_nchw(&self, width: u32, height: u32) -> RgbNchwFrame {
    let resized = if self.image.dimensions() == (width, height) {
      self.image.clone()
    } else {
      image::imageops::resize(
        &self.image,
        width,
        height,
        image::imageops::FilterType::Triangle,
      )
    };

    let plane = (width as usize) * (height as usize);
    let mut data = vec![0f32; plane * RGB_CHANNELS];
    for (x, y, pixel) in resized.enumerate_pixels() {
      let idx = (y as usize) * (width as usize) + (x as usize);
      for c in 0..RGB_CHANNELS {
        data[c * plane + idx] = f32::from(pixel[c]) / 255.0;
      }
    }

    RgbNchwFrame {
      width,
      height,
      data: data.into_boxed_slice(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RgbNchwFrame {
  width: u32,
  height: u32,
  data: Box<[f32]>,
}

impl RgbNchwFrame {
  pub fn height(&self) -> usize {
    self.height as usize
  }

  pub fn width(&self) -> usize {
    self.width as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }

  pub fn into_vec(self) -> Vec<f32> {
    self.data.into_vec()
  }
}
