// 该文件是 Yingyang （营养） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像
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

use thiserror::Error;
use tracing::warn;
use url::Url;

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
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("无法解码提交的图像: {0}")]
  FrameError(#[from] FrameError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `image:///path/out.png?font=/path/font.ttf`
pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let mut draw = Draw::default();
    if let Some(font) = query_value(uri, "font") {
      draw = draw.with_font_file(Path::new(&font))?;
    }

    Ok(SaveImageFileOutput {
      path: decoded_path(uri),
      draw,
    })
  }
}

impl SaveImageFileOutput {
  fn save_image(&self, image: image::RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;

    warn!("保存图像到文件: {}", self.path.display());

    Ok(())
  }
}

impl Render<Submission, IntakeRecord> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &Submission, result: &IntakeRecord) -> Result<(), Self::Error> {
    let mut image = Frame::decode(&frame.bytes)?.into_image();
    self.draw.draw_record(&mut image, result);
    self.save_image(image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::tests::png_bytes;
  use crate::intake::tests::{items, noon};
  use crate::intake::{Aggregator, QuantityHints};

  #[test]
  fn saves_annotated_png() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested/out.png");
    let url = Url::parse(&format!("image://{}", target.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();

    let submission = Submission {
      name: "meal.png".to_string(),
      bytes: png_bytes(16, 16).into(),
    };
    let record = Aggregator::default()
      .build_record("u1", noon(1), items(&["apple"]), &QuantityHints::new())
      .unwrap();
    output.render_result(&submission, &record).unwrap();

    let saved = image::open(&target).unwrap();
    assert_eq!((saved.width(), saved.height()), (16, 16));
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("folder:///tmp/out").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
