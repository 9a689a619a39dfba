// 该文件是 Yingyang （营养） 项目的一部分。
// src/input/read_directory.rs - 目录批量图像输入
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
use tracing::{info, warn};
use url::Url;

use super::Submission;
use crate::{FromUrl, FromUrlWithScheme, decoded_path};

const READ_DIRECTORY_SCHEME: &str = "folder";
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

#[derive(Error, Debug)]
pub enum DirectoryInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// `folder:///path/to/photos`，按文件名顺序逐个产生提交
pub struct DirectoryInput {
  files: std::vec::IntoIter<PathBuf>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = READ_DIRECTORY_SCHEME;
}

impl FromUrl for DirectoryInput {
  type Error = DirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_DIRECTORY_SCHEME {
      return Err(DirectoryInputError::SchemaMismatch);
    }
    Self::open(&decoded_path(url))
  }
}

fn is_image(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

impl DirectoryInput {
  pub fn open(dir: &Path) -> Result<Self, DirectoryInputError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
      let path = entry?.path();
      if path.is_file() && is_image(&path) {
        files.push(path);
      }
    }
    files.sort();
    info!("目录 {} 中共有 {} 张图像", dir.display(), files.len());
    Ok(Self {
      files: files.into_iter(),
    })
  }
}

impl Iterator for DirectoryInput {
  type Item = Submission;

  fn next(&mut self) -> Option<Self::Item> {
    for path in self.files.by_ref() {
      match std::fs::read(&path) {
        Ok(bytes) => {
          return Some(Submission {
            name: path
              .file_name()
              .map(|n| n.to_string_lossy().into_owned())
              .unwrap_or_default(),
            bytes: bytes.into(),
          });
        }
        Err(e) => warn!("跳过无法读取的文件 {}: {}", path.display(), e),
      }
    }
    None
  }
}
