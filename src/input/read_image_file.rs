// 该文件是 Jingming （睛明） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::{
  fs::File,
  io::Read,
  path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, config::DEFAULT_MAX_IMAGE_BYTES, decode_url_path, frame::RawImage,
  input::mime_for_path,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("读取图像文件 {path} 失败: {source}")]
  IoError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// 读取单个图像文件，只产生一帧
///
/// 只读取原始字节，格式校验由预处理阶段完成。
pub struct ImageFileInput {
  path: PathBuf,
  max_bytes: usize,
  pending: bool,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    Self::open(decode_url_path(url))
  }
}

impl ImageFileInput {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref().to_path_buf();
    std::fs::metadata(&path).map_err(|source| ImageFileInputError::IoError {
      path: path.clone(),
      source,
    })?;
    Ok(ImageFileInput {
      path,
      max_bytes: DEFAULT_MAX_IMAGE_BYTES,
      pending: true,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 单个文件最多读入的字节数，超出部分不会载入内存
  pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
    self.max_bytes = max_bytes;
    self
  }
}

/// 读取图像文件，最多读入 `max_bytes + 1` 字节
///
/// 超限的文件只保留前 `max_bytes + 1` 字节，由预处理阶段以超限拒绝。
pub(crate) fn read_raw_image(path: &Path, max_bytes: usize) -> Result<RawImage, ImageFileInputError> {
  let io_error = |source| ImageFileInputError::IoError {
    path: path.to_path_buf(),
    source,
  };
  let file = File::open(path).map_err(io_error)?;
  let len = file.metadata().map_err(io_error)?.len();
  let limit = (max_bytes as u64).saturating_add(1);
  if len > max_bytes as u64 {
    warn!(
      "图像文件 {} 共 {} 字节，超过上限 {}，只读取前 {} 字节",
      path.display(),
      len,
      max_bytes,
      limit
    );
  }

  let mut data = Vec::with_capacity(len.min(limit) as usize);
  file.take(limit).read_to_end(&mut data).map_err(io_error)?;
  let mime = mime_for_path(path);
  debug!("读取图像文件 {}: {} 字节, {}", path.display(), data.len(), mime);
  Ok(RawImage::new(data, mime))
}

impl Iterator for ImageFileInput {
  type Item = RawImage;

  fn next(&mut self) -> Option<Self::Item> {
    if !std::mem::take(&mut self.pending) {
      return None;
    }
    match read_raw_image(&self.path, self.max_bytes) {
      Ok(image) => Some(image),
      Err(e) => {
        error!("{}", e);
        None
      }
    }
  }
}
