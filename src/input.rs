// 该文件是 Jingming （睛明） 项目的一部分。
// src/input.rs - 图像输入
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

use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme, frame::RawImage, preprocess::mime_from_extension};

mod read_directory;
mod read_image_file;

pub use self::read_directory::{DirectoryInput, DirectoryInputError};
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

/// 扩展名无法识别时使用的 MIME 类型，由预处理阶段拒绝
pub const UNKNOWN_MIME: &str = "application/octet-stream";

/// 根据文件扩展名推断声明的 MIME 类型
pub fn mime_for_path(path: &Path) -> &'static str {
  path
    .extension()
    .and_then(|e| e.to_str())
    .and_then(mime_from_extension)
    .unwrap_or(UNKNOWN_MIME)
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("目录输入错误: {0}")]
  DirectoryInputError(#[from] DirectoryInputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  ReadDirectory(DirectoryInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ImageFileInput::SCHEME => Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?)),
      DirectoryInput::SCHEME => Ok(InputWrapper::ReadDirectory(DirectoryInput::from_url(url)?)),
      other => Err(InputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl InputWrapper {
  /// 单个文件最多读入的字节数，通常取预处理的字节上限
  pub fn with_max_bytes(self, max_bytes: usize) -> Self {
    match self {
      InputWrapper::ReadImageFile(input) => InputWrapper::ReadImageFile(input.with_max_bytes(max_bytes)),
      InputWrapper::ReadDirectory(input) => InputWrapper::ReadDirectory(input.with_max_bytes(max_bytes)),
    }
  }
}

impl Iterator for InputWrapper {
  type Item = RawImage;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::ReadImageFile(input) => input.next(),
      InputWrapper::ReadDirectory(input) => input.next(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mime_for_path() {
    assert_eq!(mime_for_path(Path::new("/a/b/eye.JPEG")), "image/jpeg");
    assert_eq!(mime_for_path(Path::new("eye.png")), "image/png");
    assert_eq!(mime_for_path(Path::new("eye.tiff")), UNKNOWN_MIME);
    assert_eq!(mime_for_path(Path::new("eye")), UNKNOWN_MIME);
  }

  #[test]
  fn test_unknown_scheme_rejected() {
    let url = url::Url::parse("rtsp://camera/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(_))
    ));
  }
}
