// 该文件是 Jingming （睛明） 项目的一部分。
// src/input/read_directory.rs - 目录批量输入
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

use std::{collections::VecDeque, path::PathBuf};

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::DEFAULT_MAX_IMAGE_BYTES,
  decode_url_path,
  frame::RawImage,
  input::{UNKNOWN_MIME, mime_for_path, read_image_file::read_raw_image},
};

#[derive(Error, Debug)]
pub enum DirectoryInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("读取目录 {path} 失败: {source}")]
  IoError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// 按文件名顺序逐个读取目录中的 jpg/jpeg/png 文件
///
/// 文件在迭代时才读取；读取失败的文件记录日志后跳过。
pub struct DirectoryInput {
  directory: PathBuf,
  pending: VecDeque<PathBuf>,
  max_bytes: usize,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryInput {
  type Error = DirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryInputError::SchemeMismatch);
    }
    Self::open(PathBuf::from(decode_url_path(url)))
  }
}

impl DirectoryInput {
  pub fn open(directory: PathBuf) -> Result<Self, DirectoryInputError> {
    let io_error = |source| DirectoryInputError::IoError {
      path: directory.clone(),
      source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&directory).map_err(io_error)? {
      let path = entry.map_err(io_error)?.path();
      if path.is_file() && mime_for_path(&path) != UNKNOWN_MIME {
        files.push(path);
      }
    }
    files.sort();
    info!("目录 {} 中共有 {} 张图像", directory.display(), files.len());

    Ok(DirectoryInput {
      directory,
      pending: files.into(),
      max_bytes: DEFAULT_MAX_IMAGE_BYTES,
    })
  }

  pub fn remaining(&self) -> usize {
    self.pending.len()
  }

  /// 单个文件最多读入的字节数
  pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
    self.max_bytes = max_bytes;
    self
  }
}

impl Iterator for DirectoryInput {
  type Item = RawImage;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(path) = self.pending.pop_front() {
      match read_raw_image(&path, self.max_bytes) {
        Ok(image) => return Some(image),
        Err(e) => warn!("跳过 {} 中的文件: {}", self.directory.display(), e),
      }
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lists_supported_files_in_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b.png"), [2u8]).unwrap();
    std::fs::write(dir.path().join("a.JPG"), [1u8]).unwrap();
    std::fs::write(dir.path().join("notes.txt"), [9u8]).unwrap();
    std::fs::create_dir(dir.path().join("sub.png")).unwrap();

    let url = Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let input = DirectoryInput::from_url(&url).unwrap();
    assert_eq!(input.remaining(), 2);
    let images: Vec<_> = input.collect();
    assert_eq!(images[0].bytes(), &[1]);
    assert_eq!(images[0].mime(), "image/jpeg");
    assert_eq!(images[1].mime(), "image/png");
  }

  #[test]
  fn test_vanished_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), [1u8]).unwrap();
    std::fs::write(dir.path().join("b.png"), [2u8]).unwrap();
    let mut input = DirectoryInput::open(dir.path().to_path_buf()).unwrap();
    std::fs::remove_file(dir.path().join("a.png")).unwrap();
    assert_eq!(input.next().map(|raw| raw.bytes().to_vec()), Some(vec![2]));
    assert!(input.next().is_none());
  }
}
