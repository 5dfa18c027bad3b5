// 该文件是 Jingming （睛明） 项目的一部分。
// src/output/save_image_file.rs - 保存热力图文件
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
  io::BufWriter,
  path::{Path, PathBuf},
};

use image::{ImageFormat, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::DEFAULT_JPEG_QUALITY,
  decode_url_path,
  frame::RawImage,
  output::{Render, draw_legend},
  pipeline::PipelineResult,
};

/// 写出热力图字节
///
/// 目标扩展名与字节格式一致且不需要色标时直接写入，否则解码后按 `jpeg_quality` 重新编码。
pub(crate) fn write_heatmap(
  path: &Path,
  bytes: &[u8],
  legend: bool,
  jpeg_quality: u8,
) -> image::ImageResult<()> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)?;
  }

  let detected = image::guess_format(bytes)?;
  let wanted = ImageFormat::from_path(path).ok();
  if !legend && wanted.is_none_or(|format| format == detected) {
    std::fs::write(path, bytes)?;
    return Ok(());
  }

  let mut image = image::load_from_memory_with_format(bytes, detected)?.to_rgb8();
  if legend {
    draw_legend(&mut image);
  }
  match wanted.unwrap_or(detected) {
    ImageFormat::Jpeg => {
      let writer = BufWriter::new(File::create(path)?);
      image.write_with_encoder(JpegEncoder::new_with_quality(writer, jpeg_quality.clamp(1, 100)))
    }
    format => image.save_with_format(path, format),
  }
}

pub struct SaveImageFileOutput {
  path: PathBuf,
  legend: bool,
  jpeg_quality: u8,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
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

    Ok(SaveImageFileOutput {
      path: PathBuf::from(decode_url_path(uri)),
      legend: uri.query_pairs().any(|(k, _)| k == "legend"),
      jpeg_quality: DEFAULT_JPEG_QUALITY,
    })
  }
}

impl SaveImageFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 需要重新编码为 JPEG 时使用的质量
  pub fn with_jpeg_quality(mut self, jpeg_quality: u8) -> Self {
    self.jpeg_quality = jpeg_quality;
    self
  }
}

impl Render<RawImage, PipelineResult> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, _frame: &RawImage, result: &PipelineResult) -> Result<(), Self::Error> {
    if result.heatmap_image_bytes.is_empty() {
      warn!("热力图为空，跳过保存");
      return Ok(());
    }
    write_heatmap(
      &self.path,
      &result.heatmap_image_bytes,
      self.legend,
      self.jpeg_quality,
    )?;
    info!(
      "保存热力图到文件: {} ({}，{:.4})",
      self.path.display(),
      result.severity_label,
      result.confidence
    );
    Ok(())
  }
}
