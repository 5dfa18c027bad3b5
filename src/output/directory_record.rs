// 该文件是 Jingming （睛明） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{DateTime, Datelike, Utc};
use image::ImageFormat;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  config::DEFAULT_JPEG_QUALITY,
  decode_url_path,
  frame::RawImage,
  output::{Render, save_image_file::write_heatmap},
  pipeline::PipelineResult,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("记录序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 与热力图同名的 JSON 记录
#[derive(Debug, Serialize)]
struct HeatmapRecord<'a> {
  timestamp: String,
  heatmap: String,
  source_mime: &'a str,
  source_bytes: usize,
  #[serde(flatten)]
  result: &'a PipelineResult,
}

/// 按日期分目录保存热力图与预测记录：`YYYY/MM/DD/HH-MM-SS-XXXX.jpg`
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  legend: bool,
  jpeg_quality: u8,
  frame_counter: AtomicU16,
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

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(decode_url_path(uri)),
      legend: uri.query_pairs().any(|(k, _)| k == "legend"),
      jpeg_quality: DEFAULT_JPEG_QUALITY,
      frame_counter: AtomicU16::new(0),
    })
  }
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn with_jpeg_quality(mut self, jpeg_quality: u8) -> Self {
    self.jpeg_quality = jpeg_quality;
    self
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self, now: &DateTime<Utc>, extension: &str) -> Result<PathBuf, std::io::Error> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.{}",
      now.format("%H-%M-%S"),
      self.frame_id(),
      extension
    )))
  }
}

impl Render<RawImage, PipelineResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RawImage, result: &PipelineResult) -> Result<(), Self::Error> {
    let now = Utc::now();
    let extension = match image::guess_format(&result.heatmap_image_bytes)? {
      ImageFormat::Png => "png",
      _ => "jpg",
    };
    let path = self.frame_path(&now, extension)?;
    write_heatmap(
      &path,
      &result.heatmap_image_bytes,
      self.legend,
      self.jpeg_quality,
    )?;

    let record = HeatmapRecord {
      timestamp: now.to_rfc3339(),
      heatmap: path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default(),
      source_mime: frame.mime(),
      source_bytes: frame.len(),
      result,
    };
    let record_path = path.with_extension("json");
    serde_json::to_writer_pretty(BufWriter::new(File::create(&record_path)?), &record)?;
    debug!("写入预测记录: {}", record_path.display());
    info!("保存热力图到目录: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::preprocess::tests::encode;
  use image::{Rgb, RgbImage};

  fn result() -> PipelineResult {
    let image = RgbImage::from_pixel(16, 16, Rgb([200, 10, 10]));
    PipelineResult {
      severity_class_index: 4,
      severity_label: "Proliferative DR",
      confidence: 0.8,
      probabilities: [0.05, 0.05, 0.05, 0.05, 0.8],
      explained_class: 4,
      heatmap_mime: "image/jpeg",
      heatmap_image_bytes: encode(&image, ImageFormat::Jpeg),
    }
  }

  fn find_files(dir: &Path, extension: &str, found: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).unwrap() {
      let path = entry.unwrap().path();
      if path.is_dir() {
        find_files(&path, extension, found);
      } else if path.extension().is_some_and(|e| e == extension) {
        found.push(path);
      }
    }
  }

  #[test]
  fn test_writes_heatmap_and_record_in_dated_directory() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let raw = RawImage::new(vec![1u8; 128], "image/jpeg");
    output.render_result(&raw, &result()).unwrap();
    output.render_result(&raw, &result()).unwrap();

    let mut images = Vec::new();
    find_files(dir.path(), "jpg", &mut images);
    let mut records = Vec::new();
    find_files(dir.path(), "json", &mut records);
    assert_eq!(images.len(), 2);
    assert_eq!(records.len(), 2);

    // YYYY/MM/DD
    let relative = images[0].strip_prefix(dir.path()).unwrap();
    assert_eq!(relative.components().count(), 4);

    let record: serde_json::Value =
      serde_json::from_reader(File::open(&records[0]).unwrap()).unwrap();
    assert_eq!(record["severity_class_index"], 4);
    assert_eq!(record["severity_label"], "Proliferative DR");
    assert_eq!(record["source_bytes"], 128);
    assert!(record.get("heatmap_image_bytes").is_none());
  }

  #[test]
  fn test_frame_ids_increase() {
    let url = url::Url::parse("folder:///tmp/jingming").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.frame_id(), 1);
    assert_eq!(output.frame_id(), 2);
  }
}
