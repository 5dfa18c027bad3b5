// 该文件是 Jingming （睛明） 项目的一部分。
// src/preprocess.rs - 图像校验与预处理
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

use std::io::Cursor;

use image::{
  DynamicImage, ImageFormat, ImageReader, Limits, RgbImage,
  imageops::{self, FilterType},
};
use ndarray::Array3;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  config::{NormalizeStats, PreprocessConfig},
  frame::{NormalizedTensor, RGB_CHANNELS, RawImage},
};

mod clahe;
mod lab;

pub use self::clahe::clahe;

pub const SUPPORTED_MIME_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

#[derive(Error, Debug)]
pub enum ValidationError {
  #[error("不支持的图像格式: {0}")]
  UnsupportedFormat(String),
  #[error("图像数据过小: {len} 字节，至少需要 {min} 字节")]
  TooSmall { len: usize, min: usize },
  #[error("图像数据过大: {len} 字节，最多允许 {max} 字节")]
  TooLarge { len: usize, max: usize },
  #[error("图像格式与声明不符: 声明 {declared}, 实际 {detected}")]
  FormatMismatch { declared: String, detected: String },
  #[error("图像解码失败: {0}")]
  Corrupt(String),
  #[error("图像尺寸为零")]
  ZeroSize,
  #[error("图像尺寸过大: {width}x{height}，单边最多 {max}")]
  DimensionsTooLarge { width: u32, height: u32, max: u32 },
  #[error("图像缺少彩色通道: {0}")]
  MissingColor(String),
}

/// 根据文件扩展名推断 MIME 类型
pub fn mime_from_extension(extension: &str) -> Option<&'static str> {
  match extension.to_ascii_lowercase().as_str() {
    "jpg" | "jpeg" => Some("image/jpeg"),
    "png" => Some("image/png"),
    _ => None,
  }
}

fn declared_format(mime: &str) -> Result<ImageFormat, ValidationError> {
  let mime = mime.trim().to_ascii_lowercase();
  if !SUPPORTED_MIME_TYPES.contains(&mime.as_str()) {
    return Err(ValidationError::UnsupportedFormat(mime));
  }
  ImageFormat::from_mime_type(&mime).ok_or(ValidationError::UnsupportedFormat(mime))
}

/// 预处理器：校验 → 缩放 → CLAHE → 归一化
#[derive(Debug, Clone)]
pub struct Preprocessor {
  config: PreprocessConfig,
}

impl Default for Preprocessor {
  fn default() -> Self {
    Self::new(PreprocessConfig::default())
  }
}

impl Preprocessor {
  pub fn new(config: PreprocessConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PreprocessConfig {
    &self.config
  }

  /// 输出张量的 (高, 宽)
  pub fn output_size(&self) -> (usize, usize) {
    (
      self.config.input_height as usize,
      self.config.input_width as usize,
    )
  }

  /// 校验并解码原始图像，任何模型计算之前执行
  pub fn decode(&self, raw: &RawImage) -> Result<RgbImage, ValidationError> {
    let declared = declared_format(raw.mime())?;

    let len = raw.len();
    if len < self.config.min_image_bytes {
      return Err(ValidationError::TooSmall {
        len,
        min: self.config.min_image_bytes,
      });
    }
    if len > self.config.max_image_bytes {
      return Err(ValidationError::TooLarge {
        len,
        max: self.config.max_image_bytes,
      });
    }

    let probe = reader(raw.bytes())?;
    match probe.format() {
      Some(detected) if detected == declared => {}
      Some(detected) => {
        return Err(ValidationError::FormatMismatch {
          declared: raw.mime().to_string(),
          detected: detected.to_mime_type().to_string(),
        });
      }
      None => return Err(ValidationError::Corrupt("无法识别的图像数据".to_string())),
    }

    let (width, height) = probe
      .into_dimensions()
      .map_err(|e| ValidationError::Corrupt(e.to_string()))?;
    if width == 0 || height == 0 {
      return Err(ValidationError::ZeroSize);
    }
    let max = self.config.max_image_dimension;
    if width > max || height > max {
      return Err(ValidationError::DimensionsTooLarge { width, height, max });
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(max);
    limits.max_image_height = Some(max);
    let mut decoder = reader(raw.bytes())?;
    decoder.limits(limits);
    let image = decoder
      .decode()
      .map_err(|e| ValidationError::Corrupt(e.to_string()))?;
    debug!("解码图像: {}x{} {:?}", width, height, image.color());

    to_color_image(image)
  }

  /// 完整预处理流程
  pub fn preprocess(&self, raw: &RawImage) -> Result<NormalizedTensor, ValidationError> {
    let image = self.decode(raw)?;
    let resized = self.resize(&image);
    let enhanced = self.enhance(&resized);
    Ok(self.normalize(&enhanced))
  }

  /// 拉伸缩放到固定输入尺寸（不保持长宽比）
  pub fn resize(&self, image: &RgbImage) -> RgbImage {
    let (width, height) = (self.config.input_width, self.config.input_height);
    if image.dimensions() == (width, height) {
      return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
  }

  /// 在 L 通道上做 CLAHE，再与 a/b 通道合成
  pub fn enhance(&self, image: &RgbImage) -> RgbImage {
    let mut lab = lab::rgb_to_lab(image);
    lab.lightness = clahe(
      &lab.lightness,
      self.config.clahe_clip_limit,
      self.config.clahe_tile_grid,
    );
    lab::lab_to_rgb(&lab)
  }

  fn normalize(&self, image: &RgbImage) -> NormalizedTensor {
    let (width, height) = image.dimensions();
    let NormalizeStats { mean, std } = self.config.normalize;
    let data = Array3::from_shape_fn(
      (RGB_CHANNELS, height as usize, width as usize),
      |(c, y, x)| {
        let v = image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
        (v - mean[c]) / std[c]
      },
    );
    NormalizedTensor::new(data, self.config.normalize)
  }
}

fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, ValidationError> {
  ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(|e| ValidationError::Corrupt(e.to_string()))
}

fn to_color_image(image: DynamicImage) -> Result<RgbImage, ValidationError> {
  let color = image.color();
  if !color.has_color() {
    warn!("拒绝灰度图像: {:?}", color);
    return Err(ValidationError::MissingColor(format!("{:?}", color)));
  }
  if color.has_alpha() {
    debug!("丢弃 alpha 通道: {:?}", color);
  }
  Ok(image.to_rgb8())
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use image::{GrayImage, ImageBuffer, Luma, Rgb};

  pub(crate) fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
  }

  fn gradient(width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
      Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 96])
    })
  }

  #[test]
  fn test_preprocess_shape_and_stats() {
    let pre = Preprocessor::default();
    let raw = RawImage::new(encode(&gradient(320, 240), ImageFormat::Png), "image/png");
    let tensor = pre.preprocess(&raw).unwrap();
    assert_eq!((tensor.channels(), tensor.height(), tensor.width()), (3, 224, 224));
    assert!(tensor.view().iter().all(|v| v.is_finite()));
    // 归一化后的值域由均值/方差决定
    assert!(tensor.view().iter().all(|v| (-2.2..=2.7).contains(v)));
  }

  #[test]
  fn test_unsupported_mime_rejected() {
    let pre = Preprocessor::default();
    let raw = RawImage::new(encode(&gradient(32, 32), ImageFormat::Png), "image/gif");
    assert!(matches!(
      pre.preprocess(&raw),
      Err(ValidationError::UnsupportedFormat(_))
    ));
  }

  #[test]
  fn test_too_small_rejected() {
    let pre = Preprocessor::default();
    let raw = RawImage::new(vec![0x89u8, b'P', b'N', b'G'], "image/png");
    assert!(matches!(
      pre.preprocess(&raw),
      Err(ValidationError::TooSmall { len: 4, .. })
    ));
  }

  #[test]
  fn test_too_large_rejected() {
    let pre = Preprocessor::new(PreprocessConfig {
      max_image_bytes: 128,
      ..PreprocessConfig::default()
    });
    let bytes = encode(&gradient(64, 64), ImageFormat::Png);
    let len = bytes.len();
    assert!(len > 128);
    assert!(matches!(
      pre.preprocess(&RawImage::new(bytes, "image/png")),
      Err(ValidationError::TooLarge { max: 128, len: l }) if l == len
    ));
  }

  #[test]
  fn test_format_mismatch_rejected() {
    let pre = Preprocessor::default();
    let raw = RawImage::new(encode(&gradient(32, 32), ImageFormat::Png), "image/jpeg");
    assert!(matches!(
      pre.preprocess(&raw),
      Err(ValidationError::FormatMismatch { .. })
    ));
  }

  #[test]
  fn test_corrupt_payload_rejected() {
    let pre = Preprocessor::default();
    let mut bytes = encode(&gradient(64, 64), ImageFormat::Png);
    bytes.truncate(bytes.len() / 2);
    let raw = RawImage::new(bytes, "image/png");
    assert!(matches!(
      pre.preprocess(&raw),
      Err(ValidationError::Corrupt(_))
    ));
  }

  #[test]
  fn test_grayscale_rejected() {
    let pre = Preprocessor::default();
    let gray: GrayImage = ImageBuffer::from_fn(64, 64, |x, y| Luma([(x * 3 + y) as u8]));
    let mut buf = Cursor::new(Vec::new());
    gray.write_to(&mut buf, ImageFormat::Png).unwrap();
    let raw = RawImage::new(buf.into_inner(), "image/png");
    assert!(matches!(
      pre.preprocess(&raw),
      Err(ValidationError::MissingColor(_))
    ));
  }

  #[test]
  fn test_oversized_dimensions_rejected() {
    let config = PreprocessConfig {
      max_image_dimension: 100,
      ..PreprocessConfig::default()
    };
    let pre = Preprocessor::new(config);
    let raw = RawImage::new(encode(&gradient(101, 20), ImageFormat::Png), "image/png");
    assert!(matches!(
      pre.preprocess(&raw),
      Err(ValidationError::DimensionsTooLarge { width: 101, .. })
    ));
  }

  #[test]
  fn test_mime_from_extension() {
    assert_eq!(mime_from_extension("JPG"), Some("image/jpeg"));
    assert_eq!(mime_from_extension("png"), Some("image/png"));
    assert_eq!(mime_from_extension("bmp"), None);
  }

  #[test]
  fn test_enhance_keeps_neutral_gray_neutral() {
    let pre = Preprocessor::default();
    let image = RgbImage::from_pixel(224, 224, Rgb([128, 128, 128]));
    let enhanced = pre.enhance(&image);
    let first = *enhanced.get_pixel(0, 0);
    assert!(enhanced.pixels().all(|p| *p == first));
    assert!((first[0] as i32 - first[2] as i32).abs() <= 1);
  }
}
