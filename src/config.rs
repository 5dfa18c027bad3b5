// 该文件是 Jingming （睛明） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::{path::Path, time::Duration};

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_INPUT_SIZE: u32 = 224;
pub const DEFAULT_CLAHE_CLIP_LIMIT: f32 = 2.0;
pub const DEFAULT_CLAHE_TILE_GRID: [u32; 2] = [8, 8];
pub const DEFAULT_NORMALIZE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const DEFAULT_NORMALIZE_STD: [f32; 3] = [0.229, 0.224, 0.225];
pub const DEFAULT_MIN_IMAGE_BYTES: usize = 64;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 8192;
pub const DEFAULT_BLEND_ALPHA: f32 = 0.4;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("配置文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 逐通道归一化统计量（与训练时一致）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizeStats {
  pub mean: [f32; 3],
  pub std: [f32; 3],
}

impl Default for NormalizeStats {
  fn default() -> Self {
    Self {
      mean: DEFAULT_NORMALIZE_MEAN,
      std: DEFAULT_NORMALIZE_STD,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatmapFormat {
  Jpeg,
  Png,
}

impl HeatmapFormat {
  pub fn image_format(&self) -> ImageFormat {
    match self {
      HeatmapFormat::Jpeg => ImageFormat::Jpeg,
      HeatmapFormat::Png => ImageFormat::Png,
    }
  }

  pub fn mime_type(&self) -> &'static str {
    match self {
      HeatmapFormat::Jpeg => "image/jpeg",
      HeatmapFormat::Png => "image/png",
    }
  }

  pub fn extension(&self) -> &'static str {
    match self {
      HeatmapFormat::Jpeg => "jpg",
      HeatmapFormat::Png => "png",
    }
  }
}

/// 预处理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
  pub input_width: u32,
  pub input_height: u32,
  pub clahe_clip_limit: f32,
  /// [列, 行]
  pub clahe_tile_grid: [u32; 2],
  pub normalize: NormalizeStats,
  pub min_image_bytes: usize,
  pub max_image_bytes: usize,
  pub max_image_dimension: u32,
}

impl Default for PreprocessConfig {
  fn default() -> Self {
    Self {
      input_width: DEFAULT_INPUT_SIZE,
      input_height: DEFAULT_INPUT_SIZE,
      clahe_clip_limit: DEFAULT_CLAHE_CLIP_LIMIT,
      clahe_tile_grid: DEFAULT_CLAHE_TILE_GRID,
      normalize: NormalizeStats::default(),
      min_image_bytes: DEFAULT_MIN_IMAGE_BYTES,
      max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
      max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
    }
  }
}

/// 热力图渲染配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
  pub blend_alpha: f32,
  pub format: HeatmapFormat,
  pub jpeg_quality: u8,
}

impl Default for RenderConfig {
  fn default() -> Self {
    Self {
      blend_alpha: DEFAULT_BLEND_ALPHA,
      format: HeatmapFormat::Jpeg,
      jpeg_quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub preprocess: PreprocessConfig,
  pub render: RenderConfig,
  /// 单次推理的时间上限，0 表示不限制
  pub timeout_ms: u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      preprocess: PreprocessConfig::default(),
      render: RenderConfig::default(),
      timeout_ms: DEFAULT_TIMEOUT_MS,
    }
  }
}

impl PipelineConfig {
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("加载配置文件: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    Self::from_json_str(&content)
  }

  pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
    let config: PipelineConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn timeout(&self) -> Option<Duration> {
    (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let p = &self.preprocess;
    if p.input_width == 0 || p.input_height == 0 {
      return Err(ConfigError::Invalid("输入尺寸必须为正".to_string()));
    }
    if !(p.clahe_clip_limit.is_finite() && p.clahe_clip_limit > 0.0) {
      return Err(ConfigError::Invalid(format!(
        "CLAHE 裁剪阈值无效: {}",
        p.clahe_clip_limit
      )));
    }
    if p.clahe_tile_grid.contains(&0) {
      return Err(ConfigError::Invalid("CLAHE 网格尺寸必须为正".to_string()));
    }
    if p.clahe_tile_grid[0] > p.input_width || p.clahe_tile_grid[1] > p.input_height {
      return Err(ConfigError::Invalid(format!(
        "CLAHE 网格 {:?} 大于输入尺寸 {}x{}",
        p.clahe_tile_grid, p.input_width, p.input_height
      )));
    }
    if p.normalize.std.iter().any(|s| !(s.is_finite() && *s > 0.0))
      || p.normalize.mean.iter().any(|m| !m.is_finite())
    {
      return Err(ConfigError::Invalid(format!(
        "归一化统计量无效: {:?}",
        p.normalize
      )));
    }
    if p.min_image_bytes > p.max_image_bytes {
      return Err(ConfigError::Invalid(format!(
        "最小字节数 {} 大于最大字节数 {}",
        p.min_image_bytes, p.max_image_bytes
      )));
    }
    if p.max_image_dimension == 0 {
      return Err(ConfigError::Invalid("最大图像边长必须为正".to_string()));
    }

    let r = &self.render;
    if !(0.0..=1.0).contains(&r.blend_alpha) {
      return Err(ConfigError::Invalid(format!(
        "混合系数必须位于 [0, 1]: {}",
        r.blend_alpha
      )));
    }
    if !(1..=100).contains(&r.jpeg_quality) {
      return Err(ConfigError::Invalid(format!(
        "JPEG 质量必须位于 [1, 100]: {}",
        r.jpeg_quality
      )));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    let config = PipelineConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.preprocess.input_width, 224);
    assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
  }

  #[test]
  fn test_partial_json_keeps_defaults() {
    let config =
      PipelineConfig::from_json_str(r#"{"render": {"format": "png"}, "timeout_ms": 0}"#).unwrap();
    assert_eq!(config.render.format, HeatmapFormat::Png);
    assert_eq!(config.render.blend_alpha, DEFAULT_BLEND_ALPHA);
    assert_eq!(config.preprocess, PreprocessConfig::default());
    assert_eq!(config.timeout(), None);
  }

  #[test]
  fn test_invalid_blend_alpha_rejected() {
    let err = PipelineConfig::from_json_str(r#"{"render": {"blend_alpha": 1.5}}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
  }

  #[test]
  fn test_zero_std_rejected() {
    let mut config = PipelineConfig::default();
    config.preprocess.normalize.std = [0.2, 0.0, 0.2];
    assert!(config.validate().is_err());
  }
}
