// 该文件是 Jingming （睛明） 项目的一部分。
// src/frame.rs - 原始图像与归一化张量定义
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

use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::{Array3, ArrayView3};

use crate::config::NormalizeStats;

pub const RGB_CHANNELS: usize = 3;

/// 原始图像：字节内容与声明的 MIME 类型
#[derive(Debug, Clone)]
pub struct RawImage {
  data: Box<[u8]>,
  mime: String,
}

impl RawImage {
  pub fn new(data: impl Into<Box<[u8]>>, mime: impl Into<String>) -> Self {
    Self {
      data: data.into(),
      mime: mime.into(),
    }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn mime(&self) -> &str {
    &self.mime
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// 归一化后的 CHW 浮点张量
///
/// 只能由预处理器构造：缩放 → CLAHE → 逐通道归一化。
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
  data: Array3<f32>,
  stats: NormalizeStats,
}

impl NormalizedTensor {
  pub(crate) fn new(data: Array3<f32>, stats: NormalizeStats) -> Self {
    Self { data, stats }
  }

  pub fn view(&self) -> ArrayView3<'_, f32> {
    self.data.view()
  }

  pub fn channels(&self) -> usize {
    self.data.dim().0
  }

  pub fn height(&self) -> usize {
    self.data.dim().1
  }

  pub fn width(&self) -> usize {
    self.data.dim().2
  }

  pub fn stats(&self) -> NormalizeStats {
    self.stats
  }

  /// 反归一化为 RGB 图像，用于叠加热力图
  pub fn denormalize(&self) -> RgbImage {
    let (_, height, width) = self.data.dim();
    let NormalizeStats { mean, std } = self.stats;
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
      let (x, y) = (x as usize, y as usize);
      let mut pixel = [0u8; RGB_CHANNELS];
      for (c, value) in pixel.iter_mut().enumerate() {
        let v = (self.data[[c, y, x]] * std[c] + mean[c]) * 255.0;
        *value = v.round().clamp(0.0, 255.0) as u8;
      }
      Rgb(pixel)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_raw_image_accessors() {
    let raw = RawImage::new(vec![1u8, 2, 3], "image/png");
    assert_eq!(raw.len(), 3);
    assert_eq!(raw.mime(), "image/png");
    assert!(!raw.is_empty());
  }

  #[test]
  fn test_denormalize_inverts_statistics() {
    let stats = NormalizeStats::default();
    let mut data = Array3::<f32>::zeros((3, 2, 2));
    for c in 0..3 {
      let v = (200.0 / 255.0 - stats.mean[c]) / stats.std[c];
      data.index_axis_mut(ndarray::Axis(0), c).fill(v);
    }
    let image = NormalizedTensor::new(data, stats).denormalize();
    assert_eq!(image.dimensions(), (2, 2));
    assert!(image.pixels().all(|p| p.0 == [200, 200, 200]));
  }
}
