// 该文件是 Jingming （睛明） 项目的一部分。
// src/output/overlay.rs - 热力图着色与叠加
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

use image::{
  ImageBuffer, Rgb, RgbImage,
  codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
  rect::Rect,
};
use tracing::debug;

use crate::{
  config::{HeatmapFormat, RenderConfig},
  explain::AttentionMap,
  model::ComputeError,
};

/// JET 色阶：蓝 → 青 → 黄 → 红
pub fn jet(value: f32) -> Rgb<u8> {
  let v = value.clamp(0.0, 1.0);
  let channel = |center: f32| -> u8 {
    let c = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
    (c * 255.0).round() as u8
  };
  Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// 在图像右侧绘制竖直色标，上端为 1，下端为 0
pub fn draw_legend(image: &mut RgbImage) {
  let (width, height) = image.dimensions();
  let bar_width = (width / 28).max(4);
  let bar_height = (height * 4 / 5).max(2);
  let margin = (width / 56).max(2);
  if width <= bar_width + 2 * margin || height <= bar_height {
    return;
  }

  let left = (width - bar_width - margin) as i32;
  let top = ((height - bar_height) / 2) as i32;
  for row in 0..bar_height {
    let value = 1.0 - row as f32 / (bar_height - 1) as f32;
    let rect = Rect::at(left, top + row as i32).of_size(bar_width, 1);
    draw_filled_rect_mut(image, rect, jet(value));
  }
  let border = Rect::at(left - 1, top - 1).of_size(bar_width + 2, bar_height + 2);
  draw_hollow_rect_mut(image, border, Rgb([255, 255, 255]));
}

/// 叠加渲染器：着色 → 混合 → 编码
#[derive(Debug, Clone)]
pub struct OverlayRenderer {
  config: RenderConfig,
}

impl Default for OverlayRenderer {
  fn default() -> Self {
    Self::new(RenderConfig::default())
  }
}

impl OverlayRenderer {
  pub fn new(config: RenderConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &RenderConfig {
    &self.config
  }

  pub fn format(&self) -> HeatmapFormat {
    self.config.format
  }

  pub fn colorize(&self, map: &AttentionMap) -> RgbImage {
    let gray = map.to_luma8();
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
      jet(gray.get_pixel(x, y)[0] as f32 / 255.0)
    })
  }

  /// `(1 - alpha) * image + alpha * heat`，alpha 钳制到 [0, 1]
  pub fn blend(&self, image: &RgbImage, map: &AttentionMap, alpha: f32) -> Result<RgbImage, ComputeError> {
    let (width, height) = image.dimensions();
    if (map.width(), map.height()) != (width as usize, height as usize) {
      return Err(ComputeError::ResolutionMismatch {
        image_width: width,
        image_height: height,
        map_width: map.width(),
        map_height: map.height(),
      });
    }
    if !alpha.is_finite() {
      return Err(ComputeError::NonFinite("混合系数"));
    }
    let alpha = alpha.clamp(0.0, 1.0);

    let heat = self.colorize(map);
    let mut out = image.clone();
    for (dst, src) in out.pixels_mut().zip(heat.pixels()) {
      for c in 0..3 {
        let v = (1.0 - alpha) * dst[c] as f32 + alpha * src[c] as f32;
        dst[c] = v.round().clamp(0.0, 255.0) as u8;
      }
    }
    Ok(out)
  }

  pub fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, ComputeError> {
    let mut bytes = Vec::new();
    match self.config.format {
      HeatmapFormat::Jpeg => {
        let encoder = JpegEncoder::new_with_quality(&mut bytes, self.config.jpeg_quality);
        image.write_with_encoder(encoder)?;
      }
      HeatmapFormat::Png => {
        let encoder = PngEncoder::new(&mut bytes);
        image.write_with_encoder(encoder)?;
      }
    }
    debug!("热力图编码为 {:?}: {} 字节", self.config.format, bytes.len());
    Ok(bytes)
  }

  /// 以指定混合系数渲染并编码
  pub fn render_with_alpha(
    &self,
    image: &RgbImage,
    map: &AttentionMap,
    alpha: f32,
  ) -> Result<Vec<u8>, ComputeError> {
    let blended = self.blend(image, map, alpha)?;
    self.encode(&blended)
  }

  /// 以配置中的混合系数渲染并编码
  pub fn render(&self, image: &RgbImage, map: &AttentionMap) -> Result<Vec<u8>, ComputeError> {
    self.render_with_alpha(image, map, self.config.blend_alpha)
  }
}
