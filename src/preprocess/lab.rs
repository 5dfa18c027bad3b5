// 该文件是 Jingming （睛明） 项目的一部分。
// src/preprocess/lab.rs - sRGB 与 CIE L*a*b* 互转
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

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use palette::{FromColor, IntoColor, Lab, LinSrgb, Srgb};

/// 8 位亮度通道 + 浮点色度通道
///
/// 亮度按 `L * 255 / 100` 量化，便于直接做直方图均衡化；a/b 保留浮点精度。
pub struct LabImage {
  pub lightness: GrayImage,
  chroma: Vec<(f32, f32)>,
}

fn rgb_pixel_to_lab(pixel: &Rgb<u8>) -> Lab {
  let [r, g, b] = pixel.0.map(|v| v as f32 / 255.0);
  let linear: LinSrgb<f32> = Srgb::new(r, g, b).into_linear();
  Lab::from_color(linear)
}

fn lab_to_rgb_pixel(lab: Lab) -> Rgb<u8> {
  let linear: LinSrgb<f32> = lab.into_color();
  let srgb: Srgb<f32> = Srgb::from_linear(linear);
  Rgb([srgb.red, srgb.green, srgb.blue].map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
}

pub fn rgb_to_lab(image: &RgbImage) -> LabImage {
  let (width, height) = image.dimensions();
  let mut lightness = GrayImage::new(width, height);
  let mut chroma = Vec::with_capacity((width * height) as usize);

  for (x, y, pixel) in image.enumerate_pixels() {
    let lab = rgb_pixel_to_lab(pixel);
    let l8 = (lab.l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8;
    lightness.put_pixel(x, y, Luma([l8]));
    chroma.push((lab.a, lab.b));
  }

  LabImage { lightness, chroma }
}

pub fn lab_to_rgb(lab: &LabImage) -> RgbImage {
  let (width, height) = lab.lightness.dimensions();
  ImageBuffer::from_fn(width, height, |x, y| {
    let l = lab.lightness.get_pixel(x, y)[0] as f32 * 100.0 / 255.0;
    let (a, b) = lab.chroma[(y * width + x) as usize];
    lab_to_rgb_pixel(Lab::new(l, a, b))
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lab_round_trip_preserves_colors() {
    let colors = [
      [0u8, 0, 0],
      [255, 255, 255],
      [128, 128, 128],
      [200, 40, 30],
      [20, 160, 90],
      [35, 60, 210],
    ];
    let image = ImageBuffer::from_fn(colors.len() as u32, 1, |x, _| Rgb(colors[x as usize]));
    let restored = lab_to_rgb(&rgb_to_lab(&image));
    for (a, b) in image.pixels().zip(restored.pixels()) {
      for c in 0..3 {
        assert!(
          (a[c] as i32 - b[c] as i32).abs() <= 2,
          "{:?} -> {:?}",
          a,
          b
        );
      }
    }
  }

  #[test]
  fn test_white_lightness_is_full_scale() {
    let image = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
    let lab = rgb_to_lab(&image);
    assert!(lab.lightness.pixels().all(|p| p[0] == 255));
  }

  #[test]
  fn test_gray_has_neutral_chroma() {
    let lab = rgb_pixel_to_lab(&Rgb([128, 128, 128]));
    assert!((lab.l - 53.6).abs() < 0.5);
    assert!(lab.a.abs() < 0.5 && lab.b.abs() < 0.5);
  }
}
