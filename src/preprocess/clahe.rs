// 该文件是 Jingming （睛明） 项目的一部分。
// src/preprocess/clahe.rs - 限制对比度自适应直方图均衡化
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

use image::{GrayImage, ImageBuffer, Luma};

const HIST_BINS: usize = 256;

type Lut = [u8; HIST_BINS];

/// 按分块统计直方图，裁剪超出阈值的部分并均匀回填
fn tile_lut(src: &GrayImage, x0: u32, x1: u32, y0: u32, y1: u32, clip_limit: f32) -> Lut {
  let mut hist = [0usize; HIST_BINS];
  for y in y0..y1 {
    for x in x0..x1 {
      hist[src.get_pixel(x, y)[0] as usize] += 1;
    }
  }

  let area = ((x1 - x0) * (y1 - y0)) as usize;
  let clip = ((clip_limit * area as f32 / HIST_BINS as f32) as usize).max(1);

  let mut clipped = 0usize;
  for bin in hist.iter_mut() {
    if *bin > clip {
      clipped += *bin - clip;
      *bin = clip;
    }
  }

  let batch = clipped / HIST_BINS;
  let mut residual = clipped - batch * HIST_BINS;
  for bin in hist.iter_mut() {
    *bin += batch;
  }
  if residual > 0 {
    let step = (HIST_BINS / residual).max(1);
    let mut i = 0;
    while i < HIST_BINS && residual > 0 {
      hist[i] += 1;
      residual -= 1;
      i += step;
    }
  }

  let scale = (HIST_BINS - 1) as f32 / area.max(1) as f32;
  let mut lut = [0u8; HIST_BINS];
  let mut sum = 0usize;
  for (value, bin) in lut.iter_mut().zip(hist.iter()) {
    sum += bin;
    *value = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
  }
  lut
}

/// 对单通道图像执行 CLAHE
///
/// `grid` 为 `[列, 行]` 分块数；像素值在相邻四个分块的映射表之间双线性插值。
pub fn clahe(src: &GrayImage, clip_limit: f32, grid: [u32; 2]) -> GrayImage {
  let (width, height) = src.dimensions();
  if width == 0 || height == 0 {
    return src.clone();
  }

  let tiles_x = grid[0].clamp(1, width);
  let tiles_y = grid[1].clamp(1, height);
  let tile_w = width as f32 / tiles_x as f32;
  let tile_h = height as f32 / tiles_y as f32;

  let bound = |index: u32, size: f32, limit: u32, count: u32| -> u32 {
    if index == count {
      limit
    } else {
      ((index as f32 * size).floor() as u32).min(limit)
    }
  };

  let mut luts: Vec<Lut> = Vec::with_capacity((tiles_x * tiles_y) as usize);
  for ty in 0..tiles_y {
    let y0 = bound(ty, tile_h, height, tiles_y);
    let y1 = bound(ty + 1, tile_h, height, tiles_y);
    for tx in 0..tiles_x {
      let x0 = bound(tx, tile_w, width, tiles_x);
      let x1 = bound(tx + 1, tile_w, width, tiles_x);
      luts.push(tile_lut(src, x0, x1, y0, y1, clip_limit));
    }
  }

  // 相邻分块下标及插值权重
  let neighbours = |pos: u32, size: f32, count: u32| -> (usize, usize, f32) {
    let f = pos as f32 / size - 0.5;
    let lower = f.floor();
    let weight = f - lower;
    let first = (lower as i64).max(0) as usize;
    let second = ((lower as i64 + 1).min(count as i64 - 1)).max(0) as usize;
    (first, second, weight)
  };

  let tx_table: Vec<(usize, usize, f32)> = (0..width)
    .map(|x| neighbours(x, tile_w, tiles_x))
    .collect();

  let mut out: GrayImage = ImageBuffer::new(width, height);
  for y in 0..height {
    let (ty1, ty2, ya) = neighbours(y, tile_h, tiles_y);
    let row1 = ty1 * tiles_x as usize;
    let row2 = ty2 * tiles_x as usize;
    for (x, &(tx1, tx2, xa)) in tx_table.iter().enumerate() {
      let v = src.get_pixel(x as u32, y)[0] as usize;
      let top = luts[row1 + tx1][v] as f32 * (1.0 - xa) + luts[row1 + tx2][v] as f32 * xa;
      let bottom = luts[row2 + tx1][v] as f32 * (1.0 - xa) + luts[row2 + tx2][v] as f32 * xa;
      let value = top * (1.0 - ya) + bottom * ya;
      out.put_pixel(x as u32, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
    }
  }
  out
}
