// 该文件是 Jingming （睛明） 项目的一部分。
// src/explain.rs - Grad-CAM 注意力图
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

use image::{GrayImage, Luma};
use ndarray::{Array1, Array2, ArrayView2};
use tracing::debug;

use crate::{
  frame::NormalizedTensor,
  model::{ActivationSnapshot, Classifier, ComputeError, GradientSnapshot, PredictionResult},
};

/// 取值于 [0, 1] 的空间重要性图
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMap {
  data: Array2<f32>,
}

impl AttentionMap {
  #[cfg(test)]
  pub(crate) fn from_values(data: Array2<f32>) -> Self {
    Self { data }
  }

  pub fn values(&self) -> ArrayView2<'_, f32> {
    self.data.view()
  }

  pub fn height(&self) -> usize {
    self.data.nrows()
  }

  pub fn width(&self) -> usize {
    self.data.ncols()
  }

  pub fn get(&self, x: usize, y: usize) -> Option<f32> {
    self.data.get((y, x)).copied()
  }

  /// 双线性放大到指定分辨率
  pub fn upsample(&self, height: usize, width: usize) -> AttentionMap {
    AttentionMap {
      data: upsample_bilinear(self.data.view(), height, width),
    }
  }

  /// 量化为 8 位灰度图，供着色使用
  pub fn to_luma8(&self) -> GrayImage {
    GrayImage::from_fn(self.width() as u32, self.height() as u32, |x, y| {
      let v = self.data[[y as usize, x as usize]].clamp(0.0, 1.0);
      Luma([(v * 255.0) as u8])
    })
  }
}

/// 一次解释的完整结果
#[derive(Debug, Clone)]
pub struct Explanation {
  pub prediction: PredictionResult,
  pub target_class: usize,
  /// 每个通道的权重：梯度的空间均值
  pub channel_weights: Array1<f32>,
  /// 观测层分辨率下的注意力图
  pub coarse: AttentionMap,
  /// 放大到输入分辨率的注意力图
  pub map: AttentionMap,
}

/// 由激活与梯度计算 Grad-CAM
///
/// 权重为梯度在空间上的均值，对激活加权求和后经 ReLU，再做最小-最大归一化。
/// 常数图归一化为全零。
pub fn grad_cam(
  activations: &ActivationSnapshot,
  gradients: &GradientSnapshot,
) -> Result<(Array1<f32>, AttentionMap), ComputeError> {
  if activations.dim() != gradients.dim() {
    return Err(ComputeError::ShapeMismatch {
      layer: 0,
      expected: format!("{:?}", activations.dim()),
      found: format!("{:?}", gradients.dim()),
    });
  }
  if !activations.iter().all(|v| v.is_finite()) {
    return Err(ComputeError::NonFinite("激活"));
  }
  if !gradients.iter().all(|v| v.is_finite()) {
    return Err(ComputeError::NonFinite("梯度"));
  }

  let (_, height, width) = activations.dim();
  let area = (height * width).max(1) as f32;
  let weights: Array1<f32> = gradients
    .outer_iter()
    .map(|plane| plane.sum() / area)
    .collect();

  let mut cam = Array2::<f32>::zeros((height, width));
  for (plane, &weight) in activations.outer_iter().zip(weights.iter()) {
    cam.scaled_add(weight, &plane);
  }
  cam.mapv_inplace(|v| v.max(0.0));
  if !cam.iter().all(|v| v.is_finite()) {
    return Err(ComputeError::NonFinite("注意力图"));
  }

  let min = cam.iter().copied().fold(f32::INFINITY, f32::min);
  let max = cam.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let range = max - min;
  if range > 0.0 {
    cam.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
  } else {
    cam.fill(0.0);
  }

  Ok((weights, AttentionMap { data: cam }))
}

/// 双线性插值（像素中心对齐，边界钳制）
pub fn upsample_bilinear(map: ArrayView2<'_, f32>, height: usize, width: usize) -> Array2<f32> {
  let (src_h, src_w) = map.dim();
  if src_h == 0 || src_w == 0 {
    return Array2::zeros((height, width));
  }

  let axis = |dst: usize, dst_len: usize, src_len: usize| -> (usize, usize, f32) {
    let scale = src_len as f32 / dst_len as f32;
    let s = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let lower = (s.floor() as usize).min(src_len - 1);
    let upper = (lower + 1).min(src_len - 1);
    (lower, upper, s - lower as f32)
  };

  let xs: Vec<_> = (0..width).map(|x| axis(x, width, src_w)).collect();
  let ys: Vec<_> = (0..height).map(|y| axis(y, height, src_h)).collect();

  Array2::from_shape_fn((height, width), |(y, x)| {
    let (y0, y1, fy) = ys[y];
    let (x0, x1, fx) = xs[x];
    let fx = fx.clamp(0.0, 1.0);
    let fy = fy.clamp(0.0, 1.0);
    let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
    let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
    top * (1.0 - fy) + bottom * fy
  })
}

/// 对一张预处理后的图像生成注意力图
///
/// `target_class` 为空时解释预测类别。
pub fn explain(
  classifier: &Classifier,
  tensor: &NormalizedTensor,
  target_class: Option<usize>,
) -> Result<Explanation, ComputeError> {
  let pass = classifier.forward(tensor)?;
  let prediction = pass.prediction()?;
  let target_class = target_class.unwrap_or(prediction.class_index());

  let gradients = pass.backward(target_class)?;
  let (channel_weights, coarse) = grad_cam(pass.activations()?, &gradients)?;
  debug!(
    "目标类别 {} 的注意力图: {}x{}",
    target_class,
    coarse.width(),
    coarse.height()
  );

  let map = coarse.upsample(tensor.height(), tensor.width());
  if !map.data.iter().all(|v| v.is_finite()) {
    return Err(ComputeError::NonFinite("放大后的注意力图"));
  }

  Ok(Explanation {
    prediction,
    target_class,
    channel_weights,
    coarse,
    map,
  })
}
