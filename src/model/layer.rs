// 该文件是 Jingming （睛明） 项目的一部分。
// src/model/layer.rs - 网络层的前向与反向计算
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

use std::fmt;

use ndarray::{Array1, Array2, Array3, Axis, Zip};

use crate::model::ComputeError;

/// 层间传递的特征：卷积阶段为 CHW，全局池化之后为向量
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
  Spatial(Array3<f32>),
  Flat(Array1<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureShape {
  Spatial {
    channels: usize,
    height: usize,
    width: usize,
  },
  Flat(usize),
}

impl fmt::Display for FeatureShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FeatureShape::Spatial {
        channels,
        height,
        width,
      } => write!(f, "{}x{}x{}", channels, height, width),
      FeatureShape::Flat(n) => write!(f, "[{}]", n),
    }
  }
}

impl Feature {
  pub fn shape(&self) -> FeatureShape {
    match self {
      Feature::Spatial(x) => {
        let (channels, height, width) = x.dim();
        FeatureShape::Spatial {
          channels,
          height,
          width,
        }
      }
      Feature::Flat(x) => FeatureShape::Flat(x.len()),
    }
  }

  pub fn is_finite(&self) -> bool {
    match self {
      Feature::Spatial(x) => x.iter().all(|v| v.is_finite()),
      Feature::Flat(x) => x.iter().all(|v| v.is_finite()),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
  /// (输出通道, 输入通道 × k × k)
  weight: Array2<f32>,
  bias: Array1<f32>,
  in_channels: usize,
  out_channels: usize,
  kernel: usize,
  stride: usize,
  padding: usize,
}

impl Conv2d {
  pub fn new(
    weight: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
  ) -> Self {
    let out_channels = weight.nrows();
    Self {
      weight,
      bias,
      in_channels,
      out_channels,
      kernel,
      stride,
      padding,
    }
  }

  fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
    let padded_h = height + 2 * self.padding;
    let padded_w = width + 2 * self.padding;
    if padded_h < self.kernel || padded_w < self.kernel || self.stride == 0 {
      return None;
    }
    Some((
      (padded_h - self.kernel) / self.stride + 1,
      (padded_w - self.kernel) / self.stride + 1,
    ))
  }

  /// 把每个输出位置的感受野展开为一列
  fn im2col(&self, x: &Array3<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (channels, height, width) = x.dim();
    let k = self.kernel;
    let mut cols = Array2::<f32>::zeros((channels * k * k, out_h * out_w));
    for c in 0..channels {
      for ky in 0..k {
        for kx in 0..k {
          let row = (c * k + ky) * k + kx;
          for oy in 0..out_h {
            let iy = (oy * self.stride + ky) as isize - self.padding as isize;
            if iy < 0 || iy >= height as isize {
              continue;
            }
            for ox in 0..out_w {
              let ix = (ox * self.stride + kx) as isize - self.padding as isize;
              if ix < 0 || ix >= width as isize {
                continue;
              }
              cols[[row, oy * out_w + ox]] = x[[c, iy as usize, ix as usize]];
            }
          }
        }
      }
    }
    cols
  }

  /// im2col 的伴随：把列梯度累加回输入位置
  fn col2im(&self, cols: &Array2<f32>, shape: (usize, usize, usize), out_w: usize) -> Array3<f32> {
    let (channels, height, width) = shape;
    let k = self.kernel;
    let out_h = cols.ncols() / out_w.max(1);
    let mut x = Array3::<f32>::zeros(shape);
    for c in 0..channels {
      for ky in 0..k {
        for kx in 0..k {
          let row = (c * k + ky) * k + kx;
          for oy in 0..out_h {
            let iy = (oy * self.stride + ky) as isize - self.padding as isize;
            if iy < 0 || iy >= height as isize {
              continue;
            }
            for ox in 0..out_w {
              let ix = (ox * self.stride + kx) as isize - self.padding as isize;
              if ix < 0 || ix >= width as isize {
                continue;
              }
              x[[c, iy as usize, ix as usize]] += cols[[row, oy * out_w + ox]];
            }
          }
        }
      }
    }
    x
  }

  fn forward(&self, index: usize, x: &Array3<f32>) -> Result<Array3<f32>, ComputeError> {
    let (_, height, width) = x.dim();
    let (out_h, out_w) = self
      .output_hw(height, width)
      .ok_or_else(|| mismatch(index, "卷积感受野", format!("{}x{}", height, width)))?;
    let cols = self.im2col(x, out_h, out_w);
    let mut out = self.weight.dot(&cols);
    out += &self.bias.view().insert_axis(Axis(1));
    out
      .into_shape_with_order((self.out_channels, out_h, out_w))
      .map_err(|e| mismatch(index, "卷积输出", e.to_string()))
  }

  fn backward(
    &self,
    index: usize,
    input_shape: (usize, usize, usize),
    grad: &Array3<f32>,
  ) -> Result<Array3<f32>, ComputeError> {
    let (channels, out_h, out_w) = grad.dim();
    let grad = grad
      .as_standard_layout()
      .into_owned()
      .into_shape_with_order((channels, out_h * out_w))
      .map_err(|e| mismatch(index, "卷积梯度", e.to_string()))?;
    let grad_cols = self.weight.t().dot(&grad);
    Ok(self.col2im(&grad_cols, input_shape, out_w))
  }
}

/// 推理期批归一化，已折叠为逐通道仿射变换
#[derive(Debug, Clone)]
pub struct BatchNorm {
  scale: Array1<f32>,
  shift: Array1<f32>,
}

impl BatchNorm {
  pub fn from_statistics(
    gamma: &[f32],
    beta: &[f32],
    running_mean: &[f32],
    running_var: &[f32],
    eps: f32,
  ) -> Self {
    let scale: Array1<f32> = gamma
      .iter()
      .zip(running_var)
      .map(|(g, v)| g / (v + eps).sqrt())
      .collect();
    let shift: Array1<f32> = beta
      .iter()
      .zip(running_mean)
      .zip(scale.iter())
      .map(|((b, m), s)| b - m * s)
      .collect();
    Self { scale, shift }
  }

  fn channels(&self) -> usize {
    self.scale.len()
  }
}

#[derive(Debug, Clone)]
pub struct Linear {
  /// (输出维度, 输入维度)
  weight: Array2<f32>,
  bias: Array1<f32>,
}

impl Linear {
  pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Self {
    Self { weight, bias }
  }
}

#[derive(Debug, Clone)]
pub enum Layer {
  Conv2d(Conv2d),
  BatchNorm(BatchNorm),
  Relu,
  MaxPool2d { kernel: usize, stride: usize },
  GlobalAvgPool,
  Linear(Linear),
}

fn mismatch(layer: usize, expected: &str, found: String) -> ComputeError {
  ComputeError::ShapeMismatch {
    layer,
    expected: expected.to_string(),
    found,
  }
}

impl Layer {
  /// 推导输出形状，输入不兼容时返回 None
  pub fn output_shape(&self, input: FeatureShape) -> Option<FeatureShape> {
    match (self, input) {
      (
        Layer::Conv2d(conv),
        FeatureShape::Spatial {
          channels,
          height,
          width,
        },
      ) if channels == conv.in_channels => {
        let (height, width) = conv.output_hw(height, width)?;
        Some(FeatureShape::Spatial {
          channels: conv.out_channels,
          height,
          width,
        })
      }
      (Layer::BatchNorm(bn), FeatureShape::Spatial { channels, .. })
      | (Layer::BatchNorm(bn), FeatureShape::Flat(channels))
        if channels == bn.channels() =>
      {
        Some(input)
      }
      (Layer::Relu, _) => Some(input),
      (
        Layer::MaxPool2d { kernel, stride },
        FeatureShape::Spatial {
          channels,
          height,
          width,
        },
      ) if height >= *kernel && width >= *kernel && *stride > 0 && *kernel > 0 => {
        Some(FeatureShape::Spatial {
          channels,
          height: (height - kernel) / stride + 1,
          width: (width - kernel) / stride + 1,
        })
      }
      (Layer::GlobalAvgPool, FeatureShape::Spatial { channels, .. }) => {
        Some(FeatureShape::Flat(channels))
      }
      (Layer::Linear(linear), FeatureShape::Flat(n)) if n == linear.weight.ncols() => {
        Some(FeatureShape::Flat(linear.weight.nrows()))
      }
      _ => None,
    }
  }

  pub fn describe(&self) -> String {
    match self {
      Layer::Conv2d(conv) => format!(
        "conv2d({}->{}, k={}, s={}, p={})",
        conv.in_channels, conv.out_channels, conv.kernel, conv.stride, conv.padding
      ),
      Layer::BatchNorm(bn) => format!("batch_norm({})", bn.channels()),
      Layer::Relu => "relu".to_string(),
      Layer::MaxPool2d { kernel, stride } => format!("max_pool2d(k={}, s={})", kernel, stride),
      Layer::GlobalAvgPool => "global_avg_pool".to_string(),
      Layer::Linear(linear) => format!(
        "linear({}->{})",
        linear.weight.ncols(),
        linear.weight.nrows()
      ),
    }
  }

  fn check(&self, index: usize, input: &Feature) -> Result<(), ComputeError> {
    match self.output_shape(input.shape()) {
      Some(_) => Ok(()),
      None => Err(mismatch(
        index,
        &self.describe(),
        input.shape().to_string(),
      )),
    }
  }

  pub fn forward(&self, index: usize, input: Feature) -> Result<Feature, ComputeError> {
    self.check(index, &input)?;
    let output = match (self, input) {
      (Layer::Conv2d(conv), Feature::Spatial(x)) => Feature::Spatial(conv.forward(index, &x)?),
      (Layer::BatchNorm(bn), Feature::Spatial(mut x)) => {
        for ((mut plane, &s), &t) in x
          .axis_iter_mut(Axis(0))
          .zip(bn.scale.iter())
          .zip(bn.shift.iter())
        {
          plane.mapv_inplace(|v| v * s + t);
        }
        Feature::Spatial(x)
      }
      (Layer::BatchNorm(bn), Feature::Flat(x)) => Feature::Flat(x * &bn.scale + &bn.shift),
      (Layer::Relu, Feature::Spatial(mut x)) => {
        x.mapv_inplace(|v| v.max(0.0));
        Feature::Spatial(x)
      }
      (Layer::Relu, Feature::Flat(mut x)) => {
        x.mapv_inplace(|v| v.max(0.0));
        Feature::Flat(x)
      }
      (Layer::MaxPool2d { kernel, stride }, Feature::Spatial(x)) => {
        Feature::Spatial(max_pool(&x, *kernel, *stride))
      }
      (Layer::GlobalAvgPool, Feature::Spatial(x)) => {
        let (_, height, width) = x.dim();
        let area = (height * width) as f32;
        Feature::Flat(x.outer_iter().map(|plane| plane.sum() / area).collect())
      }
      (Layer::Linear(linear), Feature::Flat(x)) => {
        Feature::Flat(linear.weight.dot(&x) + &linear.bias)
      }
      (_, input) => {
        return Err(mismatch(index, &self.describe(), input.shape().to_string()));
      }
    };
    Ok(output)
  }

  /// 给定本层输入与输出梯度，返回输入梯度
  pub fn backward(&self, index: usize, input: &Feature, grad: Feature) -> Result<Feature, ComputeError> {
    let expected = self
      .output_shape(input.shape())
      .ok_or_else(|| mismatch(index, &self.describe(), input.shape().to_string()))?;
    if grad.shape() != expected {
      return Err(mismatch(index, &expected.to_string(), grad.shape().to_string()));
    }

    let grad_input = match (self, input, grad) {
      (Layer::Conv2d(conv), Feature::Spatial(x), Feature::Spatial(g)) => {
        Feature::Spatial(conv.backward(index, x.dim(), &g)?)
      }
      (Layer::BatchNorm(bn), Feature::Spatial(_), Feature::Spatial(mut g)) => {
        for (mut plane, &s) in g.axis_iter_mut(Axis(0)).zip(bn.scale.iter()) {
          plane.mapv_inplace(|v| v * s);
        }
        Feature::Spatial(g)
      }
      (Layer::BatchNorm(bn), Feature::Flat(_), Feature::Flat(g)) => Feature::Flat(g * &bn.scale),
      (Layer::Relu, Feature::Spatial(x), Feature::Spatial(mut g)) => {
        Zip::from(&mut g).and(x).for_each(|g, &x| {
          if x <= 0.0 {
            *g = 0.0;
          }
        });
        Feature::Spatial(g)
      }
      (Layer::Relu, Feature::Flat(x), Feature::Flat(mut g)) => {
        Zip::from(&mut g).and(x).for_each(|g, &x| {
          if x <= 0.0 {
            *g = 0.0;
          }
        });
        Feature::Flat(g)
      }
      (Layer::MaxPool2d { kernel, stride }, Feature::Spatial(x), Feature::Spatial(g)) => {
        Feature::Spatial(max_pool_backward(x, &g, *kernel, *stride))
      }
      (Layer::GlobalAvgPool, Feature::Spatial(x), Feature::Flat(g)) => {
        let (channels, height, width) = x.dim();
        let area = (height * width) as f32;
        Feature::Spatial(Array3::from_shape_fn((channels, height, width), |(c, _, _)| {
          g[c] / area
        }))
      }
      (Layer::Linear(linear), Feature::Flat(_), Feature::Flat(g)) => {
        Feature::Flat(linear.weight.t().dot(&g))
      }
      (_, input, grad) => {
        return Err(mismatch(
          index,
          &format!("{} / {}", input.shape(), expected),
          grad.shape().to_string(),
        ));
      }
    };
    Ok(grad_input)
  }
}

fn max_pool(x: &Array3<f32>, kernel: usize, stride: usize) -> Array3<f32> {
  let (channels, height, width) = x.dim();
  let out_h = (height - kernel) / stride + 1;
  let out_w = (width - kernel) / stride + 1;
  Array3::from_shape_fn((channels, out_h, out_w), |(c, oy, ox)| {
    let mut best = f32::NEG_INFINITY;
    for ky in 0..kernel {
      for kx in 0..kernel {
        best = best.max(x[[c, oy * stride + ky, ox * stride + kx]]);
      }
    }
    best
  })
}

/// 梯度只回传到窗口内第一个最大值位置
fn max_pool_backward(x: &Array3<f32>, grad: &Array3<f32>, kernel: usize, stride: usize) -> Array3<f32> {
  let mut grad_input = Array3::<f32>::zeros(x.dim());
  for ((c, oy, ox), &g) in grad.indexed_iter() {
    let mut best = f32::NEG_INFINITY;
    let mut arg = (oy * stride, ox * stride);
    for ky in 0..kernel {
      for kx in 0..kernel {
        let (iy, ix) = (oy * stride + ky, ox * stride + kx);
        if x[[c, iy, ix]] > best {
          best = x[[c, iy, ix]];
          arg = (iy, ix);
        }
      }
    }
    grad_input[[c, arg.0, arg.1]] += g;
  }
  grad_input
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array, array};

  fn conv(out: usize, input: usize, k: usize, stride: usize, padding: usize) -> Conv2d {
    let n = out * input * k * k;
    let weight = Array::from_shape_fn((out, input * k * k), |(o, i)| {
      ((o * 7 + i * 3) % 11) as f32 / 11.0 - 0.45
    });
    let bias = Array1::from_shape_fn(out, |o| o as f32 * 0.05);
    assert_eq!(weight.len(), n);
    Conv2d::new(weight, bias, input, k, stride, padding)
  }

  fn input(c: usize, h: usize, w: usize) -> Array3<f32> {
    Array3::from_shape_fn((c, h, w), |(c, y, x)| {
      ((c * 31 + y * 17 + x * 13) % 23) as f32 / 23.0 - 0.5
    })
  }

  #[test]
  fn test_identity_kernel_copies_input() {
    let mut weight = Array2::<f32>::zeros((1, 9));
    weight[[0, 4]] = 1.0;
    let layer = Layer::Conv2d(Conv2d::new(weight, Array1::zeros(1), 1, 3, 1, 1));
    let x = input(1, 5, 4);
    let out = layer.forward(0, Feature::Spatial(x.clone())).unwrap();
    assert_eq!(out, Feature::Spatial(x));
  }

  #[test]
  fn test_conv_output_shape_with_stride() {
    let layer = Layer::Conv2d(conv(4, 3, 3, 2, 1));
    let shape = FeatureShape::Spatial {
      channels: 3,
      height: 224,
      width: 224,
    };
    assert_eq!(
      layer.output_shape(shape),
      Some(FeatureShape::Spatial {
        channels: 4,
        height: 112,
        width: 112
      })
    );
    assert_eq!(layer.output_shape(FeatureShape::Flat(3)), None);
  }

  /// 用 <grad_out, y(x)> 的有限差分检查输入梯度
  fn check_gradient(layer: &Layer, x: Array3<f32>) {
    let out = layer.forward(0, Feature::Spatial(x.clone())).unwrap();
    let seed = match &out {
      Feature::Spatial(y) => Feature::Spatial(Array3::from_shape_fn(y.dim(), |(c, i, j)| {
        ((c + 2 * i + 3 * j) % 5) as f32 - 2.0
      })),
      Feature::Flat(y) => Feature::Flat(Array1::from_shape_fn(y.len(), |i| i as f32 - 1.0)),
    };
    let objective = |x: &Array3<f32>| -> f32 {
      let out = layer.forward(0, Feature::Spatial(x.clone())).unwrap();
      match (&out, &seed) {
        (Feature::Spatial(y), Feature::Spatial(s)) => (y * s).sum(),
        (Feature::Flat(y), Feature::Flat(s)) => y.dot(s),
        _ => unreachable!(),
      }
    };
    let grad = match layer.backward(0, &Feature::Spatial(x.clone()), seed.clone()).unwrap() {
      Feature::Spatial(g) => g,
      Feature::Flat(_) => panic!("期望空间梯度"),
    };

    let eps = 1e-2;
    for (idx, &analytic) in grad.indexed_iter() {
      let mut plus = x.clone();
      plus[idx] += eps;
      let mut minus = x.clone();
      minus[idx] -= eps;
      let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
      assert!(
        (numeric - analytic).abs() < 1e-2,
        "{:?}: numeric {} analytic {}",
        idx,
        numeric,
        analytic
      );
    }
  }

  #[test]
  fn test_conv_backward_matches_finite_difference() {
    check_gradient(&Layer::Conv2d(conv(3, 2, 3, 2, 1)), input(2, 6, 5));
    check_gradient(&Layer::Conv2d(conv(2, 2, 1, 1, 0)), input(2, 3, 3));
  }

  #[test]
  fn test_batch_norm_backward_matches_finite_difference() {
    let bn = BatchNorm::from_statistics(&[1.5, 0.5], &[0.1, -0.2], &[0.3, 0.0], &[2.0, 0.25], 1e-5);
    check_gradient(&Layer::BatchNorm(bn), input(2, 3, 3));
  }

  #[test]
  fn test_global_avg_pool_backward_matches_finite_difference() {
    check_gradient(&Layer::GlobalAvgPool, input(3, 4, 2));
  }

  #[test]
  fn test_max_pool_routes_gradient_to_maximum() {
    let x = array![[[1.0f32, 5.0], [3.0, 2.0]]];
    let layer = Layer::MaxPool2d {
      kernel: 2,
      stride: 2,
    };
    let out = layer.forward(0, Feature::Spatial(x.clone())).unwrap();
    assert_eq!(out, Feature::Spatial(array![[[5.0f32]]]));
    let grad = layer
      .backward(0, &Feature::Spatial(x), Feature::Spatial(array![[[2.0f32]]]))
      .unwrap();
    assert_eq!(grad, Feature::Spatial(array![[[0.0f32, 2.0], [0.0, 0.0]]]));
  }

  #[test]
  fn test_relu_backward_masks_negative_inputs() {
    let x = array![-1.0f32, 0.0, 2.0];
    let grad = Layer::Relu
      .backward(0, &Feature::Flat(x), Feature::Flat(array![1.0f32, 1.0, 1.0]))
      .unwrap();
    assert_eq!(grad, Feature::Flat(array![0.0f32, 0.0, 1.0]));
  }

  #[test]
  fn test_linear_backward_is_transpose() {
    let linear = Linear::new(array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]], array![0.0f32, 0.0, 0.0]);
    let layer = Layer::Linear(linear);
    let out = layer.forward(0, Feature::Flat(array![1.0f32, -1.0])).unwrap();
    assert_eq!(out, Feature::Flat(array![-1.0f32, -1.0, -1.0]));
    let grad = layer
      .backward(0, &Feature::Flat(array![1.0f32, -1.0]), Feature::Flat(array![0.0f32, 1.0, 0.0]))
      .unwrap();
    assert_eq!(grad, Feature::Flat(array![3.0f32, 4.0]));
  }

  #[test]
  fn test_shape_mismatch_is_reported() {
    let layer = Layer::Conv2d(conv(2, 3, 3, 1, 1));
    let err = layer.forward(7, Feature::Spatial(input(2, 4, 4))).unwrap_err();
    assert!(matches!(err, ComputeError::ShapeMismatch { layer: 7, .. }));
  }
}
