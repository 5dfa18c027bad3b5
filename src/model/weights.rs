// 该文件是 Jingming （睛明） 项目的一部分。
// src/model/weights.rs - 权重文件格式与合成
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
  io::{BufReader, BufWriter},
  path::Path,
};

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
  frame::RGB_CHANNELS,
  model::{
    ModelUnavailableError, NUM_SEVERITY_CLASSES,
    layer::{BatchNorm, Conv2d, Layer, Linear},
  },
};

pub const WEIGHTS_FORMAT_VERSION: u32 = 1;

const BATCH_NORM_EPS: f32 = 1e-5;

/// 单层参数描述，JSON 中以 `type` 字段区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
  Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    /// 按 (输出, 输入, ky, kx) 行优先展开
    weight: Vec<f32>,
    bias: Vec<f32>,
  },
  BatchNorm {
    gamma: Vec<f32>,
    beta: Vec<f32>,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    eps: f32,
  },
  Relu,
  MaxPool2d {
    kernel_size: usize,
    stride: usize,
  },
  GlobalAvgPool,
  Linear {
    in_features: usize,
    out_features: usize,
    /// 按 (输出, 输入) 行优先展开
    weight: Vec<f32>,
    bias: Vec<f32>,
  },
}

fn all_finite(values: &[f32]) -> bool {
  values.iter().all(|v| v.is_finite())
}

impl LayerSpec {
  pub(crate) fn build(&self, index: usize) -> Result<Layer, ModelUnavailableError> {
    let invalid = |reason: String| ModelUnavailableError::InvalidLayer { index, reason };
    let check_len = |name: &str, values: &[f32], expected: usize| {
      if values.len() != expected {
        return Err(invalid(format!(
          "{} 长度 {} 与期望 {} 不符",
          name,
          values.len(),
          expected
        )));
      }
      if !all_finite(values) {
        return Err(invalid(format!("{} 含非有限值", name)));
      }
      Ok(())
    };

    let layer = match self {
      LayerSpec::Conv2d {
        in_channels,
        out_channels,
        kernel_size,
        stride,
        padding,
        weight,
        bias,
      } => {
        if *in_channels == 0 || *out_channels == 0 || *kernel_size == 0 || *stride == 0 {
          return Err(invalid("卷积通道数、核大小与步长必须为正".to_string()));
        }
        let cols = in_channels * kernel_size * kernel_size;
        check_len("weight", weight, out_channels * cols)?;
        check_len("bias", bias, *out_channels)?;
        let weight = Array2::from_shape_vec((*out_channels, cols), weight.clone())
          .map_err(|e| invalid(e.to_string()))?;
        Layer::Conv2d(Conv2d::new(
          weight,
          Array1::from(bias.clone()),
          *in_channels,
          *kernel_size,
          *stride,
          *padding,
        ))
      }
      LayerSpec::BatchNorm {
        gamma,
        beta,
        running_mean,
        running_var,
        eps,
      } => {
        let channels = gamma.len();
        if channels == 0 {
          return Err(invalid("批归一化通道数必须为正".to_string()));
        }
        check_len("gamma", gamma, channels)?;
        check_len("beta", beta, channels)?;
        check_len("running_mean", running_mean, channels)?;
        check_len("running_var", running_var, channels)?;
        if !(eps.is_finite() && *eps >= 0.0) {
          return Err(invalid(format!("eps 无效: {}", eps)));
        }
        if running_var.iter().any(|v| v + eps <= 0.0) {
          return Err(invalid("running_var + eps 必须为正".to_string()));
        }
        Layer::BatchNorm(BatchNorm::from_statistics(
          gamma,
          beta,
          running_mean,
          running_var,
          *eps,
        ))
      }
      LayerSpec::Relu => Layer::Relu,
      LayerSpec::MaxPool2d {
        kernel_size,
        stride,
      } => {
        if *kernel_size == 0 || *stride == 0 {
          return Err(invalid("池化核大小与步长必须为正".to_string()));
        }
        Layer::MaxPool2d {
          kernel: *kernel_size,
          stride: *stride,
        }
      }
      LayerSpec::GlobalAvgPool => Layer::GlobalAvgPool,
      LayerSpec::Linear {
        in_features,
        out_features,
        weight,
        bias,
      } => {
        if *in_features == 0 || *out_features == 0 {
          return Err(invalid("全连接维度必须为正".to_string()));
        }
        check_len("weight", weight, in_features * out_features)?;
        check_len("bias", bias, *out_features)?;
        let weight = Array2::from_shape_vec((*out_features, *in_features), weight.clone())
          .map_err(|e| invalid(e.to_string()))?;
        Layer::Linear(Linear::new(weight, Array1::from(bias.clone())))
      }
    };
    Ok(layer)
  }
}

/// 版本化权重文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsFile {
  pub format_version: u32,
  pub model_version: String,
  pub input_channels: usize,
  pub input_height: usize,
  pub input_width: usize,
  pub num_classes: usize,
  /// 输出作为激活快照的层下标
  pub observation_layer: usize,
  pub layers: Vec<LayerSpec>,
}

impl WeightsFile {
  pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ModelUnavailableError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ModelUnavailableError::Io {
      path: path.display().to_string(),
      source,
    })?;
    let weights: WeightsFile = serde_json::from_reader(BufReader::new(file))?;
    debug!(
      "读取权重文件 {}: 版本 {}，共 {} 层",
      path.display(),
      weights.model_version,
      weights.layers.len()
    );
    Ok(weights)
  }

  pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelUnavailableError> {
    let path = path.as_ref();
    let io_error = |source| ModelUnavailableError::Io {
      path: path.display().to_string(),
      source,
    };
    let file = File::create(path).map_err(io_error)?;
    serde_json::to_writer(BufWriter::new(file), self)?;
    info!("写入权重文件: {}", path.display());
    Ok(())
  }

  pub fn from_json_str(content: &str) -> Result<Self, ModelUnavailableError> {
    Ok(serde_json::from_str(content)?)
  }
}

/// 未经训练的确定性网络结构，用于冒烟测试与基准
///
/// 每个宽度对应一个 `conv3x3/s2 → batch_norm → relu` 块，
/// 观测层为最后一个块的 relu，其后接全局平均池化与全连接。
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticArchitecture {
  pub widths: Vec<usize>,
  pub input_size: usize,
  pub num_classes: usize,
  pub seed: u64,
}

impl Default for SyntheticArchitecture {
  fn default() -> Self {
    Self {
      widths: vec![16, 32, 64, 64],
      input_size: 224,
      num_classes: NUM_SEVERITY_CLASSES,
      seed: 0x5eed_1e55,
    }
  }
}

impl SyntheticArchitecture {
  pub fn synthesize(&self) -> WeightsFile {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
    let mut uniform = |n: usize, bound: f32| -> Vec<f32> {
      (0..n).map(|_| rng.random_range(-bound..=bound)).collect()
    };

    let mut layers = Vec::with_capacity(self.widths.len() * 3 + 2);
    let mut in_channels = RGB_CHANNELS;
    for &width in &self.widths {
      let kernel_size = 3;
      let fan_in = in_channels * kernel_size * kernel_size;
      // He 均匀初始化
      let bound = (6.0 / fan_in as f32).sqrt();
      layers.push(LayerSpec::Conv2d {
        in_channels,
        out_channels: width,
        kernel_size,
        stride: 2,
        padding: 1,
        weight: uniform(width * fan_in, bound),
        bias: uniform(width, 0.1),
      });
      layers.push(LayerSpec::BatchNorm {
        gamma: uniform(width, 0.2).into_iter().map(|v| 1.0 + v).collect(),
        beta: uniform(width, 0.1),
        running_mean: vec![0.0; width],
        running_var: vec![1.0; width],
        eps: BATCH_NORM_EPS,
      });
      layers.push(LayerSpec::Relu);
      in_channels = width;
    }

    let observation_layer = layers.len().saturating_sub(1);
    let bound = 1.0 / (in_channels as f32).sqrt();
    layers.push(LayerSpec::GlobalAvgPool);
    layers.push(LayerSpec::Linear {
      in_features: in_channels,
      out_features: self.num_classes,
      weight: uniform(self.num_classes * in_channels, bound),
      bias: uniform(self.num_classes, bound),
    });

    WeightsFile {
      format_version: WEIGHTS_FORMAT_VERSION,
      model_version: format!("synthetic-{:x}", self.seed),
      input_channels: RGB_CHANNELS,
      input_height: self.input_size,
      input_width: self.input_size,
      num_classes: self.num_classes,
      observation_layer,
      layers,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_synthesis_is_deterministic() {
    let arch = SyntheticArchitecture {
      widths: vec![4, 8],
      input_size: 32,
      ..SyntheticArchitecture::default()
    };
    assert_eq!(arch.synthesize(), arch.synthesize());
    let other = SyntheticArchitecture { seed: 7, ..arch.clone() };
    assert_ne!(arch.synthesize().layers, other.synthesize().layers);
  }

  #[test]
  fn test_observation_layer_is_last_relu() {
    let weights = SyntheticArchitecture::default().synthesize();
    assert_eq!(weights.observation_layer, 11);
    assert_eq!(weights.layers[weights.observation_layer], LayerSpec::Relu);
    assert_eq!(weights.layers[weights.observation_layer + 1], LayerSpec::GlobalAvgPool);
  }

  #[test]
  fn test_head_ends_with_linear_logits() {
    let weights = SyntheticArchitecture::default().synthesize();
    assert_eq!(weights.layers.len(), weights.observation_layer + 3);
    assert!(matches!(
      weights.layers.last(),
      Some(LayerSpec::Linear { out_features: 5, .. })
    ));
  }

  #[test]
  fn test_layer_spec_json_is_tagged() {
    let json = serde_json::to_string(&LayerSpec::MaxPool2d {
      kernel_size: 2,
      stride: 2,
    })
    .unwrap();
    assert_eq!(json, r#"{"type":"max_pool2d","kernel_size":2,"stride":2}"#);
    let relu: LayerSpec = serde_json::from_str(r#"{"type":"relu"}"#).unwrap();
    assert_eq!(relu, LayerSpec::Relu);
  }

  #[test]
  fn test_wrong_weight_length_rejected() {
    let spec = LayerSpec::Linear {
      in_features: 2,
      out_features: 2,
      weight: vec![0.0; 3],
      bias: vec![0.0; 2],
    };
    assert!(matches!(
      spec.build(4),
      Err(ModelUnavailableError::InvalidLayer { index: 4, .. })
    ));
  }

  #[test]
  fn test_non_finite_parameter_rejected() {
    let spec = LayerSpec::Conv2d {
      in_channels: 1,
      out_channels: 1,
      kernel_size: 1,
      stride: 1,
      padding: 0,
      weight: vec![f32::INFINITY],
      bias: vec![0.0],
    };
    assert!(spec.build(0).is_err());
  }
}
