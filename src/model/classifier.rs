// 该文件是 Jingming （睛明） 项目的一部分。
// src/model/classifier.rs - 卷积分类器
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

use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::Array1;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::{NormalizedTensor, RGB_CHANNELS},
  model::{
    ActivationSnapshot, ComputeError, GradientSnapshot, NUM_SEVERITY_CLASSES, PredictionResult,
    layer::{Feature, FeatureShape, Layer},
    weights::{WEIGHTS_FORMAT_VERSION, WeightsFile},
  },
};

#[derive(Error, Debug)]
pub enum ModelUnavailableError {
  #[error("权重文件读取错误 {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("权重文件解析错误: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("权重文件格式版本 {found} 不受支持，期望 {expected}")]
  UnsupportedVersion { found: u32, expected: u32 },
  #[error("第 {index} 层参数无效: {reason}")]
  InvalidLayer { index: usize, reason: String },
  #[error("网络结构无效: {0}")]
  InvalidArchitecture(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

/// 已加载的分类器，加载后只读，可在线程间共享
#[derive(Debug)]
pub struct Classifier {
  layers: Vec<Layer>,
  observation_layer: usize,
  input_shape: FeatureShape,
  observation_shape: FeatureShape,
  num_classes: usize,
  model_version: String,
  forward_passes: AtomicU64,
}

/// 模型元信息，用于健康检查与日志
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierMetadata {
  pub model_version: String,
  pub format_version: u32,
  pub num_classes: usize,
  pub input_shape: String,
  pub observation_layer: usize,
  pub observation_shape: String,
  pub architecture: Vec<String>,
}

impl Classifier {
  pub fn from_weights(weights: &WeightsFile) -> Result<Self, ModelUnavailableError> {
    if weights.format_version != WEIGHTS_FORMAT_VERSION {
      return Err(ModelUnavailableError::UnsupportedVersion {
        found: weights.format_version,
        expected: WEIGHTS_FORMAT_VERSION,
      });
    }
    if weights.input_channels != RGB_CHANNELS {
      return Err(ModelUnavailableError::InvalidArchitecture(format!(
        "输入通道数必须为 {}，实际为 {}",
        RGB_CHANNELS, weights.input_channels
      )));
    }
    if weights.num_classes != NUM_SEVERITY_CLASSES {
      return Err(ModelUnavailableError::InvalidArchitecture(format!(
        "类别数必须为 {}，实际为 {}",
        NUM_SEVERITY_CLASSES, weights.num_classes
      )));
    }
    if weights.observation_layer >= weights.layers.len() {
      return Err(ModelUnavailableError::InvalidArchitecture(format!(
        "观测层下标 {} 超出层数 {}",
        weights.observation_layer,
        weights.layers.len()
      )));
    }

    let layers = weights
      .layers
      .iter()
      .enumerate()
      .map(|(index, spec)| spec.build(index))
      .collect::<Result<Vec<_>, _>>()?;

    let input_shape = FeatureShape::Spatial {
      channels: weights.input_channels,
      height: weights.input_height,
      width: weights.input_width,
    };
    let mut shape = input_shape;
    let mut observation_shape = None;
    for (index, layer) in layers.iter().enumerate() {
      shape = layer.output_shape(shape).ok_or_else(|| {
        ModelUnavailableError::InvalidArchitecture(format!(
          "第 {} 层 {} 无法接受输入 {}",
          index,
          layer.describe(),
          shape
        ))
      })?;
      debug!("第 {} 层 {} -> {}", index, layer.describe(), shape);
      if index == weights.observation_layer {
        observation_shape = Some(shape);
      }
    }

    let observation_shape = match observation_shape {
      Some(s @ FeatureShape::Spatial { .. }) => s,
      other => {
        return Err(ModelUnavailableError::InvalidArchitecture(format!(
          "观测层 {} 的输出必须为空间特征，实际为 {:?}",
          weights.observation_layer, other
        )));
      }
    };
    if shape != FeatureShape::Flat(weights.num_classes) {
      return Err(ModelUnavailableError::InvalidArchitecture(format!(
        "网络输出 {} 与类别数 {} 不符",
        shape, weights.num_classes
      )));
    }

    Ok(Self {
      layers,
      observation_layer: weights.observation_layer,
      input_shape,
      observation_shape,
      num_classes: weights.num_classes,
      model_version: weights.model_version.clone(),
      forward_passes: AtomicU64::new(0),
    })
  }

  /// 输入张量的 (高, 宽)
  pub fn input_size(&self) -> (usize, usize) {
    match self.input_shape {
      FeatureShape::Spatial { height, width, .. } => (height, width),
      FeatureShape::Flat(_) => (0, 0),
    }
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  pub fn observation_layer(&self) -> usize {
    self.observation_layer
  }

  pub fn model_version(&self) -> &str {
    &self.model_version
  }

  /// 自加载以来执行过的前向计算次数
  pub fn forward_passes(&self) -> u64 {
    self.forward_passes.load(Ordering::Relaxed)
  }

  pub fn metadata(&self) -> ClassifierMetadata {
    ClassifierMetadata {
      model_version: self.model_version.clone(),
      format_version: WEIGHTS_FORMAT_VERSION,
      num_classes: self.num_classes,
      input_shape: self.input_shape.to_string(),
      observation_layer: self.observation_layer,
      observation_shape: self.observation_shape.to_string(),
      architecture: self.layers.iter().map(Layer::describe).collect(),
    }
  }

  fn check_input(&self, tensor: &NormalizedTensor) -> Result<Feature, ComputeError> {
    let found = FeatureShape::Spatial {
      channels: tensor.channels(),
      height: tensor.height(),
      width: tensor.width(),
    };
    if found != self.input_shape {
      return Err(ComputeError::ShapeMismatch {
        layer: 0,
        expected: self.input_shape.to_string(),
        found: found.to_string(),
      });
    }
    Ok(Feature::Spatial(tensor.view().to_owned()))
  }

  /// 逐层前向，`record` 为真时记录观测层之后各层的输入
  fn run(&self, tensor: &NormalizedTensor, record: bool) -> Result<(Vec<f32>, Vec<Feature>), ComputeError> {
    let mut feature = self.check_input(tensor)?;
    self.forward_passes.fetch_add(1, Ordering::Relaxed);

    let mut tape = Vec::new();
    for (index, layer) in self.layers.iter().enumerate() {
      if record && index > self.observation_layer {
        tape.push(feature.clone());
      }
      feature = layer.forward(index, feature)?;
      if index == self.observation_layer && !feature.is_finite() {
        return Err(ComputeError::NonFinite("观测层激活"));
      }
    }

    match feature {
      Feature::Flat(logits) => Ok((logits.to_vec(), tape)),
      Feature::Spatial(_) => Err(ComputeError::ShapeMismatch {
        layer: self.layers.len(),
        expected: FeatureShape::Flat(self.num_classes).to_string(),
        found: feature.shape().to_string(),
      }),
    }
  }

  /// 仅前向推理，不保留任何梯度所需的中间结果
  pub fn predict(&self, tensor: &NormalizedTensor) -> Result<PredictionResult, ComputeError> {
    let (logits, _) = self.run(tensor, false)?;
    PredictionResult::from_logits(&logits)
  }

  /// 前向推理并返回本次请求独占的捕获结果，可用于反向传播
  pub fn forward(&self, tensor: &NormalizedTensor) -> Result<ForwardPass<'_>, ComputeError> {
    let (logits, tape) = self.run(tensor, true)?;
    Ok(ForwardPass {
      classifier: self,
      logits,
      tape,
    })
  }
}

/// 一次前向计算的捕获：logits 以及观测层之后各层的输入
///
/// `tape[0]` 即观测层输出（激活快照）。
pub struct ForwardPass<'a> {
  classifier: &'a Classifier,
  logits: Vec<f32>,
  tape: Vec<Feature>,
}

impl ForwardPass<'_> {
  pub fn logits(&self) -> &[f32] {
    &self.logits
  }

  pub fn prediction(&self) -> Result<PredictionResult, ComputeError> {
    PredictionResult::from_logits(&self.logits)
  }

  pub fn activations(&self) -> Result<&ActivationSnapshot, ComputeError> {
    match self.tape.first() {
      Some(Feature::Spatial(activations)) => Ok(activations),
      Some(other) => Err(ComputeError::ShapeMismatch {
        layer: self.classifier.observation_layer,
        expected: self.classifier.observation_shape.to_string(),
        found: other.shape().to_string(),
      }),
      None => Err(ComputeError::ShapeMismatch {
        layer: self.classifier.observation_layer,
        expected: self.classifier.observation_shape.to_string(),
        found: "无".to_string(),
      }),
    }
  }

  /// 以目标类别 logit 为起点，反向传播到观测层输出
  pub fn backward(&self, target: usize) -> Result<GradientSnapshot, ComputeError> {
    let num_classes = self.classifier.num_classes;
    if target >= num_classes {
      return Err(ComputeError::InvalidTargetClass {
        target,
        num_classes,
      });
    }

    let mut seed = Array1::<f32>::zeros(num_classes);
    seed[target] = 1.0;
    let mut grad = Feature::Flat(seed);

    let start = self.classifier.observation_layer + 1;
    for (offset, input) in self.tape.iter().enumerate().rev() {
      let index = start + offset;
      grad = self.classifier.layers[index].backward(index, input, grad)?;
    }

    match grad {
      Feature::Spatial(gradients) if gradients.iter().all(|v| v.is_finite()) => Ok(gradients),
      Feature::Spatial(_) => Err(ComputeError::NonFinite("观测层梯度")),
      Feature::Flat(_) => Err(ComputeError::ShapeMismatch {
        layer: self.classifier.observation_layer,
        expected: self.classifier.observation_shape.to_string(),
        found: grad.shape().to_string(),
      }),
    }
  }
}

const CNN_SCHEME: &str = "cnn";

pub struct ClassifierBuilder {
  weights_path: String,
}

impl FromUrl for ClassifierBuilder {
  type Error = ModelUnavailableError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != CNN_SCHEME {
      return Err(ModelUnavailableError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        CNN_SCHEME
      )));
    }

    Ok(ClassifierBuilder {
      weights_path: decode_url_path(url),
    })
  }
}

impl FromUrlWithScheme for ClassifierBuilder {
  const SCHEME: &'static str = CNN_SCHEME;
}

impl ClassifierBuilder {
  pub fn weights_path(&self) -> &str {
    &self.weights_path
  }

  pub fn build(self) -> Result<Classifier, ModelUnavailableError> {
    info!("加载权重文件: {}", self.weights_path);
    let now = std::time::Instant::now();
    let weights = WeightsFile::read(&self.weights_path)?;
    let classifier = Classifier::from_weights(&weights).inspect_err(|e| {
      error!("权重文件无效: {}", e);
    })?;
    info!(
      "模型加载完成: 版本 {}，{} 层，观测层 {}，耗时 {:.2?}",
      classifier.model_version,
      classifier.layers.len(),
      classifier.observation_layer,
      now.elapsed()
    );
    debug!("观测层输出形状: {}", classifier.observation_shape);
    Ok(classifier)
  }
}
