// 该文件是 Jingming （睛明） 项目的一部分。
// src/model.rs - 模型
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

use std::time::Duration;

use ndarray::Array3;
use serde::Serialize;
use thiserror::Error;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

pub const NUM_SEVERITY_CLASSES: usize = 5;

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> &'static str;
  fn to_label_id(&self) -> u32;
  fn from_label_id(id: u32) -> Option<Self>;
}

/// 糖尿病视网膜病变严重程度
///
/// 下标与标签的对应关系属于对外契约，不得改动。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Severity {
  NoDr = 0,
  Mild = 1,
  Moderate = 2,
  Severe = 3,
  Proliferative = 4,
}

impl Severity {
  pub const ALL: [Severity; NUM_SEVERITY_CLASSES] = [
    Severity::NoDr,
    Severity::Mild,
    Severity::Moderate,
    Severity::Severe,
    Severity::Proliferative,
  ];

  pub fn index(self) -> usize {
    self as usize
  }

  pub fn from_index(index: usize) -> Option<Self> {
    Self::ALL.get(index).copied()
  }

  pub fn label(self) -> &'static str {
    match self {
      Severity::NoDr => "No DR",
      Severity::Mild => "Mild",
      Severity::Moderate => "Moderate",
      Severity::Severe => "Severe",
      Severity::Proliferative => "Proliferative DR",
    }
  }
}

impl WithLabel for Severity {
  fn to_label_str(&self) -> &'static str {
    self.label()
  }

  fn to_label_id(&self) -> u32 {
    self.index() as u32
  }

  fn from_label_id(id: u32) -> Option<Self> {
    Self::from_index(id as usize)
  }
}

/// 观测层输出激活 (C × h' × w')，仅在一次前向/反向过程中存在
pub type ActivationSnapshot = Array3<f32>;
/// 目标类别 logit 对观测层激活的梯度，与激活同形
pub type GradientSnapshot = Array3<f32>;

/// 数值计算错误
#[derive(Error, Debug)]
pub enum ComputeError {
  #[error("数值异常（非有限值）: {0}")]
  NonFinite(&'static str),
  #[error("第 {layer} 层形状不匹配: 期望 {expected}, 实际 {found}")]
  ShapeMismatch {
    layer: usize,
    expected: String,
    found: String,
  },
  #[error("目标类别 {target} 超出范围 (共 {num_classes} 类)")]
  InvalidTargetClass { target: usize, num_classes: usize },
  #[error("热力图分辨率 {map_width}x{map_height} 与图像 {image_width}x{image_height} 不一致")]
  ResolutionMismatch {
    image_width: u32,
    image_height: u32,
    map_width: usize,
    map_height: usize,
  },
  #[error("热力图编码失败: {0}")]
  Encode(#[from] image::ImageError),
  #[error("推理超时: {0:?}")]
  Timeout(Duration),
  #[error("推理线程异常: {0}")]
  Worker(String),
}

/// 预测结果：概率分布、最大类别与置信度
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
  probabilities: Box<[f32]>,
  class_index: usize,
  confidence: f32,
}

impl PredictionResult {
  pub fn from_logits(logits: &[f32]) -> Result<Self, ComputeError> {
    if logits.is_empty() {
      return Err(ComputeError::NonFinite("logits 为空"));
    }
    if logits.iter().any(|v| !v.is_finite()) {
      return Err(ComputeError::NonFinite("logits"));
    }
    let probabilities = softmax(logits);
    if probabilities.iter().any(|v| !v.is_finite()) {
      return Err(ComputeError::NonFinite("softmax"));
    }

    let (class_index, confidence) = probabilities
      .iter()
      .copied()
      .enumerate()
      .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

    Ok(Self {
      probabilities: probabilities.into_boxed_slice(),
      class_index,
      confidence,
    })
  }

  pub fn probabilities(&self) -> &[f32] {
    &self.probabilities
  }

  pub fn class_index(&self) -> usize {
    self.class_index
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }

  pub fn severity(&self) -> Option<Severity> {
    Severity::from_index(self.class_index)
  }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
  let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  exps.into_iter().map(|v| v / sum).collect()
}

mod classifier;
mod layer;
mod weights;

pub use self::classifier::{Classifier, ClassifierBuilder, ClassifierMetadata, ForwardPass, ModelUnavailableError};
pub use self::layer::{Feature, FeatureShape, Layer};
pub use self::weights::{LayerSpec, SyntheticArchitecture, WeightsFile, WEIGHTS_FORMAT_VERSION};
