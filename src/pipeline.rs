// 该文件是 Jingming （睛明） 项目的一部分。
// src/pipeline.rs - 推理流水线
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
  sync::{
    Arc, mpsc,
    atomic::{AtomicU8, AtomicUsize, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{ConfigError, PipelineConfig},
  explain::explain,
  frame::RawImage,
  model::{
    Classifier, ComputeError, Model, ModelUnavailableError, NUM_SEVERITY_CLASSES, Severity,
  },
  output::OverlayRenderer,
  preprocess::{Preprocessor, ValidationError},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入校验失败: {0}")]
  Validation(#[from] ValidationError),
  #[error("模型不可用: {0}")]
  ModelUnavailable(#[from] ModelUnavailableError),
  #[error("计算失败: {0}")]
  Compute(#[from] ComputeError),
  #[error("配置无效: {0}")]
  Config(#[from] ConfigError),
}

/// 超时后仍在后台运行的推理线程数上限，达到后拒绝新的请求
pub const MAX_DETACHED_WORKERS: usize = 4;

const WORKER_RUNNING: u8 = 0;
const WORKER_DONE: u8 = 1;
const WORKER_ABANDONED: u8 = 2;

/// 单次推理的输出
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
  pub severity_class_index: usize,
  pub severity_label: &'static str,
  pub confidence: f32,
  pub probabilities: [f32; NUM_SEVERITY_CLASSES],
  /// 注意力图所解释的类别，默认等于预测类别
  pub explained_class: usize,
  pub heatmap_mime: &'static str,
  #[serde(skip)]
  pub heatmap_image_bytes: Vec<u8>,
}

impl PipelineResult {
  pub fn severity(&self) -> Option<Severity> {
    Severity::from_index(self.severity_class_index)
  }
}

/// 预处理 → 推理 → Grad-CAM → 叠加渲染
///
/// 分类器以 `Arc` 共享，克隆流水线不会复制权重。
#[derive(Debug, Clone)]
pub struct Pipeline {
  classifier: Arc<Classifier>,
  preprocessor: Preprocessor,
  renderer: OverlayRenderer,
  timeout: Option<Duration>,
  detached_workers: Arc<AtomicUsize>,
}

impl Pipeline {
  pub fn new(classifier: Arc<Classifier>, config: &PipelineConfig) -> Result<Self, PipelineError> {
    config.validate()?;
    let preprocessor = Preprocessor::new(config.preprocess.clone());
    if preprocessor.output_size() != classifier.input_size() {
      return Err(PipelineError::ModelUnavailable(
        ModelUnavailableError::InvalidArchitecture(format!(
          "模型输入尺寸 {:?} 与预处理尺寸 {:?} 不一致",
          classifier.input_size(),
          preprocessor.output_size()
        )),
      ));
    }

    Ok(Self {
      classifier,
      preprocessor,
      renderer: OverlayRenderer::new(config.render.clone()),
      timeout: config.timeout(),
      detached_workers: Arc::new(AtomicUsize::new(0)),
    })
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn classifier(&self) -> &Arc<Classifier> {
    &self.classifier
  }

  pub fn preprocessor(&self) -> &Preprocessor {
    &self.preprocessor
  }

  pub fn renderer(&self) -> &OverlayRenderer {
    &self.renderer
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  /// 已超时但尚未结束的推理线程数，克隆的流水线共享该计数
  pub fn detached_workers(&self) -> usize {
    self.detached_workers.load(Ordering::Acquire)
  }

  /// 预测并解释预测类别
  pub fn run_inference(&self, raw: &RawImage) -> Result<PipelineResult, PipelineError> {
    self.run(raw, None)
  }

  /// 预测，并解释指定类别（反事实解释）
  pub fn run_inference_for_class(
    &self,
    raw: &RawImage,
    target_class: usize,
  ) -> Result<PipelineResult, PipelineError> {
    self.run(raw, Some(target_class))
  }

  /// 固定解释类别的模型视图
  pub fn targeted(&self, target_class: usize) -> Targeted<'_> {
    Targeted {
      pipeline: self,
      target_class,
    }
  }

  fn run(&self, raw: &RawImage, target: Option<usize>) -> Result<PipelineResult, PipelineError> {
    let Some(timeout) = self.timeout else {
      return self.run_blocking(raw, target);
    };

    let detached = self.detached_workers();
    if detached >= MAX_DETACHED_WORKERS {
      warn!("{} 个超时的推理线程仍在运行，拒绝新请求", detached);
      return Err(
        ComputeError::Worker(format!("{} 个超时的推理线程仍在运行", detached)).into(),
      );
    }

    let (tx, rx) = mpsc::channel();
    let state = Arc::new(AtomicU8::new(WORKER_RUNNING));
    let worker_state = state.clone();
    let detached_workers = self.detached_workers.clone();
    let pipeline = self.clone();
    let raw = raw.clone();
    thread::Builder::new()
      .name("jingming-inference".to_string())
      .spawn(move || {
        let _ = tx.send(pipeline.run_blocking(&raw, target));
        if worker_state.swap(WORKER_DONE, Ordering::AcqRel) == WORKER_ABANDONED {
          let remaining = detached_workers.fetch_sub(1, Ordering::AcqRel) - 1;
          debug!("超时的推理线程已结束，剩余 {}", remaining);
        }
      })
      .map_err(|e| ComputeError::Worker(e.to_string()))?;

    match rx.recv_timeout(timeout) {
      Ok(result) => result,
      Err(mpsc::RecvTimeoutError::Timeout) => {
        // 先计数再标记，保证线程结束时的减一不会早于加一
        let detached = self.detached_workers.fetch_add(1, Ordering::AcqRel) + 1;
        if state.swap(WORKER_ABANDONED, Ordering::AcqRel) != WORKER_RUNNING {
          self.detached_workers.fetch_sub(1, Ordering::AcqRel);
          if let Ok(result) = rx.try_recv() {
            return result;
          }
        } else {
          warn!("推理超时: {:?}，后台仍有 {} 个推理线程", timeout, detached);
        }
        Err(ComputeError::Timeout(timeout).into())
      }
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        Err(ComputeError::Worker("推理线程意外退出".to_string()).into())
      }
    }
  }

  fn run_blocking(&self, raw: &RawImage, target: Option<usize>) -> Result<PipelineResult, PipelineError> {
    let now = Instant::now();
    let tensor = self.preprocessor.preprocess(raw)?;
    let preprocessed = now.elapsed();

    let explanation = explain(&self.classifier, &tensor, target)?;
    let explained = now.elapsed();

    let base = tensor.denormalize();
    let heatmap_image_bytes = self.renderer.render(&base, &explanation.map)?;
    let rendered = now.elapsed();
    debug!(
      "预处理 {:.2?} / 推理与解释 {:.2?} / 渲染 {:.2?}",
      preprocessed, explained, rendered
    );

    let prediction = explanation.prediction;
    let severity = prediction
      .severity()
      .ok_or(ComputeError::InvalidTargetClass {
        target: prediction.class_index(),
        num_classes: NUM_SEVERITY_CLASSES,
      })?;
    let probabilities: [f32; NUM_SEVERITY_CLASSES] = prediction
      .probabilities()
      .try_into()
      .map_err(|_| ComputeError::ShapeMismatch {
        layer: self.classifier.observation_layer(),
        expected: format!("{} 个类别", NUM_SEVERITY_CLASSES),
        found: format!("{} 个类别", prediction.probabilities().len()),
      })?;

    info!(
      "预测结果: {} ({:.4})，解释类别 {}，耗时 {:.2?}",
      severity.label(),
      prediction.confidence(),
      explanation.target_class,
      rendered
    );

    Ok(PipelineResult {
      severity_class_index: severity.index(),
      severity_label: severity.label(),
      confidence: prediction.confidence(),
      probabilities,
      explained_class: explanation.target_class,
      heatmap_mime: self.renderer.format().mime_type(),
      heatmap_image_bytes,
    })
  }
}

impl Model for Pipeline {
  type Input = RawImage;
  type Output = PipelineResult;
  type Error = PipelineError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.run_inference(input)
  }
}

/// 总是解释同一类别的流水线视图
pub struct Targeted<'a> {
  pipeline: &'a Pipeline,
  target_class: usize,
}

impl Model for Targeted<'_> {
  type Input = RawImage;
  type Output = PipelineResult;
  type Error = PipelineError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self
      .pipeline
      .run_inference_for_class(input, self.target_class)
  }
}
