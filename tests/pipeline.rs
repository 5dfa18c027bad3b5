// 该文件是 Jingming （睛明） 项目的一部分。
// tests/pipeline.rs - 流水线端到端测试
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

use std::{io::Cursor, sync::Arc, thread, time::Duration};

use image::{ImageFormat, Rgb, RgbImage};
use url::Url;

use jingming::{
  FromUrl,
  config::PipelineConfig,
  frame::RawImage,
  input::InputWrapper,
  model::{
    Classifier, ClassifierBuilder, ComputeError, NUM_SEVERITY_CLASSES, SyntheticArchitecture,
  },
  pipeline::{Pipeline, PipelineError},
  preprocess::ValidationError,
};

fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
  let mut buf = Cursor::new(Vec::new());
  image.write_to(&mut buf, format).unwrap();
  buf.into_inner()
}

fn raw(image: &RgbImage, format: ImageFormat) -> RawImage {
  RawImage::new(encode(image, format), format.to_mime_type())
}

fn fundus(width: u32, height: u32) -> RgbImage {
  RgbImage::from_fn(width, height, |x, y| {
    let dx = x as f32 / width as f32 - 0.5;
    let dy = y as f32 / height as f32 - 0.5;
    let r = (dx * dx + dy * dy).sqrt();
    let lesion = if (x / 9 + y / 7) % 11 == 0 { 60.0 } else { 0.0 };
    let v = (220.0 * (1.0 - 1.6 * r) + lesion).clamp(0.0, 255.0);
    Rgb([v as u8, (v * 0.45) as u8, (v * 0.2) as u8])
  })
}

fn classifier(widths: Vec<usize>) -> Arc<Classifier> {
  let weights = SyntheticArchitecture {
    widths,
    ..SyntheticArchitecture::default()
  }
  .synthesize();
  Arc::new(Classifier::from_weights(&weights).unwrap())
}

fn pipeline(widths: Vec<usize>) -> Pipeline {
  Pipeline::new(classifier(widths), &PipelineConfig::default())
    .unwrap()
    .with_timeout(None)
}

#[test]
fn test_uniform_gray_end_to_end() {
  let pipeline = pipeline(SyntheticArchitecture::default().widths);
  let gray = RgbImage::from_pixel(224, 224, Rgb([128, 128, 128]));
  let result = pipeline.run_inference(&raw(&gray, ImageFormat::Png)).unwrap();

  assert!(result.severity_class_index < NUM_SEVERITY_CLASSES);
  assert!((0.0..=1.0).contains(&result.confidence));
  let sum: f32 = result.probabilities.iter().sum();
  assert!((sum - 1.0).abs() < 1e-4);
  assert_eq!(
    result.confidence,
    result.probabilities[result.severity_class_index]
  );

  let heatmap = image::load_from_memory(&result.heatmap_image_bytes).unwrap();
  assert_eq!((heatmap.width(), heatmap.height()), (224, 224));
}

#[test]
fn test_identical_input_is_idempotent() {
  let pipeline = pipeline(vec![8, 16, 16, 16]);
  let input = raw(&fundus(300, 260), ImageFormat::Jpeg);
  let first = pipeline.run_inference(&input).unwrap();
  let second = pipeline.run_inference(&input).unwrap();
  assert_eq!(first.severity_class_index, second.severity_class_index);
  for (a, b) in first.probabilities.iter().zip(second.probabilities.iter()) {
    assert_eq!(a.to_bits(), b.to_bits());
  }
  assert_eq!(first.heatmap_image_bytes, second.heatmap_image_bytes);
}

#[test]
fn test_heatmap_resolution_for_any_input_size() {
  let pipeline = pipeline(vec![4, 8, 8, 8]);
  for (width, height, format) in [
    (100, 80, ImageFormat::Png),
    (224, 224, ImageFormat::Jpeg),
    (640, 480, ImageFormat::Jpeg),
    (97, 301, ImageFormat::Png),
  ] {
    let result = pipeline
      .run_inference(&raw(&fundus(width, height), format))
      .unwrap();
    let heatmap = image::load_from_memory(&result.heatmap_image_bytes).unwrap();
    assert_eq!(
      (heatmap.width(), heatmap.height()),
      (224, 224),
      "{}x{}",
      width,
      height
    );
  }
}

#[test]
fn test_rejected_input_runs_no_forward_pass() {
  let pipeline = pipeline(vec![4, 8, 8, 8]);

  let tiny = RawImage::new(vec![0xffu8, 0xd8, 0xff], "image/jpeg");
  assert!(matches!(
    pipeline.run_inference(&tiny),
    Err(PipelineError::Validation(ValidationError::TooSmall { .. }))
  ));

  let gif = RawImage::new(encode(&fundus(64, 64), ImageFormat::Png), "image/gif");
  assert!(matches!(
    pipeline.run_inference(&gif),
    Err(PipelineError::Validation(ValidationError::UnsupportedFormat(_)))
  ));

  assert_eq!(pipeline.classifier().forward_passes(), 0);
}

#[test]
fn test_oversized_file_is_rejected_before_inference() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("fundus.png");
  std::fs::write(&path, encode(&fundus(256, 256), ImageFormat::Png)).unwrap();
  let file_len = std::fs::metadata(&path).unwrap().len() as usize;
  let max_bytes = file_len / 2;

  let mut config = PipelineConfig::default();
  config.preprocess.max_image_bytes = max_bytes;
  let pipeline = Pipeline::new(classifier(vec![4, 8, 8, 8]), &config)
    .unwrap()
    .with_timeout(None);

  let url = Url::parse(&format!("image://{}", path.display())).unwrap();
  let mut input = InputWrapper::from_url(&url).unwrap().with_max_bytes(max_bytes);
  let raw = input.next().unwrap();
  assert_eq!(raw.len(), max_bytes + 1);
  assert!(matches!(
    pipeline.run_inference(&raw),
    Err(PipelineError::Validation(ValidationError::TooLarge { .. }))
  ));
  assert_eq!(pipeline.classifier().forward_passes(), 0);
}

#[test]
fn test_counterfactual_target_keeps_prediction() {
  let pipeline = pipeline(vec![8, 16, 16, 16]);
  let input = raw(&fundus(256, 256), ImageFormat::Png);
  let baseline = pipeline.run_inference(&input).unwrap();
  for target in 0..NUM_SEVERITY_CLASSES {
    let result = pipeline.run_inference_for_class(&input, target).unwrap();
    assert_eq!(result.explained_class, target);
    assert_eq!(result.severity_class_index, baseline.severity_class_index);
    assert_eq!(result.probabilities, baseline.probabilities);
  }
  assert!(matches!(
    pipeline.run_inference_for_class(&input, NUM_SEVERITY_CLASSES),
    Err(PipelineError::Compute(ComputeError::InvalidTargetClass { .. }))
  ));
}

#[test]
fn test_weights_file_round_trip_through_url() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("weights.json");
  let arch = SyntheticArchitecture {
    widths: vec![4, 8, 8, 8],
    ..SyntheticArchitecture::default()
  };
  arch.synthesize().write(&path).unwrap();

  let url = Url::parse(&format!("cnn://{}", path.display())).unwrap();
  let loaded = Arc::new(ClassifierBuilder::from_url(&url).unwrap().build().unwrap());
  let from_file = Pipeline::new(loaded, &PipelineConfig::default())
    .unwrap()
    .with_timeout(None);
  let in_memory = pipeline(arch.widths.clone());

  let input = raw(&fundus(200, 200), ImageFormat::Png);
  assert_eq!(
    from_file.run_inference(&input).unwrap(),
    in_memory.run_inference(&input).unwrap()
  );
}

#[test]
fn test_concurrent_requests_match_sequential_baselines() {
  let pipeline = pipeline(vec![8, 16, 16, 16]);
  let inputs: Vec<RawImage> = (0..4)
    .map(|i| raw(&fundus(180 + 40 * i, 200), ImageFormat::Png))
    .collect();
  let baselines: Vec<_> = inputs
    .iter()
    .map(|input| pipeline.run_inference(input).unwrap())
    .collect();

  let concurrent: Vec<_> = thread::scope(|scope| {
    let handles: Vec<_> = inputs
      .iter()
      .map(|input| scope.spawn(|| pipeline.run_inference(input).unwrap()))
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  assert_eq!(concurrent, baselines);
  assert_eq!(pipeline.classifier().forward_passes(), 8);
}

#[test]
fn test_single_cell_observation_layer_renders_full_heatmap() {
  let weights = SyntheticArchitecture {
    widths: vec![4; 5],
    input_size: 32,
    ..SyntheticArchitecture::default()
  }
  .synthesize();
  let classifier = Arc::new(Classifier::from_weights(&weights).unwrap());
  assert_eq!(classifier.metadata().observation_shape, "4x1x1");

  let mut config = PipelineConfig::default();
  config.preprocess.input_width = 32;
  config.preprocess.input_height = 32;
  let pipeline = Pipeline::new(classifier, &config)
    .unwrap()
    .with_timeout(None);

  let result = pipeline
    .run_inference(&raw(&fundus(120, 100), ImageFormat::Png))
    .unwrap();
  assert!(result.severity_class_index < NUM_SEVERITY_CLASSES);
  let heatmap = image::load_from_memory(&result.heatmap_image_bytes).unwrap();
  assert_eq!((heatmap.width(), heatmap.height()), (32, 32));
}

#[test]
fn test_timeout_is_reported_as_compute_error() {
  let pipeline = pipeline(vec![8, 16, 16, 16]).with_timeout(Some(Duration::from_nanos(1)));
  let input = raw(&fundus(224, 224), ImageFormat::Png);
  assert!(matches!(
    pipeline.run_inference(&input),
    Err(PipelineError::Compute(ComputeError::Timeout(_)))
  ));
}
