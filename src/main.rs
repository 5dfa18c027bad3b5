// 该文件是 Jingming （睛明） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use jingming::{
  FromUrl,
  frame::RawImage,
  input::InputWrapper,
  model::{ClassifierBuilder, Model},
  output::OutputWrapper,
  pipeline::{Pipeline, PipelineError, PipelineResult},
  task::{ContinuousTask, OneShotTask, Task},
};

fn run<M>(input: InputWrapper, model: M, output: OutputWrapper, max_frames: Option<usize>) -> Result<()>
where
  M: Model<Input = RawImage, Output = PipelineResult, Error = PipelineError>,
{
  if matches!(input, InputWrapper::ReadDirectory(_)) {
    ContinuousTask::default()
      .with_frame_number(max_frames)
      .with_interrupt_handler(true)
      .run_task(input, model, output)
  } else {
    OneShotTask.run_task(input, model, output)
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("权重文件: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = args.pipeline_config()?;
  let classifier = ClassifierBuilder::from_url(&args.model)?.build()?;
  if args.show_metadata {
    println!("{}", serde_json::to_string_pretty(&classifier.metadata())?);
  }

  let pipeline = Pipeline::new(Arc::new(classifier), &config)?;
  let input = InputWrapper::from_url(&args.input)?.with_max_bytes(config.preprocess.max_image_bytes);
  let output = OutputWrapper::from_url(&args.output)?.with_jpeg_quality(config.render.jpeg_quality);

  match args.target_class {
    Some(target) => {
      info!("解释指定类别: {}", target);
      run(input, pipeline.targeted(target), output, args.max_frames)
    }
    None => run(input, pipeline, output, args.max_frames),
  }
}
