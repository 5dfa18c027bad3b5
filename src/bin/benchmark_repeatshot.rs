// 该文件是 Jingming （睛明） 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复推理基准
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

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use jingming::{
  FromUrl,
  config::PipelineConfig,
  input::InputWrapper,
  model::ClassifierBuilder,
  output::OutputWrapper,
  pipeline::Pipeline,
  task::{RepeatShotTask, Task},
};

/// 对同一张图像重复执行完整流水线并统计耗时
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 权重文件
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 重复次数
  #[arg(long, default_value = "100", value_name = "TIMES")]
  pub times: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("权重文件: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let classifier = ClassifierBuilder::from_url(&args.model)?.build()?;
  // 基准测试不设超时，避免额外的线程开销
  let pipeline = Pipeline::new(Arc::new(classifier), &PipelineConfig::default())?.with_timeout(None);
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  RepeatShotTask::new(args.times).run_task(input, pipeline, output)?;

  Ok(())
}
