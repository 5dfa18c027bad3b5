// 该文件是 Jingming （睛明） 项目的一部分。
// src/bin/synthesize_weights.rs - 生成未训练的确定性权重文件
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use jingming::model::{Classifier, SyntheticArchitecture};

/// 生成可用于冒烟测试的权重文件（未经训练，预测无医学意义）
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输出文件路径
  #[arg(long, value_name = "FILE")]
  pub output: PathBuf,
  /// 随机种子
  #[arg(long, default_value = "1592598101", value_name = "SEED")]
  pub seed: u64,
  /// 各卷积块的通道数，逗号分隔
  #[arg(long, value_delimiter = ',', default_value = "16,32,64,64", value_name = "WIDTHS")]
  pub widths: Vec<usize>,
  /// 输入边长
  #[arg(long, default_value = "224", value_name = "SIZE")]
  pub input_size: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  if args.widths.is_empty() || args.widths.contains(&0) {
    anyhow::bail!("通道数必须为正: {:?}", args.widths);
  }

  let arch = SyntheticArchitecture {
    widths: args.widths,
    input_size: args.input_size,
    seed: args.seed,
    ..SyntheticArchitecture::default()
  };
  let weights = arch.synthesize();
  // 写出前先确认能被加载
  let classifier = Classifier::from_weights(&weights)?;
  info!(
    "网络结构: {}",
    classifier.metadata().architecture.join(" -> ")
  );
  weights.write(&args.output)?;
  info!(
    "观测层 {}，权重版本 {}",
    weights.observation_layer, weights.model_version
  );

  Ok(())
}
