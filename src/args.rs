// 该文件是 Jingming （睛明） 项目的一部分。
// src/args.rs - 项目参数配置
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

use clap::Parser;
use url::Url;

use jingming::config::{HeatmapFormat, PipelineConfig};

/// Jingming 眼底图像分级与解释
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 权重文件，例如 cnn:///models/weights.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 输入来源
  /// - 单张图像: image:///path/to/fundus.jpg
  /// - 目录: folder:///path/to/images
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出位置
  /// - 单个文件: image:///path/to/heatmap.jpg[?legend]
  /// - 按日期归档: folder:///path/to/records[?legend]
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 解释指定类别而不是预测类别 (0-4)
  #[arg(long, value_name = "CLASS")]
  pub target_class: Option<usize>,

  /// 热力图混合系数 (0.0 - 1.0)
  #[arg(long, value_name = "ALPHA")]
  pub blend_alpha: Option<f32>,

  /// 以 PNG 而不是 JPEG 编码热力图
  #[arg(long)]
  pub png: bool,

  /// 单次推理超时（毫秒，0 表示不限制）
  #[arg(long, value_name = "MILLIS")]
  pub timeout_ms: Option<u64>,

  /// 最多处理的图像数（仅对目录输入有效）
  #[arg(long, value_name = "COUNT")]
  pub max_frames: Option<usize>,

  /// 打印模型元信息
  #[arg(long)]
  pub show_metadata: bool,
}

impl Args {
  /// 读取配置文件并应用命令行覆盖
  pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
    let mut config = match &self.config {
      Some(path) => PipelineConfig::from_json_file(path)?,
      None => PipelineConfig::default(),
    };
    if let Some(alpha) = self.blend_alpha {
      config.render.blend_alpha = alpha;
    }
    if self.png {
      config.render.format = HeatmapFormat::Png;
    }
    if let Some(timeout_ms) = self.timeout_ms {
      config.timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
  }
}
