// 该文件是 Jingming （睛明） 项目的一部分。
// src/task.rs - 任务调度
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
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::{model::Model, output::Render};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 处理第一张图像后退出
pub struct OneShotTask;

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像获取成功，开始推理...");
    let now = Instant::now();
    let result = model.infer(&frame)?;
    let inferred = now.elapsed();
    info!("推理完成，耗时: {:.2?}", inferred);
    output.render_result(&frame, &result)?;
    info!("输出完成，耗时: {:.2?}", now.elapsed() - inferred);

    Ok(())
  }
}

/// 对同一张图像重复推理，统计平均耗时
pub struct RepeatShotTask {
  times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { times: 100 }
  }
}

impl RepeatShotTask {
  /// 前两次视为预热，不计入平均
  const WARMUP: usize = 2;

  pub fn new(times: usize) -> Self {
    Self {
      times: times.max(1),
    }
  }

  pub fn times(&self) -> usize {
    self.times
  }
}

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像获取成功，开始推理 {} 次...", self.times);
    let mut times = Vec::with_capacity(self.times);
    for i in 0..self.times {
      let now = Instant::now();
      let result = model.infer(&frame)?;
      let elapsed = now.elapsed();
      info!("({})推理完成，耗时: {:.2?}", i, elapsed);
      output.render_result(&frame, &result)?;
      times.push(elapsed);
    }

    let skip = if times.len() > Self::WARMUP {
      Self::WARMUP
    } else {
      0
    };
    let counted = &times[skip..];
    warn!(
      "平均推理时间: {:.2?} ({} 次)",
      counted.iter().sum::<Duration>() / counted.len().max(1) as u32,
      counted.len()
    );

    Ok(())
  }
}

/// 连续处理输入中的所有图像，单张失败时记录并继续
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  interrupt_handler: bool,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 安装 Ctrl-C 处理器，收到信号后处理完当前图像即退出
  pub fn with_interrupt_handler(mut self, enable: bool) -> Self {
    self.interrupt_handler = enable;
    self
  }
}

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel();

    if self.interrupt_handler {
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        let _ = tx.send(());
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })?;
    }

    let mut frame_index = 0usize;
    let mut failures = 0usize;
    for frame in input {
      frame_index += 1;
      info!("处理第 {} 张图像", frame_index);
      let now = Instant::now();
      match model.infer(&frame) {
        Ok(result) => {
          let inferred = now.elapsed();
          if let Err(e) = output.render_result(&frame, &result) {
            failures += 1;
            error!("第 {} 张图像输出失败: {}", frame_index, e);
          }
          info!("推理完成，耗时: {:.2?} / {:.2?}", inferred, now.elapsed());
        }
        Err(e) => {
          failures += 1;
          error!("第 {} 张图像推理失败: {}", frame_index, e);
        }
      }

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定图像数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!(
      "任务完成，共处理 {} 张图像，失败 {} 张",
      frame_index, failures
    );
    Ok(())
  }
}
