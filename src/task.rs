// 该文件是 Liushui （流水） 项目的一部分。
// src/task.rs - 流水线任务
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
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
  device::Accelerator,
  frame::Frame,
  input::FrameSource,
  model::{Architecture, DetectResult, ModelConfig},
  output::{OutputError, Render},
  pipeline::{
    BlockingPipeline, CallbackPipeline, PipelineConfig, RenderSink, RunControl, RunReport,
  },
  ring::ResultRing,
};

const CONSUMER_POLL: Duration = Duration::from_millis(5);

pub trait Task<I, O>: Sized {
  type Error;
  fn run_task(
    self,
    input: I,
    device: &dyn Accelerator,
    output: Option<O>,
  ) -> Result<RunReport, Self::Error>;
}

/// 两种流水线共用的任务参数
#[derive(Debug, Clone)]
pub struct TaskOptions {
  pub architecture: Architecture,
  pub config: PipelineConfig,
  /// 收到 Ctrl-C 时停止输入并排空
  pub handle_interrupt: bool,
}

impl TaskOptions {
  pub fn new(architecture: Architecture, config: PipelineConfig) -> Self {
    Self {
      architecture,
      config,
      handle_interrupt: false,
    }
  }

  pub fn with_interrupt(mut self, handle_interrupt: bool) -> Self {
    self.handle_interrupt = handle_interrupt;
    self
  }

  fn model(&self, device: &dyn Accelerator) -> ModelConfig {
    ModelConfig::coco(self.architecture, device.input_info().shape)
  }
}

fn install_interrupt(control: &Arc<RunControl>) {
  let control = control.clone();
  let result = ctrlc::set_handler(move || {
    info!("收到中断信号，停止输入并处理剩余帧...");
    control.request_stop();
  });
  if let Err(e) = result {
    warn!("无法设置 Ctrl-C 处理: {}", e);
  }
}

/// 结果环的消费者：按帧序轮询槽位，读完即确认
fn consume_ring(ring: &ResultRing<'_>, done: &AtomicBool) -> u64 {
  let mut next = 0u64;
  let mut consumed = 0u64;
  loop {
    let slot = ring.slot_for(next);
    match ring.take(slot) {
      Some(detections) => {
        debug!("帧 {} (槽位 {}): {} 个目标", next, slot, detections.len());
        for detection in detections.iter() {
          debug!(
            "  {} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
            detection.label().unwrap_or("?"),
            detection.confidence,
            detection.ymin,
            detection.xmin,
            detection.ymax,
            detection.xmax
          );
        }
        next += 1;
        consumed += 1;
      }
      None if done.load(Ordering::Acquire) => {
        // 结束标志之前发布的结果此时都可见，再确认一次
        if ring.poll(slot).is_none() {
          break;
        }
      }
      None => thread::sleep(CONSUMER_POLL),
    }
  }
  consumed
}

/// 在独立线程中消费结果环，同时执行 `run`
fn with_ring_consumer<F>(ring: &ResultRing<'_>, run: F) -> anyhow::Result<RunReport>
where
  F: FnOnce() -> anyhow::Result<RunReport>,
{
  let done = AtomicBool::new(false);
  thread::scope(|s| {
    let consumer = s.spawn(|| consume_ring(ring, &done));
    let report = run();
    done.store(true, Ordering::Release);
    let consumed = consumer
      .join()
      .map_err(|_| anyhow::anyhow!("结果消费线程异常退出"))?;
    info!("结果环共消费 {} 帧", consumed);
    report
  })
}

pub struct BlockingTask(pub TaskOptions);

impl<I, O> Task<I, O> for BlockingTask
where
  I: FrameSource,
  O: Render<Frame, DetectResult, Error = OutputError> + Sync,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    device: &dyn Accelerator,
    output: Option<O>,
  ) -> Result<RunReport, Self::Error> {
    let options = self.0;
    info!("开始阻塞式流水线任务...");
    let ring = options.config.result_ring()?;
    let pipeline = BlockingPipeline::new(device, options.model(device), options.config.clone())?;
    if options.handle_interrupt {
      install_interrupt(&pipeline.control());
    }
    let render = output.as_ref().map(|o| o as &RenderSink<'_>);
    let report = with_ring_consumer(&ring, || Ok(pipeline.run(input, &ring, render)?))?;
    info!("任务完成，退出");
    Ok(report)
  }
}

pub struct CallbackTask(pub TaskOptions);

impl<I, O> Task<I, O> for CallbackTask
where
  I: FrameSource,
  O: Render<Frame, DetectResult, Error = OutputError> + Sync,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    device: &dyn Accelerator,
    output: Option<O>,
  ) -> Result<RunReport, Self::Error> {
    let options = self.0;
    info!("开始回调式流水线任务...");
    let ring = options.config.result_ring()?;
    let pipeline = CallbackPipeline::new(device, options.model(device), options.config.clone())?;
    if options.handle_interrupt {
      install_interrupt(&pipeline.control());
    }
    let render = output.as_ref().map(|o| o as &RenderSink<'_>);
    let report = with_ring_consumer(&ring, || Ok(pipeline.run(input, &ring, render)?))?;
    info!("任务完成，退出");
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{model::Detection, ring::OverwritePolicy};

  #[test]
  fn consumer_acknowledges_in_frame_order() {
    let ring = ResultRing::new(2, 4, OverwritePolicy::Reject).unwrap();
    let done = AtomicBool::new(false);
    let detection = Detection {
      ymin: 0.0,
      xmin: 0.0,
      ymax: 1.0,
      xmax: 1.0,
      confidence: 0.5,
      class_id: 0,
    };
    let consumed = thread::scope(|s| {
      let consumer = s.spawn(|| consume_ring(&ring, &done));
      // Reject 策略下只有消费者确认后才能写入同一槽位
      for frame in 0..6u64 {
        while ring.publish(frame, &[detection]).is_err() {
          thread::sleep(Duration::from_millis(1));
        }
      }
      while ring.poll(ring.slot_for(5)).is_some() {
        thread::sleep(Duration::from_millis(1));
      }
      done.store(true, Ordering::Release);
      consumer.join().unwrap()
    });
    assert_eq!(consumed, 6);
  }
}
