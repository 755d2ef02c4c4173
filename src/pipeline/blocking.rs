// 该文件是 Liushui （流水） 项目的一部分。
// src/pipeline/blocking.rs - 阻塞式流水线
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
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::{
  buffer::{DoubleBuffer, HandoffQueue, ReadGuard},
  device::{Accelerator, TransferError},
  frame::Frame,
  input::FrameSource,
  model::{FeatureMap, ModelConfig},
  pipeline::{
    DecodeSummary, POLL_INTERVAL, PanicGuard, PipelineConfig, PipelineCore, PipelineError,
    Progress, ProgressTracker, RenderSink, RunControl, RunReport,
  },
  ring::ResultRing,
  stream::FeatureStream,
};

/// 每个输出流一个线程做阻塞读，读入双缓冲后由解码线程取走。
///
/// 线程布局：一个输入线程、每个输出流一个读取线程、一个解码线程。
pub struct BlockingPipeline<'d> {
  core: PipelineCore<'d>,
  streams: Vec<FeatureStream<DoubleBuffer>>,
}

impl<'d> BlockingPipeline<'d> {
  pub fn new(
    device: &'d dyn Accelerator,
    model: ModelConfig,
    config: PipelineConfig,
  ) -> Result<Self, PipelineError> {
    let core = PipelineCore::new(device, model, config)?;
    let streams = core
      .order
      .iter()
      .zip(core.sorted_infos())
      .map(|(&device_index, info)| {
        let buffer = DoubleBuffer::new(info.frame_size())?;
        Ok(FeatureStream::new(device_index, info, buffer))
      })
      .collect::<Result<Vec<_>, PipelineError>>()?;
    Ok(Self { core, streams })
  }

  pub fn control(&self) -> Arc<RunControl> {
    self.core.control.clone()
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.core.config
  }

  fn shutdown(&self) {
    self.core.device.abort();
    for stream in self.streams.iter() {
      stream.buffer.close();
    }
  }

  /// 运行到输入耗尽、收到停止请求或出现致命错误
  pub fn run<S: FrameSource>(
    self,
    mut source: S,
    ring: &ResultRing<'_>,
    render: Option<&RenderSink<'_>>,
  ) -> Result<RunReport, PipelineError> {
    self.core.prepare(&mut source)?;
    info!("阻塞式流水线启动, {} 个输出流", self.streams.len());

    let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
    let (frame_tx, frame_rx) = self.core.frame_queue(render.is_some());
    let shutdown = || {
      self.shutdown();
      if let Some(frames) = &frame_rx {
        frames.shutdown_handle().trigger();
      }
    };
    let started = Instant::now();
    self.core.control.start();
    let pipeline = &self;

    let (frames_in, outputs, summary) = thread::scope(|s| {
      let input = {
        let progress = progress_tx.clone();
        let shutdown = &shutdown;
        s.spawn(move || pipeline.core.input_loop(source, progress, frame_tx, shutdown))
      };

      let readers: Vec<_> = self
        .streams
        .iter()
        .enumerate()
        .map(|(index, stream)| {
          let progress = progress_tx.clone();
          let shutdown = &shutdown;
          s.spawn(move || pipeline.read_stream(index, stream, progress, shutdown))
        })
        .collect();

      let decoder = {
        let tracker = ProgressTracker::new(progress_rx, self.streams.len());
        let frames = frame_rx.as_ref();
        let shutdown = &shutdown;
        s.spawn(move || pipeline.decode_loop(tracker, ring, frames, render, shutdown))
      };

      let summary = decoder.join();
      // 正常结束时让阻塞在设备上的线程尽快退出
      self.core.control.finish();
      shutdown();
      let outputs: Vec<_> = readers.into_iter().map(|h| h.join()).collect();
      (input.join(), outputs, summary)
    });

    self.core.conclude(started, frames_in, outputs, summary)
  }

  /// 分片等待输出就绪，每片之间检查运行状态。返回 `false` 表示应退出。
  ///
  /// 超时只从第 `count` 帧已写入设备时起算，输入慢于超时不算传输故障。
  fn wait_output(&self, stream: usize, count: u64) -> Result<bool, TransferError> {
    let timeout = self.core.config.transfer_timeout;
    let mut deadline: Option<Instant> = None;
    loop {
      if deadline.is_none() && self.core.control.submitted() > count {
        deadline = Some(Instant::now() + timeout);
      }
      let slice = match deadline {
        Some(deadline) => POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())),
        None => POLL_INTERVAL,
      };
      match self.core.device.wait_output_ready(stream, slice) {
        Ok(()) => return Ok(true),
        Err(TransferError::Timeout) => {
          if !self.core.control.should_continue(count) {
            return Ok(false);
          }
          if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(TransferError::Timeout);
          }
        }
        Err(e) => return Err(e),
      }
    }
  }

  fn read_stream(
    &self,
    index: usize,
    stream: &FeatureStream<DoubleBuffer>,
    progress: Sender<Progress>,
    shutdown: &(dyn Fn() + Sync),
  ) -> u64 {
    let _guard = PanicGuard(shutdown);
    let stage = format!("输出流 {}", stream.info.name);
    let mut count = 0u64;

    while self.core.control.should_continue(count) {
      match self.wait_output(stream.device_index, count) {
        Ok(true) => {}
        Ok(false) => break,
        Err(e) => {
          self.core.transfer_failed(&stage, count, e, shutdown);
          break;
        }
      }

      let Ok(mut region) = stream.buffer.acquire_writable() else {
        break;
      };
      let status = self.core.device.read_output(
        stream.device_index,
        &mut region,
        self.core.config.transfer_timeout,
      );
      if let Err(e) = status {
        // 未发布的区域随守卫释放
        drop(region);
        self.core.transfer_failed(&stage, count, e, shutdown);
        break;
      }
      region.publish();
      count += 1;
      let _ = progress.send(Progress::Output {
        stream: index,
        count,
      });
    }

    debug!("{} 读取结束, 共 {} 帧", stage, count);
    count
  }

  fn decode_loop(
    &self,
    mut tracker: ProgressTracker,
    ring: &ResultRing<'_>,
    frames: Option<&HandoffQueue<Frame>>,
    render: Option<&RenderSink<'_>>,
    shutdown: &(dyn Fn() + Sync),
  ) -> DecodeSummary {
    let _guard = PanicGuard(shutdown);
    let mut summary = DecodeSummary::default();

    loop {
      tracker.pump();
      if tracker.completed() > summary.decoded {
        match self.decode_one(summary.decoded, ring, frames, render) {
          Ok(Some((detections, elapsed))) => {
            summary.decoded += 1;
            summary.detections += detections as u64;
            summary.decode_time += elapsed;
            continue;
          }
          // 缓冲区已关闭，其他线程出了错
          Ok(None) => break,
          Err(e) => {
            self.core.fail(e, shutdown);
            break;
          }
        }
      }
      if !self.core.control.should_continue(summary.decoded) {
        break;
      }
      tracker.wait(POLL_INTERVAL);
    }

    summary.outputs = tracker.outputs().to_vec();
    debug!("解码结束, 共 {} 帧", summary.decoded);
    summary
  }

  fn decode_one(
    &self,
    frame_index: u64,
    ring: &ResultRing<'_>,
    frames: Option<&HandoffQueue<Frame>>,
    render: Option<&RenderSink<'_>>,
  ) -> Result<Option<(usize, Duration)>, PipelineError> {
    // 所有流都已发布该帧，这里不会长时间阻塞
    let mut guards: Vec<ReadGuard<'_>> = Vec::with_capacity(self.streams.len());
    for stream in self.streams.iter() {
      match stream.buffer.acquire_readable() {
        Ok(guard) => guards.push(guard),
        Err(_) => return Ok(None),
      }
    }

    let started = Instant::now();
    let maps: Vec<FeatureMap<'_>> = guards
      .iter()
      .zip(self.streams.iter())
      .map(|(guard, stream)| FeatureMap::new(guard, &stream.info))
      .collect();
    let result = self.core.decoder.decode(frame_index, &maps)?;
    let elapsed = started.elapsed();
    drop(maps);
    drop(guards);

    self.core.publish(ring, frames, render, &result)?;
    Ok(Some((result.len(), elapsed)))
  }
}
