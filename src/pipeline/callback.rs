// 该文件是 Liushui （流水） 项目的一部分。
// src/pipeline/callback.rs - 回调式流水线
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

use tracing::{debug, error, info};

use crate::{
  buffer::{AlignedBuffer, BufferPool, HandoffQueue, HandoffSender, Popped, PushError},
  device::{Accelerator, CompletionSink, TransferError, TransferStatus},
  frame::Frame,
  input::FrameSource,
  model::{FeatureMap, ModelConfig},
  pipeline::{
    DecodeSummary, POLL_INTERVAL, PanicGuard, PipelineConfig, PipelineCore, PipelineError,
    ProgressTracker, RenderSink, RunControl, RunReport,
  },
  ring::ResultRing,
  stream::FeatureStream,
};

/// 一次异步读的结果
pub struct Completion {
  pub status: TransferStatus,
  pub buffer: AlignedBuffer,
}

/// 设备完成上下文中只做入队，不阻塞
#[derive(Clone)]
struct QueueSink {
  stream: usize,
  tx: HandoffSender<Completion>,
}

impl CompletionSink for QueueSink {
  fn on_complete(self: Box<Self>, status: TransferStatus, buffer: AlignedBuffer) {
    match self.tx.push(Completion { status, buffer }) {
      Ok(()) => {}
      // 在途请求数受缓冲池容量限制，队列不应满
      Err(PushError::Full(_)) => error!("输出流 {} 的完成队列已满, 丢弃结果", self.stream),
      Err(PushError::Closed(_)) => debug!("输出流 {} 的完成队列已关闭", self.stream),
    }
  }
}

/// 回调式流水线中每个输出流的缓冲结构
pub struct CompletionLane {
  pool: BufferPool,
  sender: HandoffSender<Completion>,
  queue: HandoffQueue<Completion>,
}

impl CompletionLane {
  fn new(frame_size: usize, depth: usize) -> Result<Self, PipelineError> {
    let pool = BufferPool::new(frame_size, depth)?;
    let (sender, queue) = HandoffQueue::with_capacity(depth);
    Ok(Self {
      pool,
      sender,
      queue,
    })
  }

  fn close(&self) {
    self.pool.close();
    self.queue.shutdown_handle().trigger();
  }
}

/// 每个输出流一个线程提交异步读，设备在完成时回调入队，解码线程按帧收齐后解码。
pub struct CallbackPipeline<'d> {
  core: PipelineCore<'d>,
  streams: Vec<FeatureStream<CompletionLane>>,
}

impl<'d> CallbackPipeline<'d> {
  pub fn new(
    device: &'d dyn Accelerator,
    model: ModelConfig,
    config: PipelineConfig,
  ) -> Result<Self, PipelineError> {
    let core = PipelineCore::new(device, model, config)?;
    let depth = core.config.queue_depth;
    let streams = core
      .order
      .iter()
      .zip(core.sorted_infos())
      .map(|(&device_index, info)| {
        let lane = CompletionLane::new(info.frame_size(), depth)?;
        Ok(FeatureStream::new(device_index, info, lane))
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
    // 先中止设备，让在途请求带着缓冲区回调
    self.core.device.abort();
    for stream in self.streams.iter() {
      stream.buffer.close();
    }
  }

  pub fn run<S: FrameSource>(
    self,
    mut source: S,
    ring: &ResultRing<'_>,
    render: Option<&RenderSink<'_>>,
  ) -> Result<RunReport, PipelineError> {
    self.core.prepare(&mut source)?;
    info!(
      "回调式流水线启动, {} 个输出流, 每流 {} 个在途读",
      self.streams.len(),
      self.core.config.queue_depth
    );

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

      let submitters: Vec<_> = self
        .streams
        .iter()
        .enumerate()
        .map(|(index, stream)| {
          let shutdown = &shutdown;
          s.spawn(move || pipeline.submit_reads(index, stream, shutdown))
        })
        .collect();

      let decoder = {
        let tracker = ProgressTracker::new(progress_rx, self.streams.len());
        let frames = frame_rx.as_ref();
        let shutdown = &shutdown;
        s.spawn(move || pipeline.decode_loop(tracker, ring, frames, render, shutdown))
      };

      let summary = decoder.join();
      self.core.control.finish();
      shutdown();
      let outputs: Vec<_> = submitters.into_iter().map(|h| h.join()).collect();
      (input.join(), outputs, summary)
    });

    self.core.conclude(started, frames_in, outputs, summary)
  }

  /// 提交线程：有空闲缓冲区就提交一个异步读。返回提交数。
  fn submit_reads(
    &self,
    index: usize,
    stream: &FeatureStream<CompletionLane>,
    shutdown: &(dyn Fn() + Sync),
  ) -> u64 {
    let _guard = PanicGuard(shutdown);
    let lane = &stream.buffer;
    let sink = QueueSink {
      stream: index,
      tx: lane.sender.clone(),
    };
    let mut submitted = 0u64;

    while self.core.control.should_continue(submitted) {
      // 缓冲池耗尽时阻塞，直到解码线程归还或缓冲池关闭
      let Some(buffer) = lane.pool.acquire() else {
        break;
      };
      if !self.core.control.should_continue(submitted) {
        lane.pool.release(buffer);
        break;
      }
      self
        .core
        .device
        .read_output_async(stream.device_index, buffer, Box::new(sink.clone()));
      submitted += 1;
    }

    debug!("输出流 {} 提交结束, 共 {} 个读请求", stream.info.name, submitted);
    submitted
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
    let mut ready: Vec<Option<AlignedBuffer>> = self.streams.iter().map(|_| None).collect();
    let mut received = vec![0u64; self.streams.len()];
    let mut waiting_since = Instant::now();
    let mut submitted = 0u64;

    'frames: loop {
      tracker.pump();
      if tracker.input() > submitted {
        submitted = tracker.input();
        waiting_since = Instant::now();
      }
      if !self.core.control.should_continue(summary.decoded) {
        break;
      }

      // 按排序后的顺序收齐本帧每个流的完成结果
      for (index, stream) in self.streams.iter().enumerate() {
        if ready[index].is_some() {
          continue;
        }
        match stream.buffer.queue.pop_timeout(POLL_INTERVAL) {
          Popped::Item(Completion {
            status: Ok(()),
            buffer,
          }) => {
            received[index] += 1;
            ready[index] = Some(buffer);
          }
          Popped::Item(Completion {
            status: Err(e),
            buffer,
          }) => {
            stream.buffer.pool.release(buffer);
            let stage = format!("输出流 {}", stream.info.name);
            self
              .core
              .transfer_failed(&stage, summary.decoded, e, shutdown);
            break 'frames;
          }
          Popped::TimedOut => {
            // 只有已提交到设备、结果却迟迟不来的帧才算超时
            if submitted > summary.decoded
              && waiting_since.elapsed() >= self.core.config.transfer_timeout
              && self.core.control.should_continue(summary.decoded)
            {
              let stage = format!("输出流 {}", stream.info.name);
              self
                .core
                .transfer_failed(&stage, summary.decoded, TransferError::Timeout, shutdown);
              break 'frames;
            }
            continue 'frames;
          }
          Popped::Shutdown => break 'frames,
        }
      }

      match self.decode_one(summary.decoded, &mut ready, ring, frames, render) {
        Ok((detections, elapsed)) => {
          summary.decoded += 1;
          summary.detections += detections as u64;
          summary.decode_time += elapsed;
          waiting_since = Instant::now();
        }
        Err(e) => {
          self.core.fail(e, shutdown);
          break;
        }
      }
    }

    // 未解码的缓冲区归还缓冲池
    for (slot, stream) in ready.iter_mut().zip(self.streams.iter()) {
      if let Some(buffer) = slot.take() {
        stream.buffer.pool.release(buffer);
      }
    }
    summary.outputs = received;
    debug!("解码结束, 共 {} 帧", summary.decoded);
    summary
  }

  fn decode_one(
    &self,
    frame_index: u64,
    ready: &mut [Option<AlignedBuffer>],
    ring: &ResultRing<'_>,
    frames: Option<&HandoffQueue<Frame>>,
    render: Option<&RenderSink<'_>>,
  ) -> Result<(usize, Duration), PipelineError> {
    let started = Instant::now();
    let maps: Vec<FeatureMap<'_>> = ready
      .iter()
      .zip(self.streams.iter())
      .filter_map(|(buffer, stream)| {
        buffer
          .as_ref()
          .map(|buffer| FeatureMap::new(buffer, &stream.info))
      })
      .collect();
    let decoded = self.core.decoder.decode(frame_index, &maps);
    let elapsed = started.elapsed();
    drop(maps);

    // 无论解码是否成功都先归还缓冲区
    for (slot, stream) in ready.iter_mut().zip(self.streams.iter()) {
      if let Some(buffer) = slot.take() {
        stream.buffer.pool.release(buffer);
      }
    }

    let result = decoded?;
    self.core.publish(ring, frames, render, &result)?;
    Ok((result.len(), elapsed))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn queue_sink_hands_buffer_to_decoder() {
    let (tx, queue) = HandoffQueue::with_capacity(1);
    let sink: Box<dyn CompletionSink> = Box::new(QueueSink { stream: 0, tx });
    sink.on_complete(Ok(()), AlignedBuffer::new(16).unwrap());
    match queue.pop_timeout(Duration::from_millis(10)) {
      Popped::Item(completion) => {
        assert!(completion.status.is_ok());
        assert_eq!(completion.buffer.len(), 16);
      }
      _ => panic!("完成结果没有入队"),
    }
  }

  #[test]
  fn queue_sink_drops_after_shutdown() {
    let (tx, queue) = HandoffQueue::<Completion>::with_capacity(1);
    queue.shutdown_handle().trigger();
    let sink: Box<dyn CompletionSink> = Box::new(QueueSink { stream: 0, tx });
    sink.on_complete(Err(TransferError::Aborted), AlignedBuffer::new(16).unwrap());
    assert!(matches!(queue.pop_timeout(Duration::from_millis(1)), Popped::Shutdown));
  }
}
