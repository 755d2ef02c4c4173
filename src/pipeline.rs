// 该文件是 Liushui （流水） 项目的一部分。
// src/pipeline.rs - 流水线编排
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
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  buffer::{BufferError, HandoffQueue, HandoffSender},
  device::{Accelerator, DeviceError, TransferError, log_network},
  frame::Frame,
  input::{FrameSource, InputError},
  model::{ConfigError, DecodeError, DetectResult, ModelConfig, YoloDecoder},
  output::{OutputError, Render},
  ring::{OverwritePolicy, ResultRing, RingError},
  stream::{StreamInfo, sorted_stream_order},
};

mod blocking;
mod callback;

pub use self::blocking::BlockingPipeline;
pub use self::callback::CallbackPipeline;

/// 等待类操作的轮询间隔，用于及时响应运行状态变化
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 渲染输出在解码线程中被调用
pub type RenderSink<'r> = dyn Render<Frame, DetectResult, Error = OutputError> + Sync + 'r;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
  pub threshold: f32,
  pub nms_threshold: Option<f32>,
  pub max_detections: usize,
  pub buffer_size: usize,
  pub overwrite: OverwritePolicy,
  pub transfer_timeout: Duration,
  pub queue_depth: usize,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      threshold: 0.3,
      nms_threshold: None,
      max_detections: 100,
      buffer_size: 16,
      overwrite: OverwritePolicy::Overwrite,
      transfer_timeout: Duration::from_millis(1000),
      queue_depth: 4,
    }
  }
}

impl PipelineConfig {
  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn with_nms_threshold(mut self, nms_threshold: Option<f32>) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  pub fn with_max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
    self.buffer_size = buffer_size;
    self
  }

  pub fn with_overwrite_policy(mut self, overwrite: OverwritePolicy) -> Self {
    self.overwrite = overwrite;
    self
  }

  pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
    self.transfer_timeout = timeout;
    self
  }

  /// 回调式流水线每个输出流的在途读请求数
  pub fn with_queue_depth(mut self, depth: usize) -> Self {
    self.queue_depth = depth.max(1);
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.threshold) {
      return Err(ConfigError::InvalidThreshold(self.threshold));
    }
    if let Some(nms) = self.nms_threshold {
      if !(0.0..=1.0).contains(&nms) {
        return Err(ConfigError::InvalidThreshold(nms));
      }
    }
    if self.max_detections == 0 {
      return Err(ConfigError::InvalidMaxDetections);
    }
    if self.buffer_size == 0 {
      return Err(ConfigError::InvalidBufferSize);
    }
    Ok(())
  }

  /// 按配置建立自有内存的结果环
  pub fn result_ring(&self) -> Result<ResultRing<'static>, RingError> {
    ResultRing::new(self.buffer_size, self.max_detections, self.overwrite)
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("设备错误: {0}")]
  Device(#[from] DeviceError),
  #[error("缓冲区错误: {0}")]
  Buffer(#[from] BufferError),
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("{stage} 传输失败: {source}")]
  Transfer {
    stage: String,
    #[source]
    source: TransferError,
  },
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("结果环错误: {0}")]
  Ring(#[from] RingError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("帧尺寸不匹配: 模型输入 {expected:?}, 实际 {found:?}")]
  FrameSizeMismatch {
    expected: (usize, usize),
    found: (usize, usize),
  },
  #[error("{0} 线程异常退出")]
  ThreadPanicked(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  Idle,
  Running,
  /// 输入已结束，其他线程处理完前 `final_input_count` 帧后退出
  Draining { final_input_count: u64 },
  Stopped,
  Aborted,
}

/// 一次运行的共享状态：状态机、停止请求、已提交帧数和第一个致命错误。
pub struct RunControl {
  state: Mutex<RunState>,
  stop_requested: AtomicBool,
  submitted: AtomicU64,
  fatal: Mutex<Option<PipelineError>>,
}

impl Default for RunControl {
  fn default() -> Self {
    Self::new()
  }
}

impl RunControl {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(RunState::Idle),
      stop_requested: AtomicBool::new(false),
      submitted: AtomicU64::new(0),
      fatal: Mutex::new(None),
    }
  }

  pub fn state(&self) -> RunState {
    *self.state.lock()
  }

  pub(crate) fn start(&self) {
    let mut state = self.state.lock();
    if *state == RunState::Idle {
      *state = RunState::Running;
    }
  }

  /// 处理过 `count` 帧的线程是否应继续
  pub fn should_continue(&self, count: u64) -> bool {
    match *self.state.lock() {
      RunState::Running => true,
      RunState::Draining { final_input_count } => count < final_input_count,
      RunState::Idle | RunState::Stopped | RunState::Aborted => false,
    }
  }

  /// 输入已结束且 `count` 已达到最终帧数
  pub fn drain_reached(&self, count: u64) -> bool {
    match *self.state.lock() {
      RunState::Draining { final_input_count } => count >= final_input_count,
      RunState::Stopped => true,
      _ => false,
    }
  }

  pub fn begin_drain(&self, final_input_count: u64) {
    let mut state = self.state.lock();
    if *state == RunState::Running {
      debug!("输入结束, 共 {} 帧, 进入排空", final_input_count);
      *state = RunState::Draining { final_input_count };
    }
  }

  /// 请求停止输入，已提交的帧仍会被处理完（Ctrl-C）
  pub fn request_stop(&self) {
    self.stop_requested.store(true, Ordering::Release);
  }

  pub fn stop_requested(&self) -> bool {
    self.stop_requested.load(Ordering::Acquire)
  }

  /// 输入线程每写入一帧后更新
  pub(crate) fn record_input(&self, count: u64) {
    self.submitted.fetch_max(count, Ordering::Release);
  }

  /// 已写入设备的帧数，只有输入线程会增加它
  pub fn submitted(&self) -> u64 {
    self.submitted.load(Ordering::Acquire)
  }

  pub(crate) fn finish(&self) {
    let mut state = self.state.lock();
    if matches!(*state, RunState::Running | RunState::Draining { .. }) {
      *state = RunState::Stopped;
    }
  }

  /// 记录致命错误并中止运行，只保留第一个错误
  pub fn fail(&self, err: PipelineError) {
    let mut fatal = self.fatal.lock();
    if fatal.is_none() {
      error!("流水线致命错误: {}", err);
      *fatal = Some(err);
    } else {
      debug!("忽略后续错误: {}", err);
    }
    *self.state.lock() = RunState::Aborted;
  }

  pub fn is_aborted(&self) -> bool {
    self.state() == RunState::Aborted
  }

  pub fn take_fatal(&self) -> Option<PipelineError> {
    self.fatal.lock().take()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
  Input(u64),
  Output { stream: usize, count: u64 },
}

/// 解码线程持有的进度视图，各线程通过通道报告自己的计数
pub struct ProgressTracker {
  rx: Receiver<Progress>,
  input: u64,
  outputs: Vec<u64>,
}

impl ProgressTracker {
  pub fn new(rx: Receiver<Progress>, streams: usize) -> Self {
    Self {
      rx,
      input: 0,
      outputs: vec![0; streams],
    }
  }

  pub fn apply(&mut self, progress: Progress) {
    match progress {
      Progress::Input(count) => self.input = self.input.max(count),
      Progress::Output { stream, count } => {
        if let Some(slot) = self.outputs.get_mut(stream) {
          *slot = (*slot).max(count);
        }
      }
    }
  }

  /// 处理所有已到达的消息
  pub fn pump(&mut self) {
    while let Ok(progress) = self.rx.try_recv() {
      self.apply(progress);
    }
  }

  /// 最多等待 `timeout` 收到新消息
  pub fn wait(&mut self, timeout: Duration) -> bool {
    match self.rx.recv_timeout(timeout) {
      Ok(progress) => {
        self.apply(progress);
        self.pump();
        true
      }
      Err(_) => false,
    }
  }

  pub fn input(&self) -> u64 {
    self.input
  }

  pub fn outputs(&self) -> &[u64] {
    &self.outputs
  }

  /// 所有输出流都已收到的帧数
  pub fn completed(&self) -> u64 {
    self.outputs.iter().copied().min().unwrap_or(0)
  }
}

/// 一次运行的统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
  pub frames_in: u64,
  pub frames_out: Vec<u64>,
  pub frames_decoded: u64,
  pub detections: u64,
  pub elapsed: Duration,
  pub decode_time: Duration,
}

impl RunReport {
  pub fn fps(&self) -> f64 {
    let secs = self.elapsed.as_secs_f64();
    if secs > 0.0 {
      self.frames_decoded as f64 / secs
    } else {
      0.0
    }
  }

  pub fn average_decode(&self) -> Duration {
    if self.frames_decoded == 0 {
      Duration::ZERO
    } else {
      self.decode_time / self.frames_decoded as u32
    }
  }

  pub fn log(&self) {
    info!(
      "输入 {} 帧, 输出 {:?}, 解码 {} 帧, 共 {} 个目标",
      self.frames_in, self.frames_out, self.frames_decoded, self.detections
    );
    info!(
      "总耗时 {:.2?}, {:.2} FPS, 平均解码 {:.2?}",
      self.elapsed,
      self.fps(),
      self.average_decode()
    );
  }
}

/// 解码线程的产出
#[derive(Debug, Default)]
pub(crate) struct DecodeSummary {
  pub decoded: u64,
  pub detections: u64,
  pub decode_time: Duration,
  pub outputs: Vec<u64>,
}

/// 线程异常展开时执行关停，避免其他线程永久阻塞
pub(crate) struct PanicGuard<'a>(pub &'a (dyn Fn() + Sync));

impl Drop for PanicGuard<'_> {
  fn drop(&mut self) {
    if thread::panicking() {
      (self.0)();
    }
  }
}

/// 两种流水线共用的部分：设备、解码器、配置和排序后的流顺序
pub(crate) struct PipelineCore<'d> {
  pub device: &'d dyn Accelerator,
  pub decoder: YoloDecoder,
  pub config: PipelineConfig,
  /// 排序后第 i 个流对应的设备流序号
  pub order: Vec<usize>,
  pub control: Arc<RunControl>,
}

impl<'d> PipelineCore<'d> {
  pub fn new(
    device: &'d dyn Accelerator,
    model: ModelConfig,
    config: PipelineConfig,
  ) -> Result<Self, PipelineError> {
    config.validate()?;
    model.validate_outputs(device.output_infos())?;
    let input = device.input_info().shape;
    if model.input != input {
      return Err(PipelineError::FrameSizeMismatch {
        expected: (input.height, input.width),
        found: (model.input.height, model.input.width),
      });
    }

    let order = sorted_stream_order(device.output_infos());
    debug!("输出流排序 (按大小升序): {:?}", order);
    let decoder = YoloDecoder::new(model, config.threshold, config.max_detections)
      .with_nms(config.nms_threshold);

    Ok(Self {
      device,
      decoder,
      config,
      order,
      control: Arc::new(RunControl::new()),
    })
  }

  pub fn sorted_infos(&self) -> Vec<StreamInfo> {
    let infos = self.device.output_infos();
    self.order.iter().map(|&i| infos[i].clone()).collect()
  }

  /// 运行前校验输入尺寸
  pub fn prepare<S: FrameSource>(&self, source: &mut S) -> Result<(), PipelineError> {
    let input = self.device.input_info().shape;
    source.fit_model(&input);
    let found = source.dimensions();
    if found != (input.height, input.width) {
      error!(
        "输入尺寸 {:?} 与模型输入 {}x{} 不符",
        found, input.height, input.width
      );
      return Err(PipelineError::FrameSizeMismatch {
        expected: (input.height, input.width),
        found,
      });
    }
    log_network(self.device);
    Ok(())
  }

  pub fn fail(&self, err: PipelineError, shutdown: &(dyn Fn() + Sync)) {
    self.control.fail(err);
    shutdown();
  }

  /// 处理传输失败。中止总是静默结束；排空完成后的超时视为正常结束。
  pub fn transfer_failed(
    &self,
    stage: &str,
    count: u64,
    err: TransferError,
    shutdown: &(dyn Fn() + Sync),
  ) {
    match err {
      TransferError::Aborted => debug!("{} 传输已中止", stage),
      TransferError::Timeout if self.control.drain_reached(count) => {
        debug!("{} 在排空完成后超时, 正常退出", stage)
      }
      source => self.fail(
        PipelineError::Transfer {
          stage: stage.to_string(),
          source,
        },
        shutdown,
      ),
    }
  }

  /// 输入线程：读取帧、写入设备，结束时进入排空
  pub fn input_loop<S: FrameSource>(
    &self,
    mut source: S,
    progress: Sender<Progress>,
    frames: Option<HandoffSender<Frame>>,
    shutdown: &(dyn Fn() + Sync),
  ) -> u64 {
    let _guard = PanicGuard(shutdown);
    let input = self.device.input_info().shape;
    let mut count = 0u64;

    loop {
      if self.control.is_aborted() {
        return count;
      }
      if self.control.stop_requested() {
        warn!("收到停止请求, 输入停止于第 {} 帧", count);
        break;
      }

      let mut frame = match source.next_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => break,
        Err(e) => {
          self.fail(e.into(), shutdown);
          return count;
        }
      };
      if (frame.height(), frame.width()) != (input.height, input.width) {
        self.fail(
          PipelineError::FrameSizeMismatch {
            expected: (input.height, input.width),
            found: (frame.height(), frame.width()),
          },
          shutdown,
        );
        return count;
      }

      if let Err(e) = self.device.wait_input_ready(self.config.transfer_timeout) {
        self.transfer_failed("输入", count, e, shutdown);
        return count;
      }
      if let Err(e) = self.device.write_input(frame.as_nhwc()) {
        self.transfer_failed("输入", count, e, shutdown);
        return count;
      }
      frame.set_index(count);
      count += 1;
      debug!("已提交第 {} 帧", count);
      self.control.record_input(count);
      let _ = progress.send(Progress::Input(count));

      if let Some(frames) = &frames {
        if frames.push_wait(frame).is_err() {
          debug!("帧队列已关闭, 输入停止");
          return count;
        }
      }
    }

    self.control.begin_drain(count);
    let _ = progress.send(Progress::Input(count));
    count
  }

  /// 发布一帧结果，并在有渲染输出时交给渲染
  pub fn publish(
    &self,
    ring: &ResultRing<'_>,
    frames: Option<&HandoffQueue<Frame>>,
    render: Option<&RenderSink<'_>>,
    result: &DetectResult,
  ) -> Result<(), PipelineError> {
    ring.publish(result.frame_index, &result.items)?;

    if let (Some(frames), Some(render)) = (frames, render) {
      // 帧在写入设备后才入队，这里最多短暂等待
      if let Some(frame) = frames.pop() {
        debug_assert_eq!(frame.index(), result.frame_index);
        render.render_result(&frame, result)?;
      }
    }
    Ok(())
  }

  pub fn frame_queue(&self, render: bool) -> (Option<HandoffSender<Frame>>, Option<HandoffQueue<Frame>>) {
    if !render {
      return (None, None);
    }
    let (tx, rx) = HandoffQueue::with_capacity(self.config.queue_depth * 2);
    (Some(tx), Some(rx))
  }

  /// 汇总各线程的结果；有致命错误时返回第一个
  pub fn conclude(
    &self,
    started: Instant,
    frames_in: thread::Result<u64>,
    outputs: Vec<thread::Result<u64>>,
    summary: thread::Result<DecodeSummary>,
  ) -> Result<RunReport, PipelineError> {
    let frames_in = frames_in.map_err(|_| PipelineError::ThreadPanicked("输入"))?;
    let outputs = outputs
      .into_iter()
      .collect::<Result<Vec<_>, _>>()
      .map_err(|_| PipelineError::ThreadPanicked("输出"))?;
    let summary = summary.map_err(|_| PipelineError::ThreadPanicked("解码"))?;

    if let Some(err) = self.control.take_fatal() {
      return Err(err);
    }

    debug!("输出线程计数: {:?}", outputs);
    let report = RunReport {
      frames_in,
      frames_out: summary.outputs,
      frames_decoded: summary.decoded,
      detections: summary.detections,
      elapsed: started.elapsed(),
      decode_time: summary.decode_time,
    };
    report.log();
    Ok(report)
  }
}
