// 该文件是 Liushui （流水） 项目的一部分。
// src/device/simulated.rs - 软件模拟加速器
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
  collections::VecDeque,
  path::Path,
  sync::Arc,
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::{Accelerator, CompletionSink, DeviceError, TransferError, TransferStatus};
use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::AlignedBuffer,
  model::COCO_CLASSES,
  stream::{QuantInfo, StreamInfo, TensorShape},
};

const DEFAULT_QUEUE_DEPTH: usize = 4;
const ANCHORS_PER_SCALE: usize = 3;
const BOX_FIELDS: usize = 4;
/// 注入目标的 logit，σ(8) ≈ 0.9997
const OBJECT_LOGIT: f32 = 8.0;
/// 背景 logit，σ(-8) ≈ 0.0003
const BACKGROUND_LOGIT: f32 = -8.0;

/// 编译后网络的描述，作为模拟设备的“模型文件”（JSON）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescription {
  pub name: String,
  pub input: StreamInfo,
  pub outputs: Vec<StreamInfo>,
}

impl NetworkDescription {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
    let path = path.as_ref();
    info!("加载网络描述: {}", path.display());
    let data = std::fs::read(path)?;
    let description: NetworkDescription = serde_json::from_slice(&data)?;
    description.validate()?;
    Ok(description)
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DeviceError> {
    let data = serde_json::to_vec_pretty(self)?;
    std::fs::write(path, data)?;
    Ok(())
  }

  pub fn validate(&self) -> Result<(), DeviceError> {
    if self.input.frame_size() == 0 {
      return Err(DeviceError::ModelInvalid(format!(
        "输入流 {} 的大小为 0",
        self.input.name
      )));
    }
    if self.outputs.is_empty() {
      return Err(DeviceError::ModelInvalid("网络没有输出流".to_string()));
    }
    if let Some(empty) = self.outputs.iter().find(|o| o.frame_size() == 0) {
      return Err(DeviceError::ModelInvalid(format!(
        "输出流 {} 的大小为 0",
        empty.name
      )));
    }
    Ok(())
  }

  /// 640x640 的 YOLOv5 网络，三个输出按设备顺序（非大小顺序）排列
  pub fn yolov5_640(classes: usize) -> Self {
    let channels = ANCHORS_PER_SCALE * (5 + classes);
    let output = |name: &str, grid: usize, zero_point: i32, scale: f32| {
      StreamInfo::new(
        name,
        TensorShape::new(grid, grid, channels),
        QuantInfo::new(zero_point, scale),
      )
    };
    Self {
      name: "yolov5s".to_string(),
      input: StreamInfo::new(
        "yolov5s/input_layer1",
        TensorShape::new(640, 640, 3),
        QuantInfo::default(),
      ),
      outputs: vec![
        output("yolov5s/conv70", 40, 127, 0.102),
        output("yolov5s/conv63", 80, 132, 0.094),
        output("yolov5s/conv77", 20, 121, 0.087),
      ],
    }
  }
}

/// 为一个输出流生成一帧原始张量
pub trait TensorSynthesizer: Send + Sync {
  fn synthesize(&self, frame_index: u64, stream: &StreamInfo, out: &mut [u8]);
}

impl<F> TensorSynthesizer for F
where
  F: Fn(u64, &StreamInfo, &mut [u8]) + Send + Sync,
{
  fn synthesize(&self, frame_index: u64, stream: &StreamInfo, out: &mut [u8]) {
    self(frame_index, stream, out)
  }
}

/// 在某个尺度的某个格点、某个锚框上放置一个目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injection {
  pub grid_width: usize,
  pub row: usize,
  pub col: usize,
  pub anchor: usize,
  pub class_id: usize,
}

/// 背景为低置信度，注入位置的目标置信度和类别分数都很高，
/// 框回归量化为 0（中心在格点偏移 0.5 处，尺寸等于锚框）。
#[derive(Debug, Clone, Default)]
pub struct ObjectInjector {
  injections: Vec<Injection>,
  moving: bool,
}

impl ObjectInjector {
  pub fn new(injections: Vec<Injection>) -> Self {
    Self {
      injections,
      moving: false,
    }
  }

  /// 每帧把目标向右移动一格，用于演示
  pub fn moving(mut self) -> Self {
    self.moving = true;
    self
  }
}

impl TensorSynthesizer for ObjectInjector {
  fn synthesize(&self, frame_index: u64, stream: &StreamInfo, out: &mut [u8]) {
    let quant = stream.quant;
    out.fill(quant.quantize(BACKGROUND_LOGIT));

    let shape = stream.shape;
    let per_anchor = shape.channels / ANCHORS_PER_SCALE;
    if per_anchor <= BOX_FIELDS + 1 {
      return;
    }
    let box_value = quant.quantize(0.0);
    let hot = quant.quantize(OBJECT_LOGIT);

    for injection in self
      .injections
      .iter()
      .filter(|i| i.grid_width == shape.width)
    {
      let col = if self.moving {
        (injection.col + frame_index as usize) % shape.width
      } else {
        injection.col
      };
      if injection.row >= shape.height
        || col >= shape.width
        || injection.anchor >= ANCHORS_PER_SCALE
        || BOX_FIELDS + 1 + injection.class_id >= per_anchor
      {
        continue;
      }
      let cell = (injection.row * shape.width + col) * shape.channels;
      let base = cell + injection.anchor * per_anchor;
      out[base..base + BOX_FIELDS].fill(box_value);
      out[base + BOX_FIELDS] = hot;
      out[base + BOX_FIELDS + 1 + injection.class_id] = hot;
    }
  }
}

struct Lane {
  ready: VecDeque<u64>,
  pending: VecDeque<(AlignedBuffer, Box<dyn CompletionSink>)>,
}

struct DeviceState {
  lanes: Vec<Lane>,
  frames_written: u64,
  aborted: bool,
}

impl DeviceState {
  fn backlog(&self) -> usize {
    self.lanes.iter().map(|l| l.ready.len()).max().unwrap_or(0)
  }
}

/// 已匹配到输出帧、等待在锁外交付的异步请求
type Delivery = (usize, u64, AlignedBuffer, Box<dyn CompletionSink>);

/// 在内存中模拟加速器的传输语义：背压、超时、中止和异步完成。
///
/// 每写入一帧输入，每个输出流各产生一帧输出，内容由合成器生成。
pub struct SimulatedDevice {
  description: NetworkDescription,
  synthesizer: Arc<dyn TensorSynthesizer>,
  queue_depth: usize,
  latency: Option<Duration>,
  fault: Option<(usize, u64)>,
  state: Mutex<DeviceState>,
  changed: Condvar,
}

pub struct SimulatedDeviceBuilder {
  description: NetworkDescription,
  synthesizer: Arc<dyn TensorSynthesizer>,
  queue_depth: usize,
  latency: Option<Duration>,
  fault: Option<(usize, u64)>,
}

impl SimulatedDeviceBuilder {
  pub fn new(description: NetworkDescription) -> Self {
    Self {
      description,
      synthesizer: Arc::new(ObjectInjector::default()),
      queue_depth: DEFAULT_QUEUE_DEPTH,
      latency: None,
      fault: None,
    }
  }

  pub fn synthesizer(mut self, synthesizer: impl TensorSynthesizer + 'static) -> Self {
    self.synthesizer = Arc::new(synthesizer);
    self
  }

  /// 设备内部每个输出流最多缓存的帧数
  pub fn queue_depth(mut self, depth: usize) -> Self {
    self.queue_depth = depth.max(1);
    self
  }

  /// 每次输出读取前的模拟推理耗时
  pub fn latency(mut self, latency: Duration) -> Self {
    self.latency = Some(latency);
    self
  }

  /// 指定输出流从第 `frame` 帧起返回设备错误
  pub fn fail_output_after(mut self, stream: usize, frame: u64) -> Self {
    self.fault = Some((stream, frame));
    self
  }

  pub fn build(self) -> Result<SimulatedDevice, DeviceError> {
    self.description.validate()?;
    let lanes = self
      .description
      .outputs
      .iter()
      .map(|_| Lane {
        ready: VecDeque::with_capacity(self.queue_depth),
        pending: VecDeque::new(),
      })
      .collect();
    debug!(
      "模拟设备 {}: {} 个输出流, 队列深度 {}",
      self.description.name,
      self.description.outputs.len(),
      self.queue_depth
    );
    Ok(SimulatedDevice {
      description: self.description,
      synthesizer: self.synthesizer,
      queue_depth: self.queue_depth,
      latency: self.latency,
      fault: self.fault,
      state: Mutex::new(DeviceState {
        lanes,
        frames_written: 0,
        aborted: false,
      }),
      changed: Condvar::new(),
    })
  }
}

impl FromUrlWithScheme for SimulatedDeviceBuilder {
  const SCHEME: &'static str = "simulated";
}

impl FromUrl for SimulatedDeviceBuilder {
  type Error = DeviceError;

  /// `simulated:///path/model.json?depth=4&latency_ms=5&demo`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DeviceError::SchemeMismatch);
    }

    // 不给描述文件时使用内置的 640x640 YOLOv5 网络
    let description = match url.path() {
      "" | "/" => NetworkDescription::yolov5_640(COCO_CLASSES),
      path => NetworkDescription::load(path)?,
    };
    let mut builder = SimulatedDeviceBuilder::new(description);
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "depth" => {
          let depth = value
            .parse()
            .map_err(|_| DeviceError::ModelInvalid(format!("无效的队列深度: {}", value)))?;
          builder = builder.queue_depth(depth);
        }
        "latency_ms" => {
          let ms = value
            .parse()
            .map_err(|_| DeviceError::ModelInvalid(format!("无效的延迟: {}", value)))?;
          builder = builder.latency(Duration::from_millis(ms));
        }
        "demo" => {
          let injector = demo_injector(&builder.description);
          builder = builder.synthesizer(injector);
        }
        other => warn!("忽略未知参数: {}", other),
      }
    }
    Ok(builder)
  }
}

/// 每个尺度放一个会移动的目标
fn demo_injector(description: &NetworkDescription) -> ObjectInjector {
  let injections = description
    .outputs
    .iter()
    .enumerate()
    .map(|(index, output)| Injection {
      grid_width: output.shape.width,
      row: output.shape.height / 2,
      col: 0,
      anchor: index % ANCHORS_PER_SCALE,
      class_id: index,
    })
    .collect();
  ObjectInjector::new(injections).moving()
}

impl SimulatedDevice {
  pub fn description(&self) -> &NetworkDescription {
    &self.description
  }

  pub fn frames_written(&self) -> u64 {
    self.state.lock().frames_written
  }

  fn wait_until<F>(
    &self,
    timeout: Duration,
    mut ready: F,
  ) -> Result<MutexGuard<'_, DeviceState>, TransferError>
  where
    F: FnMut(&DeviceState) -> bool,
  {
    let deadline = Instant::now() + timeout;
    let mut state = self.state.lock();
    loop {
      if state.aborted {
        return Err(TransferError::Aborted);
      }
      if ready(&state) {
        return Ok(state);
      }
      if self.changed.wait_until(&mut state, deadline).timed_out() {
        if state.aborted {
          return Err(TransferError::Aborted);
        }
        if ready(&state) {
          return Ok(state);
        }
        return Err(TransferError::Timeout);
      }
    }
  }

  fn produce(&self, stream: usize, frame_index: u64, buffer: &mut [u8]) -> TransferStatus {
    let info = &self.description.outputs[stream];
    if buffer.len() != info.frame_size() {
      return Err(TransferError::device(
        -2,
        format!(
          "输出流 {} 缓冲区大小 {} 与帧大小 {} 不符",
          info.name,
          buffer.len(),
          info.frame_size()
        ),
      ));
    }
    if let Some((fault_stream, fault_frame)) = self.fault {
      if fault_stream == stream && frame_index >= fault_frame {
        return Err(TransferError::device(
          -1,
          format!("输出流 {} 第 {} 帧注入故障", info.name, frame_index),
        ));
      }
    }
    if let Some(latency) = self.latency {
      std::thread::sleep(latency);
    }
    self.synthesizer.synthesize(frame_index, info, buffer);
    Ok(())
  }

  fn deliver(&self, deliveries: Vec<Delivery>) {
    for (stream, frame_index, mut buffer, sink) in deliveries {
      let status = self.produce(stream, frame_index, &mut buffer);
      sink.on_complete(status, buffer);
    }
  }

  fn check_stream(&self, stream: usize) -> TransferStatus {
    if stream >= self.description.outputs.len() {
      return Err(TransferError::device(
        -3,
        format!("输出流序号 {} 越界", stream),
      ));
    }
    Ok(())
  }
}

impl Accelerator for SimulatedDevice {
  fn name(&self) -> &str {
    &self.description.name
  }

  fn input_info(&self) -> &StreamInfo {
    &self.description.input
  }

  fn output_infos(&self) -> &[StreamInfo] {
    &self.description.outputs
  }

  fn wait_input_ready(&self, timeout: Duration) -> TransferStatus {
    let depth = self.queue_depth;
    self
      .wait_until(timeout, |state| state.backlog() < depth)
      .map(drop)
  }

  fn write_input(&self, frame: &[u8]) -> TransferStatus {
    let expected = self.description.input.frame_size();
    if frame.len() != expected {
      return Err(TransferError::device(
        -2,
        format!("输入帧大小 {} 与 {} 不符", frame.len(), expected),
      ));
    }

    let mut deliveries = Vec::new();
    {
      let mut state = self.state.lock();
      if state.aborted {
        return Err(TransferError::Aborted);
      }
      let frame_index = state.frames_written;
      state.frames_written += 1;
      for (stream, lane) in state.lanes.iter_mut().enumerate() {
        // 已有异步请求在等待时直接交付，不进入就绪队列
        match lane.pending.pop_front() {
          Some((buffer, sink)) => deliveries.push((stream, frame_index, buffer, sink)),
          None => lane.ready.push_back(frame_index),
        }
      }
    }
    self.changed.notify_all();
    self.deliver(deliveries);
    Ok(())
  }

  fn wait_output_ready(&self, stream: usize, timeout: Duration) -> TransferStatus {
    self.check_stream(stream)?;
    self
      .wait_until(timeout, |state| !state.lanes[stream].ready.is_empty())
      .map(drop)
  }

  fn read_output(&self, stream: usize, buffer: &mut [u8], timeout: Duration) -> TransferStatus {
    self.check_stream(stream)?;
    let mut state = self.wait_until(timeout, |state| !state.lanes[stream].ready.is_empty())?;
    let frame_index = state.lanes[stream]
      .ready
      .pop_front()
      .ok_or(TransferError::Timeout)?;
    drop(state);
    self.changed.notify_all();
    self.produce(stream, frame_index, buffer)
  }

  fn read_output_async(&self, stream: usize, buffer: AlignedBuffer, sink: Box<dyn CompletionSink>) {
    if let Err(e) = self.check_stream(stream) {
      sink.on_complete(Err(e), buffer);
      return;
    }

    let mut state = self.state.lock();
    if state.aborted {
      drop(state);
      sink.on_complete(Err(TransferError::Aborted), buffer);
      return;
    }
    match state.lanes[stream].ready.pop_front() {
      Some(frame_index) => {
        drop(state);
        self.changed.notify_all();
        self.deliver(vec![(stream, frame_index, buffer, sink)]);
      }
      None => state.lanes[stream].pending.push_back((buffer, sink)),
    }
  }

  fn abort(&self) {
    let pending: Vec<_> = {
      let mut state = self.state.lock();
      if state.aborted {
        return;
      }
      state.aborted = true;
      state
        .lanes
        .iter_mut()
        .flat_map(|lane| lane.pending.drain(..))
        .collect()
    };
    debug!("模拟设备已中止, {} 个异步请求被取消", pending.len());
    self.changed.notify_all();
    for (buffer, sink) in pending {
      sink.on_complete(Err(TransferError::Aborted), buffer);
    }
  }
}
