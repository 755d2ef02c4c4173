// 该文件是 Liushui （流水） 项目的一部分。
// src/device.rs - 加速器接口
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

use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::{buffer::AlignedBuffer, stream::StreamInfo};

mod simulated;
pub use self::simulated::{
  Injection, NetworkDescription, ObjectInjector, SimulatedDevice, SimulatedDeviceBuilder,
  TensorSynthesizer,
};

/// 单次传输的失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
  #[error("传输超时")]
  Timeout,
  /// 主动中止，关停流程中的正常状态
  #[error("传输已中止")]
  Aborted,
  #[error("设备错误 ({code}): {message}")]
  Device { code: i32, message: String },
}

impl TransferError {
  pub fn device(code: i32, message: impl Into<String>) -> Self {
    TransferError::Device {
      code,
      message: message.into(),
    }
  }

  pub fn is_aborted(&self) -> bool {
    matches!(self, TransferError::Aborted)
  }
}

pub type TransferStatus = Result<(), TransferError>;

#[derive(Error, Debug)]
pub enum DeviceError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("模型描述解析错误: {0}")]
  ModelParse(#[from] serde_json::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 异步读完成通知。
///
/// 每个提交的传输恰好调用一次：`self: Box<Self>` 把所有权交给设备，
/// 调用即消耗。实现运行在设备的完成上下文中，不得阻塞。
pub trait CompletionSink: Send {
  fn on_complete(self: Box<Self>, status: TransferStatus, buffer: AlignedBuffer);
}

impl<F> CompletionSink for F
where
  F: FnOnce(TransferStatus, AlignedBuffer) + Send,
{
  fn on_complete(self: Box<Self>, status: TransferStatus, buffer: AlignedBuffer) {
    (*self)(status, buffer)
  }
}

/// 已配置好网络的加速器。
///
/// 一个输入流，若干输出流；输出流序号即 `output_infos` 中的下标（设备顺序）。
/// 所有方法可以被多个线程并发调用。
pub trait Accelerator: Sync {
  fn name(&self) -> &str;

  fn input_info(&self) -> &StreamInfo;

  fn output_infos(&self) -> &[StreamInfo];

  /// 等待设备可以接收下一帧输入
  fn wait_input_ready(&self, timeout: Duration) -> TransferStatus;

  /// 提交一帧输入。`frame` 的长度必须等于输入流的帧大小。
  fn write_input(&self, frame: &[u8]) -> TransferStatus;

  /// 等待指定输出流有一帧结果可读
  fn wait_output_ready(&self, stream: usize, timeout: Duration) -> TransferStatus;

  /// 阻塞读取一帧输出到 `buffer`
  fn read_output(&self, stream: usize, buffer: &mut [u8], timeout: Duration) -> TransferStatus;

  /// 异步读取一帧输出。缓冲区随完成通知归还。
  fn read_output_async(&self, stream: usize, buffer: AlignedBuffer, sink: Box<dyn CompletionSink>);

  /// 中止所有进行中和之后的传输，它们都以 `TransferError::Aborted` 结束
  fn abort(&self);
}

/// 运行前打印网络的输入输出流信息
pub fn log_network(device: &dyn Accelerator) {
  let input = device.input_info();
  info!(
    "网络 {}: 输入 {} [{}], 零点 {}, 缩放 {}",
    device.name(),
    input.name,
    input.shape,
    input.quant.zero_point,
    input.quant.scale
  );
  for (index, output) in device.output_infos().iter().enumerate() {
    info!(
      "  输出 #{} {} [{}], {} 字节, 零点 {}, 缩放 {}",
      index,
      output.name,
      output.shape,
      output.frame_size(),
      output.quant.zero_point,
      output.quant.scale
    );
  }
}

#[cfg(test)]
mod tests {
  use std::sync::mpsc;

  use super::*;

  #[test]
  fn closures_are_completion_sinks() {
    let (tx, rx) = mpsc::channel();
    let sink: Box<dyn CompletionSink> = Box::new(move |status: TransferStatus, buffer: AlignedBuffer| {
      tx.send((status, buffer.len())).unwrap();
    });
    sink.on_complete(Err(TransferError::Aborted), AlignedBuffer::new(8).unwrap());
    let (status, len) = rx.recv().unwrap();
    assert_eq!(status, Err(TransferError::Aborted));
    assert_eq!(len, 8);
  }

  #[test]
  fn device_error_message_carries_code() {
    let err = TransferError::device(-7, "DMA 失败");
    assert_eq!(err.to_string(), "设备错误 (-7): DMA 失败");
    assert!(!err.is_aborted());
  }
}
