// 该文件是 Liushui （流水） 项目的一部分。
// src/stream.rs - 特征流定义
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

use serde::{Deserialize, Serialize};

/// 量化参数：`real = (raw - zero_point) * scale`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantInfo {
  pub zero_point: i32,
  pub scale: f32,
}

impl Default for QuantInfo {
  fn default() -> Self {
    Self {
      zero_point: 0,
      scale: 1.0,
    }
  }
}

impl QuantInfo {
  pub fn new(zero_point: i32, scale: f32) -> Self {
    Self { zero_point, scale }
  }

  #[inline]
  pub fn dequantize(&self, raw: u8) -> f32 {
    (raw as i32 - self.zero_point) as f32 * self.scale
  }

  /// 反向量化并饱和到 u8 范围
  pub fn quantize(&self, real: f32) -> u8 {
    let raw = (real / self.scale).round() + self.zero_point as f32;
    raw.clamp(0.0, u8::MAX as f32) as u8
  }
}

/// NHWC 张量形状（批大小固定为 1）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
  pub height: usize,
  pub width: usize,
  pub channels: usize,
}

impl TensorShape {
  pub fn new(height: usize, width: usize, channels: usize) -> Self {
    Self {
      height,
      width,
      channels,
    }
  }

  /// 每帧字节数（u8 元素）
  pub fn frame_size(&self) -> usize {
    self.height * self.width * self.channels
  }
}

impl std::fmt::Display for TensorShape {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}x{}x{}", self.height, self.width, self.channels)
  }
}

/// 加速器上一个输入/输出流的描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
  pub name: String,
  pub shape: TensorShape,
  #[serde(default)]
  pub quant: QuantInfo,
}

impl StreamInfo {
  pub fn new(name: impl Into<String>, shape: TensorShape, quant: QuantInfo) -> Self {
    Self {
      name: name.into(),
      shape,
      quant,
    }
  }

  pub fn frame_size(&self) -> usize {
    self.shape.frame_size()
  }
}

/// 一个模型输出张量在流水线中的状态：设备上的流序号、元数据和它的缓冲结构。
///
/// `B` 在阻塞式流水线中是双缓冲，在回调式流水线中是缓冲池加交接队列。
pub struct FeatureStream<B> {
  pub device_index: usize,
  pub info: StreamInfo,
  pub buffer: B,
}

impl<B> FeatureStream<B> {
  pub fn new(device_index: usize, info: StreamInfo, buffer: B) -> Self {
    Self {
      device_index,
      info,
      buffer,
    }
  }
}

/// 按字节数升序返回设备输出流序号。
///
/// 排序稳定，大小相同的流保持设备顺序；排序结果在整个运行期间不变，
/// 因此排序后的第 0 个流在每一帧都对应同一组锚框和步长。
pub fn sorted_stream_order(infos: &[StreamInfo]) -> Vec<usize> {
  let mut order: Vec<usize> = (0..infos.len()).collect();
  order.sort_by_key(|&i| infos[i].frame_size());
  order
}

#[cfg(test)]
mod tests {
  use super::*;

  fn info(name: &str, grid: usize) -> StreamInfo {
    StreamInfo::new(name, TensorShape::new(grid, grid, 255), QuantInfo::default())
  }

  #[test]
  fn dequantize_applies_zero_point_and_scale() {
    let quant = QuantInfo::new(128, 0.5);
    assert_eq!(quant.dequantize(128), 0.0);
    assert_eq!(quant.dequantize(130), 1.0);
    assert_eq!(quant.dequantize(0), -64.0);
  }

  #[test]
  fn quantize_saturates() {
    let quant = QuantInfo::new(10, 0.1);
    assert_eq!(quant.quantize(-100.0), 0);
    assert_eq!(quant.quantize(100.0), 255);
    assert_eq!(quant.quantize(1.0), 20);
  }

  #[test]
  fn streams_sort_by_size_ascending() {
    let infos = vec![info("p3", 80), info("p5", 20), info("p4", 40)];
    assert_eq!(sorted_stream_order(&infos), vec![1, 2, 0]);
  }

  #[test]
  fn equal_sizes_keep_device_order() {
    let infos = vec![info("a", 40), info("b", 20), info("c", 40)];
    assert_eq!(sorted_stream_order(&infos), vec![1, 0, 2]);
  }
}
