// 该文件是 Liushui （流水） 项目的一部分。
// src/model/yolo.rs - 多尺度锚框解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::{debug, error};

use super::{
  ANCHORS_PER_SCALE, DecodeError, DetectResult, Detection, ModelConfig, suppress,
};
use crate::stream::StreamInfo;

/// 一个尺度的原始量化输出
#[derive(Debug, Clone, Copy)]
pub struct FeatureMap<'a> {
  pub data: &'a [u8],
  pub info: &'a StreamInfo,
}

impl<'a> FeatureMap<'a> {
  pub fn new(data: &'a [u8], info: &'a StreamInfo) -> Self {
    Self { data, info }
  }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// YOLOv5/YOLOv7 风格的解码器。
///
/// 解码是纯函数：相同的特征图与配置总是得到相同的检测列表。
#[derive(Debug, Clone)]
pub struct YoloDecoder {
  config: ModelConfig,
  threshold: f32,
  max_detections: usize,
  nms_threshold: Option<f32>,
}

impl YoloDecoder {
  pub fn new(config: ModelConfig, threshold: f32, max_detections: usize) -> Self {
    Self {
      config,
      threshold,
      max_detections,
      nms_threshold: None,
    }
  }

  /// 启用按类别的贪心 IoU 抑制
  pub fn with_nms(mut self, nms_threshold: Option<f32>) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn threshold(&self) -> f32 {
    self.threshold
  }

  pub fn max_detections(&self) -> usize {
    self.max_detections
  }

  /// 解码一帧。`maps` 必须按字节数升序排列（与锚框顺序一致）。
  pub fn decode(&self, frame_index: u64, maps: &[FeatureMap<'_>]) -> Result<DetectResult, DecodeError> {
    let mut items = Vec::new();
    self.decode_into(maps, &mut items)?;
    debug!("第 {} 帧解码得到 {} 个目标", frame_index, items.len());
    Ok(DetectResult::new(frame_index, items))
  }

  pub fn decode_into(
    &self,
    maps: &[FeatureMap<'_>],
    items: &mut Vec<Detection>,
  ) -> Result<(), DecodeError> {
    items.clear();
    self.check_maps(maps)?;

    if self.max_detections == 0 {
      return Ok(());
    }

    let uncapped = self.nms_threshold.is_some();
    for (scale, map) in maps.iter().enumerate() {
      let full = self.decode_scale(map, &self.config.anchors[scale], items, uncapped);
      if full {
        return Ok(());
      }
    }

    if let Some(nms_threshold) = self.nms_threshold {
      suppress(items, nms_threshold);
      items.truncate(self.max_detections);
    }
    Ok(())
  }

  fn check_maps(&self, maps: &[FeatureMap<'_>]) -> Result<(), DecodeError> {
    if maps.len() != self.config.scales() {
      error!("特征图数量不符: 期望 {}, 实际 {}", self.config.scales(), maps.len());
      return Err(DecodeError::MissingStreams {
        expected: self.config.scales(),
        found: maps.len(),
      });
    }
    let channels = self.config.channels_per_scale();
    for map in maps {
      if map.info.shape.channels != channels {
        return Err(DecodeError::ChannelMismatch {
          stream: map.info.name.clone(),
          expected: channels,
          found: map.info.shape.channels,
        });
      }
      if map.data.len() != map.info.frame_size() {
        return Err(DecodeError::TensorLength {
          stream: map.info.name.clone(),
          expected: map.info.frame_size(),
          found: map.data.len(),
        });
      }
    }
    Ok(())
  }

  /// 解码一个尺度，返回是否已达到上限
  fn decode_scale(
    &self,
    map: &FeatureMap<'_>,
    anchors: &[[f32; 2]; ANCHORS_PER_SCALE],
    items: &mut Vec<Detection>,
    uncapped: bool,
  ) -> bool {
    let shape = map.info.shape;
    let quant = map.info.quant;
    let per_anchor = self.config.channels_per_anchor();
    let input_w = self.config.input.width as f32;
    let input_h = self.config.input.height as f32;
    let stride_x = input_w / shape.width as f32;
    let stride_y = input_h / shape.height as f32;

    for row in 0..shape.height {
      for col in 0..shape.width {
        let cell = (row * shape.width + col) * shape.channels;
        for (anchor, [anchor_w, anchor_h]) in anchors.iter().enumerate() {
          let base = cell + anchor * per_anchor;
          let fields = &map.data[base..base + per_anchor];

          let objectness = sigmoid(quant.dequantize(fields[4]));
          // 置信度不会超过目标置信度
          if objectness < self.threshold {
            continue;
          }

          let (class_id, class_logit) = fields[5..]
            .iter()
            .enumerate()
            .map(|(id, &raw)| (id, quant.dequantize(raw)))
            .fold((0, f32::NEG_INFINITY), |best, (id, value)| {
              if value > best.1 { (id, value) } else { best }
            });
          let confidence = objectness * sigmoid(class_logit);
          if confidence < self.threshold {
            continue;
          }

          let tx = sigmoid(quant.dequantize(fields[0]));
          let ty = sigmoid(quant.dequantize(fields[1]));
          let tw = sigmoid(quant.dequantize(fields[2]));
          let th = sigmoid(quant.dequantize(fields[3]));

          let cx = (2.0 * tx - 0.5 + col as f32) * stride_x;
          let cy = (2.0 * ty - 0.5 + row as f32) * stride_y;
          let w = (2.0 * tw).powi(2) * anchor_w;
          let h = (2.0 * th).powi(2) * anchor_h;

          items.push(Detection {
            ymin: (cy - h / 2.0).clamp(0.0, input_h),
            xmin: (cx - w / 2.0).clamp(0.0, input_w),
            ymax: (cy + h / 2.0).clamp(0.0, input_h),
            xmax: (cx + w / 2.0).clamp(0.0, input_w),
            confidence,
            class_id: class_id as u32,
          });
          if !uncapped && items.len() >= self.max_detections {
            return true;
          }
        }
      }
    }
    false
  }
}
