// 该文件是 Liushui （流水） 项目的一部分。
// src/model.rs - 检测模型配置与结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::stream::{StreamInfo, TensorShape};

mod nms;
mod yolo;

pub use self::nms::suppress;
pub use self::yolo::{FeatureMap, YoloDecoder};

/// 每个检测结果在结果环中占用的 f32 字段数
pub const DETECTION_FIELDS: usize = 6;
pub const ANCHORS_PER_SCALE: usize = 3;
/// tx, ty, tw, th, objectness
pub const BOX_CHANNELS: usize = 5;
pub const COCO_CLASSES: usize = 80;

pub const COCO_LABELS: [&str; COCO_CLASSES] = [
  "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
  "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
  "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
  "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
  "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
  "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
  "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
  "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
  "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
  "teddy bear", "hair drier", "toothbrush",
];

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("未知的模型架构: {0}")]
  UnknownArchitecture(String),
  #[error("模型输出数量不符: 期望 {expected}, 实际 {found}")]
  OutputCount { expected: usize, found: usize },
  #[error("输出流 {stream} 通道数不符: 期望 {expected}, 实际 {found}")]
  ChannelMismatch {
    stream: String,
    expected: usize,
    found: usize,
  },
  #[error("置信度阈值必须在 [0, 1] 内: {0}")]
  InvalidThreshold(f32),
  #[error("最大检测数必须大于 0")]
  InvalidMaxDetections,
  #[error("结果环大小必须大于 0")]
  InvalidBufferSize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("特征图数量不符: 期望 {expected}, 实际 {found}")]
  MissingStreams { expected: usize, found: usize },
  #[error("特征图 {stream} 数据长度不符: 期望 {expected}, 实际 {found}")]
  TensorLength {
    stream: String,
    expected: usize,
    found: usize,
  },
  #[error("特征图 {stream} 通道数不符: 期望 {expected}, 实际 {found}")]
  ChannelMismatch {
    stream: String,
    expected: usize,
    found: usize,
  },
}

/// 单个检测框，坐标为输入帧像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
  pub ymin: f32,
  pub xmin: f32,
  pub ymax: f32,
  pub xmax: f32,
  pub confidence: f32,
  pub class_id: u32,
}

impl Detection {
  /// 结果环中的字段顺序：ymin, xmin, ymax, xmax, confidence, class id
  pub fn to_fields(&self) -> [f32; DETECTION_FIELDS] {
    [
      self.ymin,
      self.xmin,
      self.ymax,
      self.xmax,
      self.confidence,
      self.class_id as f32,
    ]
  }

  pub fn from_fields(fields: &[f32; DETECTION_FIELDS]) -> Self {
    Self {
      ymin: fields[0],
      xmin: fields[1],
      ymax: fields[2],
      xmax: fields[3],
      confidence: fields[4],
      class_id: fields[5] as u32,
    }
  }

  pub fn width(&self) -> f32 {
    (self.xmax - self.xmin).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.ymax - self.ymin).max(0.0)
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn iou(&self, other: &Detection) -> f32 {
    let w = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0.0);
    let h = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0.0);
    let inter = w * h;
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }

  pub fn label(&self) -> Option<&'static str> {
    COCO_LABELS.get(self.class_id as usize).copied()
  }
}

/// 一帧的全部检测结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectResult {
  pub frame_index: u64,
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn new(frame_index: u64, items: Vec<Detection>) -> Self {
    Self {
      frame_index,
      items: items.into_boxed_slice(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
  Yolov5,
  Yolov7,
}

impl FromStr for Architecture {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "yolov5" | "yolov5s" | "yolov5m" => Ok(Architecture::Yolov5),
      "yolov7" | "yolov7-tiny" => Ok(Architecture::Yolov7),
      _ => Err(ConfigError::UnknownArchitecture(s.to_string())),
    }
  }
}

impl fmt::Display for Architecture {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Architecture::Yolov5 => f.write_str("yolov5"),
      Architecture::Yolov7 => f.write_str("yolov7"),
    }
  }
}

impl Architecture {
  /// 每个尺度的三个锚框 (宽, 高)，按特征图从小到大（步长从大到小）排列，
  /// 与按字节数升序排序后的输出流一一对应。
  pub fn anchors(&self) -> Vec<[[f32; 2]; ANCHORS_PER_SCALE]> {
    match self {
      Architecture::Yolov5 => vec![
        [[116.0, 90.0], [156.0, 198.0], [373.0, 326.0]],
        [[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]],
        [[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]],
      ],
      Architecture::Yolov7 => vec![
        [[142.0, 110.0], [192.0, 243.0], [459.0, 401.0]],
        [[36.0, 75.0], [76.0, 55.0], [72.0, 146.0]],
        [[12.0, 16.0], [19.0, 36.0], [40.0, 28.0]],
      ],
    }
  }
}

/// 解码所需的模型结构参数
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
  pub architecture: Architecture,
  pub classes: usize,
  pub input: TensorShape,
  pub anchors: Vec<[[f32; 2]; ANCHORS_PER_SCALE]>,
}

impl ModelConfig {
  pub fn new(architecture: Architecture, input: TensorShape, classes: usize) -> Self {
    Self {
      architecture,
      classes,
      input,
      anchors: architecture.anchors(),
    }
  }

  pub fn coco(architecture: Architecture, input: TensorShape) -> Self {
    Self::new(architecture, input, COCO_CLASSES)
  }

  pub fn scales(&self) -> usize {
    self.anchors.len()
  }

  pub fn channels_per_anchor(&self) -> usize {
    BOX_CHANNELS + self.classes
  }

  pub fn channels_per_scale(&self) -> usize {
    ANCHORS_PER_SCALE * self.channels_per_anchor()
  }

  /// 检查设备输出流与模型结构是否一致
  pub fn validate_outputs(&self, outputs: &[StreamInfo]) -> Result<(), ConfigError> {
    if outputs.len() != self.scales() {
      return Err(ConfigError::OutputCount {
        expected: self.scales(),
        found: outputs.len(),
      });
    }
    let expected = self.channels_per_scale();
    if let Some(bad) = outputs.iter().find(|o| o.shape.channels != expected) {
      return Err(ConfigError::ChannelMismatch {
        stream: bad.name.clone(),
        expected,
        found: bad.shape.channels,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stream::QuantInfo;

  #[test]
  fn fields_keep_ring_order() {
    let detection = Detection {
      ymin: 1.0,
      xmin: 2.0,
      ymax: 3.0,
      xmax: 4.0,
      confidence: 0.75,
      class_id: 17,
    };
    assert_eq!(detection.to_fields(), [1.0, 2.0, 3.0, 4.0, 0.75, 17.0]);
    assert_eq!(Detection::from_fields(&detection.to_fields()), detection);
    assert_eq!(detection.label(), Some("horse"));
  }

  #[test]
  fn iou_of_disjoint_and_identical_boxes() {
    let a = Detection {
      ymin: 0.0,
      xmin: 0.0,
      ymax: 10.0,
      xmax: 10.0,
      confidence: 1.0,
      class_id: 0,
    };
    let b = Detection {
      xmin: 20.0,
      xmax: 30.0,
      ..a
    };
    assert_eq!(a.iou(&a), 1.0);
    assert_eq!(a.iou(&b), 0.0);
  }

  #[test]
  fn architecture_tags() {
    assert_eq!("YOLOv5".parse::<Architecture>().unwrap(), Architecture::Yolov5);
    assert_eq!("yolov7".parse::<Architecture>().unwrap(), Architecture::Yolov7);
    assert!(matches!(
      "ssd".parse::<Architecture>(),
      Err(ConfigError::UnknownArchitecture(_))
    ));
  }

  #[test]
  fn output_validation() {
    let config = ModelConfig::coco(Architecture::Yolov5, TensorShape::new(640, 640, 3));
    let stream = |grid, channels| {
      StreamInfo::new("out", TensorShape::new(grid, grid, channels), QuantInfo::default())
    };
    assert!(config
      .validate_outputs(&[stream(20, 255), stream(40, 255), stream(80, 255)])
      .is_ok());
    assert!(matches!(
      config.validate_outputs(&[stream(20, 255), stream(40, 255)]),
      Err(ConfigError::OutputCount { expected: 3, found: 2 })
    ));
    assert!(matches!(
      config.validate_outputs(&[stream(20, 255), stream(40, 85), stream(80, 255)]),
      Err(ConfigError::ChannelMismatch { expected: 255, found: 85, .. })
    ));
  }
}
