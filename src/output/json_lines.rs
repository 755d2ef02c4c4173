// 该文件是 Liushui （流水） 项目的一部分。
// src/output/json_lines.rs - JSON 行输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::PathBuf,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{DetectResult, Detection},
  output::Render,
};

#[derive(Error, Debug)]
pub enum JsonLinesOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct LabeledDetection<'a> {
  label: Option<&'static str>,
  #[serde(flatten)]
  detection: &'a Detection,
}

#[derive(Serialize)]
struct FrameLine<'a> {
  frame_index: u64,
  width: usize,
  height: usize,
  detections: Vec<LabeledDetection<'a>>,
}

/// 每帧一行 JSON：`jsonl:///path/to/result.jsonl`
pub struct JsonLinesOutput {
  path: PathBuf,
  writer: Mutex<BufWriter<File>>,
}

impl FromUrlWithScheme for JsonLinesOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonLinesOutputError::SchemeMismatch);
    }
    let path = PathBuf::from(url.path());
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    info!("检测结果写入 {}", path.display());
    let file = File::create(&path)?;
    Ok(Self {
      path,
      writer: Mutex::new(BufWriter::new(file)),
    })
  }
}

impl JsonLinesOutput {
  pub fn path(&self) -> &std::path::Path {
    &self.path
  }
}

impl Render<Frame, DetectResult> for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    let line = FrameLine {
      frame_index: result.frame_index,
      width: frame.width(),
      height: frame.height(),
      detections: result
        .items
        .iter()
        .map(|detection| LabeledDetection {
          label: detection.label(),
          detection,
        })
        .collect(),
    };
    let mut writer = self.writer.lock();
    serde_json::to_writer(&mut *writer, &line)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}
