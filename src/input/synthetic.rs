// 该文件是 Liushui （流水） 项目的一部分。
// src/input/synthetic.rs - 合成帧输入
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

use tracing::debug;
use url::Url;

use super::{FrameSource, InputError};
use crate::{FromUrl, FromUrlWithScheme, frame::Frame, stream::TensorShape};

const DEFAULT_SIZE: usize = 640;
const GRAY: u8 = 114;

/// 固定数量的灰色帧，用于基准测试和演示。
///
/// `synthetic://?frames=100&width=640&height=640`，不给 `frames` 时无限输出。
#[derive(Debug, Clone)]
pub struct SyntheticInput {
  frames: Option<u64>,
  height: usize,
  width: usize,
  produced: u64,
}

impl SyntheticInput {
  pub fn new(frames: Option<u64>, height: usize, width: usize) -> Self {
    Self {
      frames,
      height,
      width,
      produced: 0,
    }
  }

  pub fn produced(&self) -> u64 {
    self.produced
  }
}

impl FromUrlWithScheme for SyntheticInput {
  const SCHEME: &'static str = "synthetic";
}

impl FromUrl for SyntheticInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch);
    }

    let mut input = SyntheticInput::new(None, DEFAULT_SIZE, DEFAULT_SIZE);
    for (key, value) in url.query_pairs() {
      let parsed: usize = value
        .parse()
        .map_err(|_| InputError::InvalidArgument(format!("{}={}", key, value)))?;
      match key.as_ref() {
        "frames" => input.frames = Some(parsed as u64),
        "width" => input.width = parsed,
        "height" => input.height = parsed,
        _ => return Err(InputError::InvalidArgument(key.into_owned())),
      }
    }
    debug!(
      "合成输入: {:?} 帧, {}x{}",
      input.frames, input.width, input.height
    );
    Ok(input)
  }
}

impl FrameSource for SyntheticInput {
  fn dimensions(&self) -> (usize, usize) {
    (self.height, self.width)
  }

  /// 合成帧可以直接生成任意尺寸
  fn fit_model(&mut self, input: &TensorShape) {
    self.height = input.height;
    self.width = input.width;
  }

  fn next_frame(&mut self) -> Result<Option<Frame>, InputError> {
    if self.frames.is_some_and(|n| self.produced >= n) {
      return Ok(None);
    }
    let mut frame = Frame::with_shape(self.produced, self.height, self.width)?;
    frame.as_mut().fill(GRAY);
    self.produced += 1;
    Ok(Some(frame))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn produces_exactly_n_frames() {
    let url = Url::parse("synthetic://?frames=3&width=8&height=4").unwrap();
    let mut input = SyntheticInput::from_url(&url).unwrap();
    assert_eq!(input.dimensions(), (4, 8));
    let mut indices = Vec::new();
    while let Some(frame) = input.next_frame().unwrap() {
      assert_eq!(frame.as_nhwc().len(), 4 * 8 * 3);
      indices.push(frame.index());
    }
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(input.next_frame().unwrap().is_none());
  }

  #[test]
  fn fits_model_input() {
    let mut input = SyntheticInput::new(Some(1), 10, 10);
    input.fit_model(&TensorShape::new(32, 64, 3));
    assert_eq!(input.dimensions(), (32, 64));
  }

  #[test]
  fn unknown_parameter_is_rejected() {
    let url = Url::parse("synthetic://?fps=3").unwrap();
    assert!(matches!(
      SyntheticInput::from_url(&url),
      Err(InputError::InvalidArgument(_))
    ));
  }
}
