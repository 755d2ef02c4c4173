// 该文件是 Liushui （流水） 项目的一部分。
// src/input.rs - 帧输入
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

use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme, buffer::BufferError, frame::Frame, stream::TensorShape};

mod synthetic;
pub use self::synthetic::SyntheticInput;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageDirInput, ImageDirInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像目录输入错误: {0}")]
  ImageDirInputError(#[from] ImageDirInputError),
  #[error("帧缓冲区错误: {0}")]
  Buffer(#[from] BufferError),
  #[error("无效的输入参数: {0}")]
  InvalidArgument(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 帧来源。`next_frame` 返回 `None` 表示输入结束。
pub trait FrameSource: Send {
  /// 当前输出帧的尺寸（高, 宽）
  fn dimensions(&self) -> (usize, usize);

  /// 请求输出与模型输入一致的帧。不支持缩放的来源保持原尺寸，由流水线校验。
  fn fit_model(&mut self, _input: &TensorShape) {}

  fn next_frame(&mut self) -> Result<Option<Frame>, InputError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn dimensions(&self) -> (usize, usize) {
    (**self).dimensions()
  }

  fn fit_model(&mut self, input: &TensorShape) {
    (**self).fit_model(input)
  }

  fn next_frame(&mut self) -> Result<Option<Frame>, InputError> {
    (**self).next_frame()
  }
}

pub enum InputWrapper {
  Synthetic(SyntheticInput),
  #[cfg(feature = "read_image_file")]
  ImageDir(ImageDirInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SyntheticInput::SCHEME => Ok(InputWrapper::Synthetic(SyntheticInput::from_url(url)?)),
      #[cfg(feature = "read_image_file")]
      ImageDirInput::SCHEME => Ok(InputWrapper::ImageDir(ImageDirInput::from_url(url)?)),
      _ => Err(InputError::SchemeMismatch),
    }
  }
}

impl FrameSource for InputWrapper {
  fn dimensions(&self) -> (usize, usize) {
    match self {
      InputWrapper::Synthetic(input) => input.dimensions(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageDir(input) => input.dimensions(),
    }
  }

  fn fit_model(&mut self, shape: &TensorShape) {
    match self {
      InputWrapper::Synthetic(input) => input.fit_model(shape),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageDir(input) => input.fit_model(shape),
    }
  }

  fn next_frame(&mut self) -> Result<Option<Frame>, InputError> {
    match self {
      InputWrapper::Synthetic(input) => input.next_frame(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageDir(input) => input.next_frame(),
    }
  }
}
