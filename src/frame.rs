// 该文件是 Liushui （流水） 项目的一部分。
// src/frame.rs - NHWC 帧定义
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

use crate::{
  buffer::{AlignedBuffer, BufferError},
  stream::TensorShape,
};

pub const RGB_CHANNELS: usize = 3;

/// 一帧 RGB 图像，HWC 排列，存放在页对齐内存中以便直接提交给加速器
#[derive(Debug)]
pub struct Frame {
  index: u64,
  shape: TensorShape,
  data: AlignedBuffer,
}

impl Frame {
  pub fn with_shape(index: u64, height: usize, width: usize) -> Result<Self, BufferError> {
    let shape = TensorShape::new(height, width, RGB_CHANNELS);
    Ok(Self {
      index,
      shape,
      data: AlignedBuffer::new(shape.frame_size())?,
    })
  }

  pub fn from_slice(
    index: u64,
    height: usize,
    width: usize,
    data: &[u8],
  ) -> Result<Self, BufferError> {
    let shape = TensorShape::new(height, width, RGB_CHANNELS);
    if data.len() != shape.frame_size() {
      return Err(BufferError::SizeMismatch {
        expected: shape.frame_size(),
        found: data.len(),
      });
    }
    Ok(Self {
      index,
      shape,
      data: AlignedBuffer::from_slice(data)?,
    })
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn set_index(&mut self, index: u64) {
    self.index = index;
  }

  pub fn shape(&self) -> TensorShape {
    self.shape
  }

  pub fn height(&self) -> usize {
    self.shape.height
  }

  pub fn width(&self) -> usize {
    self.shape.width
  }

  pub fn channels(&self) -> usize {
    self.shape.channels
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for Frame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl AsRef<[u8]> for Frame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(feature = "image")]
mod rgb_image {
  use image::{ImageBuffer, Rgb, RgbImage};

  use super::Frame;
  use crate::buffer::BufferError;

  impl Frame {
    pub fn from_rgb_image(index: u64, image: &RgbImage) -> Result<Self, BufferError> {
      let (width, height) = image.dimensions();
      Frame::from_slice(index, height as usize, width as usize, image.as_raw())
    }

    pub fn to_rgb_image(&self) -> RgbImage {
      let width = self.width() as u32;
      let height = self.height() as u32;
      let data = self.as_nhwc();

      ImageBuffer::from_fn(width, height, |x, y| {
        let idx = (y as usize * width as usize + x as usize) * 3;
        Rgb([data[idx], data[idx + 1], data[idx + 2]])
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_is_aligned_and_sized() {
    let frame = Frame::with_shape(3, 4, 5).unwrap();
    assert_eq!(frame.index(), 3);
    assert_eq!(frame.as_nhwc().len(), 4 * 5 * 3);
    assert_eq!(frame.shape(), TensorShape::new(4, 5, 3));
  }

  #[test]
  fn from_slice_checks_length() {
    assert!(Frame::from_slice(0, 2, 2, &[0; 12]).is_ok());
    assert!(Frame::from_slice(0, 2, 2, &[0; 11]).is_err());
  }

  #[cfg(feature = "image")]
  #[test]
  fn rgb_image_round_trip_keeps_pixels() {
    let image = image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8, y as u8, 7]));
    let frame = Frame::from_rgb_image(0, &image).unwrap();
    assert_eq!(&frame.as_nhwc()[..6], &[0, 0, 7, 1, 0, 7]);
    assert_eq!(frame.to_rgb_image(), image);
  }
}
