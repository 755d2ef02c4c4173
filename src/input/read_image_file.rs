// 该文件是 Liushui （流水） 项目的一部分。
// src/input/read_image_file.rs - 图像目录输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::{FrameSource, InputError};
use crate::{FromUrl, FromUrlWithScheme, frame::Frame, stream::TensorShape};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ImageDirInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误 {path}: {source}")]
  ImageLoadError {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("目录 {0} 中没有图像")]
  Empty(PathBuf),
}

/// 按文件名顺序读取目录中的图像。
///
/// `images:///path/to/dir?resize`：带 `resize` 时缩放到模型输入尺寸。
pub struct ImageDirInput {
  files: Vec<PathBuf>,
  cursor: usize,
  dimensions: (usize, usize),
  resize: bool,
  target: Option<(usize, usize)>,
}

impl FromUrlWithScheme for ImageDirInput {
  const SCHEME: &'static str = "images";
}

impl FromUrl for ImageDirInput {
  type Error = ImageDirInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageDirInputError::SchemaMismatch);
    }

    let resize = url.query_pairs().any(|(k, _)| k == "resize");
    ImageDirInput::open(url.path(), resize)
  }
}

impl ImageDirInput {
  pub fn open(directory: impl AsRef<Path>, resize: bool) -> Result<Self, ImageDirInputError> {
    let directory = directory.as_ref();
    let mut files: Vec<PathBuf> = std::fs::read_dir(directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| {
        path.is_file()
          && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
      })
      .collect();
    files.sort();

    let first = files
      .first()
      .ok_or_else(|| ImageDirInputError::Empty(directory.to_path_buf()))?;
    let (width, height) = image::image_dimensions(first).map_err(|source| {
      ImageDirInputError::ImageLoadError {
        path: first.clone(),
        source,
      }
    })?;
    info!("图像目录 {}: {} 个文件", directory.display(), files.len());

    Ok(Self {
      files,
      cursor: 0,
      dimensions: (height as usize, width as usize),
      resize,
      target: None,
    })
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  fn load(&self, path: &Path) -> Result<RgbImage, ImageDirInputError> {
    let load_error = |source| ImageDirInputError::ImageLoadError {
      path: path.to_path_buf(),
      source,
    };
    let image = ImageReader::open(path)?
      .with_guessed_format()?
      .decode()
      .map_err(load_error)?
      .into_rgb8();

    match self.target {
      Some((height, width)) if image.dimensions() != (width as u32, height as u32) => {
        debug!(
          "缩放 {}: {:?} -> {}x{}",
          path.display(),
          image.dimensions(),
          width,
          height
        );
        Ok(image::imageops::resize(
          &image,
          width as u32,
          height as u32,
          FilterType::Triangle,
        ))
      }
      _ => Ok(image),
    }
  }
}

impl FrameSource for ImageDirInput {
  fn dimensions(&self) -> (usize, usize) {
    self.target.unwrap_or(self.dimensions)
  }

  fn fit_model(&mut self, input: &TensorShape) {
    if self.resize {
      self.target = Some((input.height, input.width));
    }
  }

  fn next_frame(&mut self) -> Result<Option<Frame>, InputError> {
    let Some(path) = self.files.get(self.cursor) else {
      return Ok(None);
    };
    let image = self.load(path)?;
    let frame = Frame::from_rgb_image(self.cursor as u64, &image)?;
    self.cursor += 1;
    Ok(Some(frame))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_image(dir: &Path, name: &str, width: u32, height: u32) {
    RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]))
      .save(dir.join(name))
      .unwrap();
  }

  #[test]
  fn reads_images_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "b.png", 4, 2);
    write_image(dir.path(), "a.png", 4, 2);
    std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();

    let url = Url::parse(&format!("images://{}", dir.path().display())).unwrap();
    let mut input = ImageDirInput::from_url(&url).unwrap();
    assert_eq!(input.len(), 2);
    assert_eq!(input.dimensions(), (2, 4));

    let first = input.next_frame().unwrap().unwrap();
    assert_eq!(first.index(), 0);
    assert_eq!(&first.as_nhwc()[..3], &[10, 20, 30]);
    assert!(input.next_frame().unwrap().is_some());
    assert!(input.next_frame().unwrap().is_none());
  }

  #[test]
  fn resize_only_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "a.png", 4, 2);
    let model = TensorShape::new(8, 8, 3);

    let mut fixed = ImageDirInput::open(dir.path(), false).unwrap();
    fixed.fit_model(&model);
    assert_eq!(fixed.dimensions(), (2, 4));

    let mut resized = ImageDirInput::open(dir.path(), true).unwrap();
    resized.fit_model(&model);
    assert_eq!(resized.dimensions(), (8, 8));
    assert_eq!(resized.next_frame().unwrap().unwrap().shape(), model);
  }

  #[test]
  fn empty_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      ImageDirInput::open(dir.path(), false),
      Err(ImageDirInputError::Empty(_))
    ));
  }
}
