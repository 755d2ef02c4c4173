// 该文件是 Liushui （流水） 项目的一部分。
// src/ffi.rs - C 接口
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

//! 供其他语言调用的入口。
//!
//! 调用方提供检测结果数组（`buffer_size * max_detections * 6` 个 f32）
//! 和就绪计数数组（`buffer_size` 个 i32），流水线把第 n 帧写入槽位
//! `n % buffer_size`。就绪计数在开始时被置为 -1；调用方读完一个槽位后写回 -1。

use std::{
  ffi::{CStr, c_char, c_int},
  path::Path,
};

use tracing::{error, info};

use crate::{
  device::{NetworkDescription, SimulatedDeviceBuilder},
  input::InputError,
  model::{Architecture, ModelConfig},
  pipeline::{BlockingPipeline, PipelineConfig, PipelineError},
  ring::ResultRing,
};

pub const LIUSHUI_OK: c_int = 0;
pub const LIUSHUI_INVALID_ARGUMENT: c_int = -1;
pub const LIUSHUI_CONFIG_ERROR: c_int = -2;
pub const LIUSHUI_INPUT_ERROR: c_int = -3;
pub const LIUSHUI_PIPELINE_ERROR: c_int = -4;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// 库版本，静态字符串，调用方不得释放
#[unsafe(no_mangle)]
pub extern "C" fn liushui_version() -> *const c_char {
  VERSION.as_ptr().cast()
}

fn status_of(err: &PipelineError) -> c_int {
  match err {
    PipelineError::Config(_) | PipelineError::Device(_) | PipelineError::Ring(_) => {
      LIUSHUI_CONFIG_ERROR
    }
    PipelineError::Input(_) | PipelineError::FrameSizeMismatch { .. } => LIUSHUI_INPUT_ERROR,
    _ => LIUSHUI_PIPELINE_ERROR,
  }
}

/// # Safety
///
/// `ptr` 为空或指向以 NUL 结尾的字符串
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
  if ptr.is_null() {
    return None;
  }
  // SAFETY: 由调用方保证
  unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// 以阻塞式流水线处理 `images_path` 目录中的所有图片，结果写入调用方的数组。
///
/// `model_path` 是网络描述文件（JSON），`arch` 为 `yolov5` 或 `yolov7`。
/// 返回 0 表示成功；-1 参数错误，-2 配置或模型错误，-3 输入错误，-4 运行错误。
///
/// # Safety
///
/// 字符串参数必须是有效的 C 字符串；`detections` 与 `frames_ready`
/// 必须分别指向足够长的可写数组，并在调用返回前保持有效。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn liushui_infer(
  model_path: *const c_char,
  images_path: *const c_char,
  arch: *const c_char,
  conf_thr: f32,
  detections: *mut f32,
  max_detections: c_int,
  frames_ready: *mut i32,
  buffer_size: c_int,
) -> c_int {
  // SAFETY: 由调用方保证
  let (model_path, images_path, arch) =
    unsafe { (str_arg(model_path), str_arg(images_path), str_arg(arch)) };
  let (Some(model_path), Some(images_path), Some(arch)) = (model_path, images_path, arch) else {
    error!("字符串参数为空或不是有效的 UTF-8");
    return LIUSHUI_INVALID_ARGUMENT;
  };
  if max_detections <= 0 || buffer_size <= 0 {
    error!(
      "无效的数组尺寸: max_detections={}, buffer_size={}",
      max_detections, buffer_size
    );
    return LIUSHUI_INVALID_ARGUMENT;
  }
  let Ok(architecture) = arch.parse::<Architecture>() else {
    error!("未知的模型架构: {}", arch);
    return LIUSHUI_INVALID_ARGUMENT;
  };

  let config = PipelineConfig::default()
    .with_threshold(conf_thr)
    .with_max_detections(max_detections as usize)
    .with_buffer_size(buffer_size as usize);
  if let Err(e) = config.validate() {
    error!("配置错误: {}", e);
    return LIUSHUI_INVALID_ARGUMENT;
  }

  // SAFETY: 数组长度与有效期由调用方保证
  let ring = match unsafe {
    ResultRing::from_raw_parts(
      detections,
      frames_ready,
      config.buffer_size,
      config.max_detections,
      config.overwrite,
    )
  } {
    Ok(ring) => ring,
    Err(e) => {
      error!("结果数组无效: {}", e);
      return LIUSHUI_INVALID_ARGUMENT;
    }
  };
  ring.reset();

  match run(Path::new(model_path), Path::new(images_path), architecture, config, &ring) {
    Ok(()) => LIUSHUI_OK,
    Err(e) => {
      error!("推理失败: {}", e);
      status_of(&e)
    }
  }
}

fn run(
  model_path: &Path,
  images_path: &Path,
  architecture: Architecture,
  config: PipelineConfig,
  ring: &ResultRing<'_>,
) -> Result<(), PipelineError> {
  let description = NetworkDescription::load(model_path)?;
  let device = SimulatedDeviceBuilder::new(description).build()?;
  let model = ModelConfig::coco(architecture, device.description().input.shape);
  let pipeline = BlockingPipeline::new(&device, model, config)?;

  let source = open_images(images_path)?;
  let report = pipeline.run(source, ring, None)?;
  info!("C 接口推理完成: {} 帧", report.frames_decoded);
  Ok(())
}

#[cfg(feature = "read_image_file")]
fn open_images(path: &Path) -> Result<crate::input::ImageDirInput, PipelineError> {
  let source = crate::input::ImageDirInput::open(path, true).map_err(InputError::from)?;
  Ok(source)
}

#[cfg(not(feature = "read_image_file"))]
fn open_images(path: &Path) -> Result<crate::input::SyntheticInput, PipelineError> {
  Err(InputError::InvalidArgument(format!("未启用图片输入, 无法读取 {}", path.display())).into())
}
