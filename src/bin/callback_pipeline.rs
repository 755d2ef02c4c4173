// 该文件是 Liushui （流水） 项目的一部分。
// src/bin/callback_pipeline.rs - 回调式流水线
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use url::Url;

use liushui::{
  FromUrl,
  device::SimulatedDeviceBuilder,
  input::InputWrapper,
  model::Architecture,
  output::OutputWrapper,
  pipeline::PipelineConfig,
  ring::OverwritePolicy,
  task::{CallbackTask, Task, TaskOptions},
};
use tracing::info;

/// Liushui 回调式流水线
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 加速器，如 simulated:///path/model.json?latency_ms=5&demo
  #[arg(long, value_name = "DEVICE", default_value = "simulated:///?demo")]
  pub device: Url,
  /// 输入来源，如 synthetic:// 持续运行，Ctrl-C 停止
  #[arg(long, value_name = "SOURCE", default_value = "synthetic://")]
  pub input: Url,
  /// 渲染输出，如 folder:///path 或 jsonl:///path/result.jsonl
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  #[arg(long, default_value = "yolov5")]
  pub arch: Architecture,
  #[arg(long, default_value_t = 0.3, value_name = "THRESHOLD")]
  pub threshold: f32,
  #[arg(long, value_name = "THRESHOLD")]
  pub nms: Option<f32>,
  #[arg(long, default_value_t = 100)]
  pub max_detections: usize,
  #[arg(long, default_value_t = 16)]
  pub buffer_size: usize,
  /// 每个输出流的在途异步读数
  #[arg(long, default_value_t = 4)]
  pub queue_depth: usize,
  /// 结果环槽位未被消费时等待的毫秒数，不给则直接覆盖
  #[arg(long, value_name = "MS")]
  pub block_ms: Option<u64>,
  #[arg(long, default_value_t = 1000)]
  pub timeout_ms: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("加速器: {}", args.device);
  info!("输入来源: {}", args.input);

  let device = SimulatedDeviceBuilder::from_url(&args.device)?.build()?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = args.output.as_ref().map(OutputWrapper::from_url).transpose()?;

  let overwrite = match args.block_ms {
    Some(ms) => OverwritePolicy::Block {
      timeout: Duration::from_millis(ms),
    },
    None => OverwritePolicy::Overwrite,
  };
  let config = PipelineConfig::default()
    .with_threshold(args.threshold)
    .with_nms_threshold(args.nms)
    .with_max_detections(args.max_detections)
    .with_buffer_size(args.buffer_size)
    .with_queue_depth(args.queue_depth)
    .with_overwrite_policy(overwrite)
    .with_transfer_timeout(Duration::from_millis(args.timeout_ms));
  let task = CallbackTask(TaskOptions::new(args.arch, config).with_interrupt(true));
  let report = task.run_task(input, &device, output)?;

  info!("共处理 {} 帧, {:.2} FPS", report.frames_decoded, report.fps());
  Ok(())
}
