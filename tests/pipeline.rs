// 该文件是 Liushui （流水） 项目的一部分。
// tests/pipeline.rs - 流水线集成测试
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

use std::{thread, time::Duration};

use parking_lot::Mutex;

use liushui::{
  device::{
    Injection, NetworkDescription, ObjectInjector, SimulatedDevice, SimulatedDeviceBuilder,
    TransferError,
  },
  frame::Frame,
  input::{FrameSource, InputError, SyntheticInput},
  model::{Architecture, ConfigError, DetectResult, ModelConfig},
  output::{OutputError, OutputWrapper, Render},
  pipeline::{
    BlockingPipeline, CallbackPipeline, PipelineConfig, PipelineError, RunReport, RunState,
  },
  ring::{OverwritePolicy, ResultRing, RingError},
  stream::{QuantInfo, StreamInfo, TensorShape},
  task::{BlockingTask, CallbackTask, Task, TaskOptions},
};

const CLASSES: usize = 3;
const CHANNELS: usize = 3 * (5 + CLASSES);

/// 64x64 输入，三个输出按设备顺序为 4x4、8x8、2x2
fn small_network() -> NetworkDescription {
  let quant = QuantInfo::new(128, 0.1);
  let output = |name: &str, grid: usize| {
    StreamInfo::new(name, TensorShape::new(grid, grid, CHANNELS), quant)
  };
  NetworkDescription {
    name: "tiny".to_string(),
    input: StreamInfo::new("tiny/input", TensorShape::new(64, 64, 3), QuantInfo::default()),
    outputs: vec![output("tiny/mid", 4), output("tiny/fine", 8), output("tiny/coarse", 2)],
  }
}

fn small_model() -> ModelConfig {
  ModelConfig::new(Architecture::Yolov5, TensorShape::new(64, 64, 3), CLASSES)
}

/// 在最粗的尺度上放一个类别为 2 的目标
fn one_object() -> ObjectInjector {
  ObjectInjector::new(vec![Injection {
    grid_width: 2,
    row: 1,
    col: 0,
    anchor: 0,
    class_id: 2,
  }])
}

fn small_device() -> SimulatedDevice {
  SimulatedDeviceBuilder::new(small_network())
    .synthesizer(one_object())
    .build()
    .unwrap()
}

#[derive(Clone, Copy, Debug)]
enum Variant {
  Blocking,
  Callback,
}

const VARIANTS: [Variant; 2] = [Variant::Blocking, Variant::Callback];

fn run_variant<S: FrameSource>(
  variant: Variant,
  device: &SimulatedDevice,
  model: ModelConfig,
  config: PipelineConfig,
  source: S,
  ring: &ResultRing<'_>,
  render: Option<&(dyn Render<Frame, DetectResult, Error = OutputError> + Sync)>,
) -> Result<RunReport, PipelineError> {
  match variant {
    Variant::Blocking => BlockingPipeline::new(device, model, config)?.run(source, ring, render),
    Variant::Callback => CallbackPipeline::new(device, model, config)?.run(source, ring, render),
  }
}

#[derive(Default)]
struct Collect {
  seen: Mutex<Vec<(u64, u64, usize)>>,
}

impl Render<Frame, DetectResult> for Collect {
  type Error = OutputError;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    self
      .seen
      .lock()
      .push((frame.index(), result.frame_index, result.len()));
    Ok(())
  }
}

/// 尺寸固定、不会适配模型的输入
struct FixedSource;

impl FrameSource for FixedSource {
  fn dimensions(&self) -> (usize, usize) {
    (32, 32)
  }

  fn next_frame(&mut self) -> Result<Option<Frame>, InputError> {
    Ok(Some(Frame::with_shape(0, 32, 32)?))
  }
}

/// 每帧之前先睡一会儿，模拟慢速相机
struct PacedSource {
  inner: SyntheticInput,
  pause: Duration,
}

impl FrameSource for PacedSource {
  fn dimensions(&self) -> (usize, usize) {
    self.inner.dimensions()
  }

  fn next_frame(&mut self) -> Result<Option<Frame>, InputError> {
    thread::sleep(self.pause);
    self.inner.next_frame()
  }
}

#[test]
fn every_submitted_frame_is_decoded_and_published() {
  for variant in VARIANTS {
    // 输出端比输入慢，输入结束时设备里仍有待读的帧
    let device = SimulatedDeviceBuilder::new(small_network())
      .synthesizer(one_object())
      .latency(Duration::from_millis(5))
      .build()
      .unwrap();
    let config = PipelineConfig::default().with_buffer_size(16);
    let ring = config.result_ring().unwrap();
    let report = run_variant(
      variant,
      &device,
      small_model(),
      config,
      SyntheticInput::new(Some(10), 64, 64),
      &ring,
      None,
    )
    .unwrap();

    assert_eq!(report.frames_in, 10, "{:?}", variant);
    assert_eq!(report.frames_decoded, 10, "{:?}", variant);
    assert_eq!(report.frames_out, vec![10, 10, 10], "{:?}", variant);
    assert_eq!(report.detections, 10, "{:?}", variant);
    assert_eq!(device.frames_written(), 10);
    for frame in 0..10u64 {
      let detections = ring.take(ring.slot_for(frame)).unwrap();
      assert_eq!(detections.len(), 1);
      assert_eq!(detections[0].class_id, 2);
    }
    assert_eq!(ring.poll(ring.slot_for(10)), None);
  }
}

#[test]
fn source_slower_than_transfer_timeout_is_not_a_fault() {
  for variant in VARIANTS {
    let device = small_device();
    let config = PipelineConfig::default().with_transfer_timeout(Duration::from_millis(100));
    let ring = config.result_ring().unwrap();
    let source = PacedSource {
      inner: SyntheticInput::new(Some(3), 64, 64),
      pause: Duration::from_millis(300),
    };
    let report = run_variant(variant, &device, small_model(), config, source, &ring, None)
      .unwrap_or_else(|e| panic!("{:?}: {}", variant, e));

    assert_eq!(report.frames_in, 3, "{:?}", variant);
    assert_eq!(report.frames_decoded, 3, "{:?}", variant);
    assert_eq!(report.frames_out, vec![3, 3, 3], "{:?}", variant);
  }
}

#[test]
fn empty_source_finishes_immediately() {
  for variant in VARIANTS {
    let device = small_device();
    let config = PipelineConfig::default();
    let ring = config.result_ring().unwrap();
    let report = run_variant(
      variant,
      &device,
      small_model(),
      config,
      SyntheticInput::new(Some(0), 64, 64),
      &ring,
      None,
    )
    .unwrap();
    assert_eq!(report.frames_in, 0);
    assert_eq!(report.frames_decoded, 0);
  }
}

#[test]
fn each_scale_contributes_in_size_order() {
  let description = NetworkDescription::yolov5_640(80);
  let injections = vec![
    Injection {
      grid_width: 80,
      row: 40,
      col: 41,
      anchor: 2,
      class_id: 3,
    },
    Injection {
      grid_width: 20,
      row: 5,
      col: 6,
      anchor: 0,
      class_id: 1,
    },
    Injection {
      grid_width: 40,
      row: 10,
      col: 12,
      anchor: 1,
      class_id: 2,
    },
  ];
  let device = SimulatedDeviceBuilder::new(description)
    .synthesizer(ObjectInjector::new(injections))
    .build()
    .unwrap();
  let model = ModelConfig::coco(Architecture::Yolov5, TensorShape::new(640, 640, 3));
  let config = PipelineConfig::default();
  let ring = config.result_ring().unwrap();
  BlockingPipeline::new(&device, model, config)
    .unwrap()
    .run(SyntheticInput::new(Some(1), 640, 640), &ring, None)
    .unwrap();

  let detections = ring.take(0).unwrap();
  let classes: Vec<u32> = detections.iter().map(|d| d.class_id).collect();
  assert_eq!(classes, vec![1, 2, 3]);

  // 20x20, 步长 32, 锚框 116x90, 框回归为 0 时中心在格点中央
  let coarse = detections[0];
  let close = |a: f32, b: f32| (a - b).abs() < 1e-3;
  assert!(close(coarse.xmin, 208.0 - 58.0), "{:?}", coarse);
  assert!(close(coarse.xmax, 208.0 + 58.0), "{:?}", coarse);
  assert!(close(coarse.ymin, 176.0 - 45.0), "{:?}", coarse);
  assert!(close(coarse.ymax, 176.0 + 45.0), "{:?}", coarse);
  assert!(coarse.confidence > 0.99);

  // 40x40, 步长 16, 锚框 62x45
  let mid = detections[1];
  assert!(close((mid.xmin + mid.xmax) / 2.0, 12.5 * 16.0), "{:?}", mid);
  assert!(close(mid.xmax - mid.xmin, 62.0), "{:?}", mid);

  // 80x80, 步长 8, 锚框 33x23
  let fine = detections[2];
  assert!(close((fine.ymin + fine.ymax) / 2.0, 40.5 * 8.0), "{:?}", fine);
  assert!(close(fine.ymax - fine.ymin, 23.0), "{:?}", fine);
}

#[test]
fn output_fault_is_fatal_and_reported_once() {
  for variant in VARIANTS {
    let device = SimulatedDeviceBuilder::new(small_network())
      .synthesizer(one_object())
      .fail_output_after(1, 3)
      .build()
      .unwrap();
    let config = PipelineConfig::default();
    let ring = config.result_ring().unwrap();
    let err = run_variant(
      variant,
      &device,
      small_model(),
      config,
      SyntheticInput::new(None, 64, 64),
      &ring,
      None,
    )
    .unwrap_err();

    match err {
      PipelineError::Transfer { stage, source } => {
        assert!(stage.contains("tiny/fine"), "{:?}: {}", variant, stage);
        assert!(
          matches!(source, TransferError::Device { code: -1, .. }),
          "{:?}: {:?}",
          variant,
          source
        );
      }
      other => panic!("{:?}: 意外的错误 {:?}", variant, other),
    }
    // 回调式流水线按帧序收到故障，之前的帧都已发布
    if let Variant::Callback = variant {
      for frame in 0..3u64 {
        assert!(ring.poll(ring.slot_for(frame)).is_some());
      }
    }
  }
}

#[test]
fn fatal_error_aborts_the_run_state() {
  let device = SimulatedDeviceBuilder::new(small_network())
    .fail_output_after(0, 0)
    .build()
    .unwrap();
  let pipeline =
    BlockingPipeline::new(&device, small_model(), PipelineConfig::default()).unwrap();
  let control = pipeline.control();
  let ring = ResultRing::new(4, 4, OverwritePolicy::Overwrite).unwrap();
  assert!(
    pipeline
      .run(SyntheticInput::new(None, 64, 64), &ring, None)
      .is_err()
  );
  assert_eq!(control.state(), RunState::Aborted);
}

#[test]
fn mismatched_frames_are_rejected_before_start() {
  for variant in VARIANTS {
    let device = small_device();
    let config = PipelineConfig::default();
    let ring = config.result_ring().unwrap();
    let err = run_variant(variant, &device, small_model(), config, FixedSource, &ring, None)
      .unwrap_err();
    assert!(matches!(
      err,
      PipelineError::FrameSizeMismatch {
        expected: (64, 64),
        found: (32, 32)
      }
    ));
    assert_eq!(device.frames_written(), 0);
  }
}

#[test]
fn output_layout_is_validated_at_construction() {
  let mut description = small_network();
  description.outputs.pop();
  let device = SimulatedDeviceBuilder::new(description).build().unwrap();
  let err = BlockingPipeline::new(&device, small_model(), PipelineConfig::default())
    .err()
    .unwrap();
  assert!(matches!(
    err,
    PipelineError::Config(ConfigError::OutputCount {
      expected: 3,
      found: 2
    })
  ));

  let device = small_device();
  let wrong_classes = ModelConfig::new(Architecture::Yolov5, TensorShape::new(64, 64, 3), 80);
  let err = CallbackPipeline::new(&device, wrong_classes, PipelineConfig::default())
    .err()
    .unwrap();
  assert!(matches!(
    err,
    PipelineError::Config(ConfigError::ChannelMismatch { .. })
  ));

  let err = BlockingPipeline::new(
    &device,
    small_model(),
    PipelineConfig::default().with_threshold(-0.1),
  )
  .err()
  .unwrap();
  assert!(matches!(
    err,
    PipelineError::Config(ConfigError::InvalidThreshold(_))
  ));
}

#[test]
fn stop_request_drains_frames_already_submitted() {
  for variant in VARIANTS {
    let device = SimulatedDeviceBuilder::new(small_network())
      .synthesizer(one_object())
      .latency(Duration::from_millis(1))
      .build()
      .unwrap();
    let config = PipelineConfig::default().with_buffer_size(1024);
    let ring = config.result_ring().unwrap();
    let model = small_model();
    let source = SyntheticInput::new(None, 64, 64);

    let report = thread::scope(|s| {
      let stop = |control: std::sync::Arc<liushui::pipeline::RunControl>| {
        s.spawn(move || {
          thread::sleep(Duration::from_millis(50));
          control.request_stop();
        });
      };
      match variant {
        Variant::Blocking => {
          let pipeline = BlockingPipeline::new(&device, model, config).unwrap();
          stop(pipeline.control());
          pipeline.run(source, &ring, None)
        }
        Variant::Callback => {
          let pipeline = CallbackPipeline::new(&device, model, config).unwrap();
          stop(pipeline.control());
          pipeline.run(source, &ring, None)
        }
      }
    })
    .unwrap();

    assert!(report.frames_in > 0, "{:?}", variant);
    assert_eq!(report.frames_decoded, report.frames_in, "{:?}", variant);
    assert_eq!(report.detections, report.frames_in, "{:?}", variant);
  }
}

#[test]
fn render_sink_sees_frames_in_order() {
  for variant in VARIANTS {
    let device = small_device();
    let config = PipelineConfig::default();
    let ring = config.result_ring().unwrap();
    let collect = Collect::default();
    run_variant(
      variant,
      &device,
      small_model(),
      config,
      SyntheticInput::new(Some(5), 64, 64),
      &ring,
      Some(&collect),
    )
    .unwrap();

    let seen = collect.seen.into_inner();
    let expected: Vec<_> = (0..5u64).map(|i| (i, i, 1)).collect();
    assert_eq!(seen, expected, "{:?}", variant);
  }
}

#[test]
fn reject_policy_surfaces_unconsumed_slot() {
  let device = small_device();
  let config = PipelineConfig::default()
    .with_buffer_size(2)
    .with_overwrite_policy(OverwritePolicy::Reject);
  let ring = config.result_ring().unwrap();
  let err = run_variant(
    Variant::Blocking,
    &device,
    small_model(),
    config,
    SyntheticInput::new(Some(5), 64, 64),
    &ring,
    None,
  )
  .unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Ring(RingError::SlotNotConsumed {
      slot: 0,
      frame_index: 2
    })
  ));
}

#[test]
fn overwrite_policy_keeps_latest_frames() {
  let device = small_device();
  let config = PipelineConfig::default().with_buffer_size(4);
  let ring = config.result_ring().unwrap();
  let report = run_variant(
    Variant::Callback,
    &device,
    small_model(),
    config,
    SyntheticInput::new(Some(10), 64, 64),
    &ring,
    None,
  )
  .unwrap();
  assert_eq!(report.frames_decoded, 10);
  for slot in 0..4 {
    assert_eq!(ring.poll(slot), Some(1));
  }
}

#[test]
fn tasks_run_with_a_ring_consumer() {
  let options = TaskOptions::new(Architecture::Yolov5, PipelineConfig::default().with_buffer_size(2))
    .with_interrupt(false);

  // 任务使用 COCO 类别数，需要 80 类的网络
  let description = NetworkDescription::yolov5_640(80);
  let device = SimulatedDeviceBuilder::new(description.clone()).build().unwrap();
  let report = BlockingTask(options.clone())
    .run_task(SyntheticInput::new(Some(4), 640, 640), &device, None::<OutputWrapper>)
    .unwrap();
  assert_eq!(report.frames_decoded, 4);
  assert_eq!(report.detections, 0);

  let device = SimulatedDeviceBuilder::new(description).build().unwrap();
  let report = CallbackTask(options)
    .run_task(SyntheticInput::new(Some(4), 640, 640), &device, None::<OutputWrapper>)
    .unwrap();
  assert_eq!(report.frames_decoded, 4);
}
