// 该文件是 Liushui （流水） 项目的一部分。
// src/ring.rs - 结果环形缓冲区
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

use std::{
  sync::atomic::{AtomicI32, AtomicU32, Ordering},
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::debug;

use crate::model::{DETECTION_FIELDS, Detection};

/// 槽位空闲或已被消费
pub const SLOT_FREE: i32 = -1;

const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// 目标槽位尚未被外部消费者确认时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
  /// 直接覆盖，旧结果丢失
  #[default]
  Overwrite,
  /// 等待消费者确认，超时则失败
  Block { timeout: Duration },
  /// 立即失败
  Reject,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
  #[error("槽位 {slot} 尚未被消费 (帧 {frame_index})")]
  SlotNotConsumed { slot: usize, frame_index: u64 },
  #[error("等待槽位 {slot} 被消费超时 ({timeout:?})")]
  ConsumerTimeout { slot: usize, timeout: Duration },
  #[error("结果环大小必须大于 0")]
  InvalidBufferSize,
  #[error("每槽最大检测数必须大于 0")]
  InvalidMaxDetections,
  #[error("结果环内存为空指针")]
  NullPointer,
}

enum Storage<'a> {
  Owned {
    detections: Box<[AtomicU32]>,
    ready: Box<[AtomicI32]>,
  },
  External {
    detections: &'a [AtomicU32],
    ready: &'a [AtomicI32],
  },
}

/// 解码线程与外部消费者之间的结果交接区。
///
/// 内存布局：`buffer_size * max_detections * 6` 个 f32（按 `[槽][检测][字段]` 排列，
/// 以位模式存放在 `AtomicU32` 中）与 `buffer_size` 个 i32 就绪计数。
/// 计数为 -1 表示空闲；`0..=max_detections` 表示结果已就绪，值为检测数。
/// 就绪计数是与消费者共享的唯一同步点：生产者先写字段，再以 Release 写计数；
/// 消费者以 Acquire 读计数后读取字段，读完写回 -1。
pub struct ResultRing<'a> {
  storage: Storage<'a>,
  buffer_size: usize,
  max_detections: usize,
  policy: OverwritePolicy,
}

fn check_sizes(buffer_size: usize, max_detections: usize) -> Result<(), RingError> {
  if buffer_size == 0 {
    return Err(RingError::InvalidBufferSize);
  }
  if max_detections == 0 {
    return Err(RingError::InvalidMaxDetections);
  }
  Ok(())
}

impl ResultRing<'static> {
  pub fn new(
    buffer_size: usize,
    max_detections: usize,
    policy: OverwritePolicy,
  ) -> Result<Self, RingError> {
    check_sizes(buffer_size, max_detections)?;
    let fields = buffer_size * max_detections * DETECTION_FIELDS;
    Ok(Self {
      storage: Storage::Owned {
        detections: (0..fields).map(|_| AtomicU32::new(0)).collect(),
        ready: (0..buffer_size).map(|_| AtomicI32::new(SLOT_FREE)).collect(),
      },
      buffer_size,
      max_detections,
      policy,
    })
  }
}

impl<'a> ResultRing<'a> {
  /// 在调用方提供的内存上建立结果环，不会改动其中已有的就绪计数。
  ///
  /// # Safety
  ///
  /// `detections` 必须指向 `buffer_size * max_detections * 6` 个 f32，
  /// `ready` 必须指向 `buffer_size` 个 i32，两者在 `'a` 期间有效，
  /// 且除本结果环与按本协议访问的消费者外没有其他写者。
  pub unsafe fn from_raw_parts(
    detections: *mut f32,
    ready: *mut i32,
    buffer_size: usize,
    max_detections: usize,
    policy: OverwritePolicy,
  ) -> Result<Self, RingError> {
    check_sizes(buffer_size, max_detections)?;
    if detections.is_null() || ready.is_null() {
      return Err(RingError::NullPointer);
    }
    let fields = buffer_size * max_detections * DETECTION_FIELDS;
    // SAFETY: AtomicU32/AtomicI32 与 f32/i32 大小、对齐相同；长度与生命周期由调用方保证
    let (detections, ready) = unsafe {
      (
        std::slice::from_raw_parts(detections as *const AtomicU32, fields),
        std::slice::from_raw_parts(ready as *const AtomicI32, buffer_size),
      )
    };
    Ok(Self {
      storage: Storage::External { detections, ready },
      buffer_size,
      max_detections,
      policy,
    })
  }

  fn detections(&self) -> &[AtomicU32] {
    match &self.storage {
      Storage::Owned { detections, .. } => detections,
      Storage::External { detections, .. } => detections,
    }
  }

  fn ready(&self) -> &[AtomicI32] {
    match &self.storage {
      Storage::Owned { ready, .. } => ready,
      Storage::External { ready, .. } => ready,
    }
  }

  pub fn buffer_size(&self) -> usize {
    self.buffer_size
  }

  pub fn max_detections(&self) -> usize {
    self.max_detections
  }

  pub fn policy(&self) -> OverwritePolicy {
    self.policy
  }

  pub fn slot_for(&self, frame_index: u64) -> usize {
    (frame_index % self.buffer_size as u64) as usize
  }

  /// 把所有槽位标记为空闲
  pub fn reset(&self) {
    for counter in self.ready() {
      counter.store(SLOT_FREE, Ordering::Release);
    }
  }

  /// 发布一帧结果，返回实际写入的检测数（超出上限的部分被丢弃）
  pub fn publish(&self, frame_index: u64, detections: &[Detection]) -> Result<usize, RingError> {
    let slot = self.slot_for(frame_index);
    let counter = &self.ready()[slot];

    let previous = counter.load(Ordering::Acquire);
    if previous != SLOT_FREE {
      match self.policy {
        OverwritePolicy::Overwrite => {
          debug!("覆盖未消费的槽位 {} (帧 {})", slot, frame_index);
        }
        OverwritePolicy::Reject => {
          return Err(RingError::SlotNotConsumed { slot, frame_index });
        }
        OverwritePolicy::Block { timeout } => self.wait_consumed(slot, timeout)?,
      }
    }

    // 写字段期间槽位不可读
    counter.store(SLOT_FREE, Ordering::Release);

    let count = detections.len().min(self.max_detections);
    if detections.len() > count {
      debug!(
        "帧 {} 的 {} 个检测结果超出上限, 截断为 {}",
        frame_index,
        detections.len(),
        count
      );
    }

    let base = slot * self.max_detections * DETECTION_FIELDS;
    let fields = self.detections();
    for (i, detection) in detections[..count].iter().enumerate() {
      let offset = base + i * DETECTION_FIELDS;
      for (cell, value) in fields[offset..offset + DETECTION_FIELDS]
        .iter()
        .zip(detection.to_fields())
      {
        cell.store(value.to_bits(), Ordering::Relaxed);
      }
    }

    counter.store(count as i32, Ordering::Release);
    Ok(count)
  }

  fn wait_consumed(&self, slot: usize, timeout: Duration) -> Result<(), RingError> {
    let counter = &self.ready()[slot];
    let deadline = Instant::now() + timeout;
    while counter.load(Ordering::Acquire) != SLOT_FREE {
      if Instant::now() >= deadline {
        return Err(RingError::ConsumerTimeout { slot, timeout });
      }
      thread::sleep(BLOCK_POLL_INTERVAL);
    }
    Ok(())
  }

  /// 槽位已就绪时返回其中的检测数
  pub fn poll(&self, slot: usize) -> Option<usize> {
    let count = self.ready()[slot % self.buffer_size].load(Ordering::Acquire);
    (count >= 0).then_some(count as usize)
  }

  /// 读取槽位内容，不改变就绪状态；槽位未就绪时返回空
  pub fn read_slot(&self, slot: usize) -> Vec<Detection> {
    let slot = slot % self.buffer_size;
    let Some(count) = self.poll(slot) else {
      return Vec::new();
    };
    let base = slot * self.max_detections * DETECTION_FIELDS;
    let fields = self.detections();
    (0..count.min(self.max_detections))
      .map(|i| {
        let offset = base + i * DETECTION_FIELDS;
        let mut values = [0f32; DETECTION_FIELDS];
        for (value, cell) in values.iter_mut().zip(&fields[offset..offset + DETECTION_FIELDS]) {
          *value = f32::from_bits(cell.load(Ordering::Relaxed));
        }
        Detection::from_fields(&values)
      })
      .collect()
  }

  /// 消费者确认已读
  pub fn acknowledge(&self, slot: usize) {
    self.ready()[slot % self.buffer_size].store(SLOT_FREE, Ordering::Release);
  }

  /// 读取并确认一个就绪槽位
  pub fn take(&self, slot: usize) -> Option<Vec<Detection>> {
    self.poll(slot)?;
    let detections = self.read_slot(slot);
    self.acknowledge(slot);
    Some(detections)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(class_id: u32) -> Detection {
    Detection {
      ymin: 1.0,
      xmin: 2.0,
      ymax: 3.0,
      xmax: 4.0,
      confidence: 0.5,
      class_id,
    }
  }

  #[test]
  fn frames_map_to_slots_modulo_size() {
    let ring = ResultRing::new(4, 2, OverwritePolicy::Overwrite).unwrap();
    for frame in 0..4u64 {
      ring.publish(frame, &[detection(frame as u32)]).unwrap();
    }
    for slot in 0..4 {
      assert_eq!(ring.take(slot).unwrap(), vec![detection(slot as u32)]);
    }
    ring.publish(9, &[detection(9)]).unwrap();
    assert_eq!(ring.poll(1), Some(1));
    assert_eq!(ring.poll(0), None);
  }

  #[test]
  fn extra_detections_are_dropped() {
    let ring = ResultRing::new(2, 3, OverwritePolicy::Overwrite).unwrap();
    let items: Vec<_> = (0..5).map(detection).collect();
    assert_eq!(ring.publish(0, &items).unwrap(), 3);
    assert_eq!(ring.read_slot(0), items[..3].to_vec());
  }

  #[test]
  fn empty_frame_is_ready_with_zero() {
    let ring = ResultRing::new(2, 3, OverwritePolicy::Reject).unwrap();
    ring.publish(1, &[]).unwrap();
    assert_eq!(ring.poll(1), Some(0));
    assert_eq!(ring.take(1), Some(vec![]));
    assert_eq!(ring.poll(1), None);
  }

  #[test]
  fn overwrite_replaces_unconsumed_slot() {
    let ring = ResultRing::new(2, 2, OverwritePolicy::Overwrite).unwrap();
    ring.publish(0, &[detection(1), detection(2)]).unwrap();
    ring.publish(2, &[detection(3)]).unwrap();
    assert_eq!(ring.take(0).unwrap(), vec![detection(3)]);
  }

  #[test]
  fn reject_keeps_unconsumed_slot() {
    let ring = ResultRing::new(2, 2, OverwritePolicy::Reject).unwrap();
    ring.publish(1, &[detection(1)]).unwrap();
    assert_eq!(
      ring.publish(3, &[detection(3)]),
      Err(RingError::SlotNotConsumed {
        slot: 1,
        frame_index: 3
      })
    );
    assert_eq!(ring.take(1).unwrap(), vec![detection(1)]);
    assert_eq!(ring.publish(3, &[detection(3)]), Ok(1));
  }

  #[test]
  fn block_waits_for_consumer() {
    let timeout = Duration::from_secs(2);
    let ring = ResultRing::new(1, 1, OverwritePolicy::Block { timeout }).unwrap();
    ring.publish(0, &[detection(0)]).unwrap();
    thread::scope(|s| {
      s.spawn(|| {
        thread::sleep(Duration::from_millis(20));
        ring.acknowledge(0);
      });
      assert_eq!(ring.publish(1, &[detection(1)]), Ok(1));
    });
    assert_eq!(ring.take(0).unwrap(), vec![detection(1)]);
  }

  #[test]
  fn block_times_out() {
    let timeout = Duration::from_millis(10);
    let ring = ResultRing::new(1, 1, OverwritePolicy::Block { timeout }).unwrap();
    ring.publish(0, &[]).unwrap();
    assert_eq!(
      ring.publish(1, &[]),
      Err(RingError::ConsumerTimeout { slot: 0, timeout })
    );
  }

  #[test]
  fn external_memory_uses_flat_layout() {
    let mut fields = vec![0f32; 2 * 2 * DETECTION_FIELDS];
    let mut ready = vec![SLOT_FREE; 2];
    {
      let ring = unsafe {
        ResultRing::from_raw_parts(
          fields.as_mut_ptr(),
          ready.as_mut_ptr(),
          2,
          2,
          OverwritePolicy::Overwrite,
        )
      }
      .unwrap();
      ring.publish(3, &[detection(7), detection(8)]).unwrap();
    }
    assert_eq!(ready, vec![SLOT_FREE, 2]);
    assert_eq!(&fields[12..18], &[1.0, 2.0, 3.0, 4.0, 0.5, 7.0]);
    assert_eq!(fields[23], 8.0);
  }

  #[test]
  fn invalid_sizes_are_rejected() {
    assert!(matches!(
      ResultRing::new(0, 1, OverwritePolicy::Overwrite),
      Err(RingError::InvalidBufferSize)
    ));
    assert!(matches!(
      ResultRing::new(1, 0, OverwritePolicy::Overwrite),
      Err(RingError::InvalidMaxDetections)
    ));
  }
}
