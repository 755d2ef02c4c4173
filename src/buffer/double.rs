// 该文件是 Liushui （流水） 项目的一部分。
// src/buffer/double.rs - 双缓冲（乒乓）槽
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

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use super::{AlignedBuffer, BufferError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("双缓冲已关闭")]
pub struct BufferClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
  Free,
  Writing,
  Ready(u64),
  Reading,
}

#[derive(Debug)]
struct Slots {
  regions: [Region; 2],
  next_sequence: u64,
  writer_held: bool,
  reader_held: bool,
  closed: bool,
}

/// 单写单读的两区域交接结构。
///
/// 写线程最多领先读线程一帧：一个区域被读取时，另一个区域可以被写入。
/// 读线程按发布顺序取得区域；写线程不会拿到已发布但未读完的区域。
pub struct DoubleBuffer {
  memory: [Mutex<AlignedBuffer>; 2],
  slots: Mutex<Slots>,
  changed: Condvar,
  region_size: usize,
}

impl DoubleBuffer {
  pub fn new(region_size: usize) -> Result<Self, BufferError> {
    Ok(Self {
      memory: [
        Mutex::new(AlignedBuffer::new(region_size)?),
        Mutex::new(AlignedBuffer::new(region_size)?),
      ],
      slots: Mutex::new(Slots {
        regions: [Region::Free; 2],
        next_sequence: 0,
        writer_held: false,
        reader_held: false,
        closed: false,
      }),
      changed: Condvar::new(),
      region_size,
    })
  }

  pub fn region_size(&self) -> usize {
    self.region_size
  }

  /// 阻塞直到有空闲区域可写。
  ///
  /// # Panics
  ///
  /// 同一时刻已有一个未释放的写区域时调用属于编程错误，直接 panic。
  pub fn acquire_writable(&self) -> Result<WriteGuard<'_>, BufferClosed> {
    let mut slots = self.slots.lock();
    assert!(!slots.writer_held, "双缓冲的写区域已被占用");
    slots.writer_held = true;
    loop {
      if slots.closed {
        slots.writer_held = false;
        return Err(BufferClosed);
      }
      if let Some(index) = slots.regions.iter().position(|r| *r == Region::Free) {
        slots.regions[index] = Region::Writing;
        drop(slots);
        // 区域状态为 Writing 时没有其他角色持有这把锁
        let memory = self.memory[index].lock();
        return Ok(WriteGuard {
          owner: self,
          index,
          memory: Some(memory),
          published: false,
        });
      }
      self.changed.wait(&mut slots);
    }
  }

  /// 阻塞直到有已发布的区域可读，返回最早发布的区域。
  ///
  /// # Panics
  ///
  /// 同一时刻已有一个未释放的读区域时调用属于编程错误，直接 panic。
  pub fn acquire_readable(&self) -> Result<ReadGuard<'_>, BufferClosed> {
    let mut slots = self.slots.lock();
    assert!(!slots.reader_held, "双缓冲的读区域已被占用");
    slots.reader_held = true;
    loop {
      if slots.closed {
        slots.reader_held = false;
        return Err(BufferClosed);
      }
      let oldest = slots
        .regions
        .iter()
        .enumerate()
        .filter_map(|(index, region)| match region {
          Region::Ready(sequence) => Some((*sequence, index)),
          _ => None,
        })
        .min();
      if let Some((sequence, index)) = oldest {
        slots.regions[index] = Region::Reading;
        drop(slots);
        let memory = self.memory[index].lock();
        return Ok(ReadGuard {
          owner: self,
          index,
          sequence,
          memory: Some(memory),
        });
      }
      self.changed.wait(&mut slots);
    }
  }

  /// 唤醒所有等待者，之后的获取都返回 `BufferClosed`
  pub fn close(&self) {
    let mut slots = self.slots.lock();
    slots.closed = true;
    drop(slots);
    self.changed.notify_all();
  }

  /// 已发布但尚未被读取的区域数量
  pub fn pending(&self) -> usize {
    self
      .slots
      .lock()
      .regions
      .iter()
      .filter(|r| matches!(r, Region::Ready(_)))
      .count()
  }

  fn finish_write(&self, index: usize, publish: bool) {
    let mut slots = self.slots.lock();
    debug_assert_eq!(slots.regions[index], Region::Writing);
    slots.regions[index] = if publish {
      let sequence = slots.next_sequence;
      slots.next_sequence += 1;
      Region::Ready(sequence)
    } else {
      Region::Free
    };
    slots.writer_held = false;
    drop(slots);
    self.changed.notify_all();
  }

  fn finish_read(&self, index: usize) {
    let mut slots = self.slots.lock();
    debug_assert_eq!(slots.regions[index], Region::Reading);
    slots.regions[index] = Region::Free;
    slots.reader_held = false;
    drop(slots);
    self.changed.notify_all();
  }
}

/// 写区域。`publish` 后对读线程可见；未发布就丢弃则区域直接回到空闲。
pub struct WriteGuard<'a> {
  owner: &'a DoubleBuffer,
  index: usize,
  memory: Option<MutexGuard<'a, AlignedBuffer>>,
  published: bool,
}

impl WriteGuard<'_> {
  pub fn publish(mut self) {
    self.published = true;
  }
}

impl Deref for WriteGuard<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.memory.as_deref().map(|m| &m[..]).unwrap_or_default()
  }
}

impl DerefMut for WriteGuard<'_> {
  fn deref_mut(&mut self) -> &mut [u8] {
    self
      .memory
      .as_deref_mut()
      .map(|m| &mut m[..])
      .unwrap_or_default()
  }
}

impl Drop for WriteGuard<'_> {
  fn drop(&mut self) {
    // 先放开区域内存，再改状态，保证状态为 Free/Ready 时没人持有内存锁
    self.memory.take();
    self.owner.finish_write(self.index, self.published);
  }
}

/// 读区域，丢弃时释放回可写状态
pub struct ReadGuard<'a> {
  owner: &'a DoubleBuffer,
  index: usize,
  sequence: u64,
  memory: Option<MutexGuard<'a, AlignedBuffer>>,
}

impl ReadGuard<'_> {
  /// 该区域在本缓冲上的发布序号，从 0 开始
  pub fn sequence(&self) -> u64 {
    self.sequence
  }
}

impl Deref for ReadGuard<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.memory.as_deref().map(|m| &m[..]).unwrap_or_default()
  }
}

impl Drop for ReadGuard<'_> {
  fn drop(&mut self) {
    self.memory.take();
    self.owner.finish_read(self.index);
  }
}
