// 该文件是 Liushui （流水） 项目的一部分。
// src/buffer.rs - 页对齐缓冲区与缓冲池
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
  alloc::{self, Layout},
  fmt,
  ops::{Deref, DerefMut},
  ptr::NonNull,
  sync::OnceLock,
};

use thiserror::Error;
use tracing::debug;

mod double;
mod queue;

pub use self::double::{BufferClosed, DoubleBuffer, ReadGuard, WriteGuard};
pub use self::queue::{HandoffQueue, HandoffSender, Popped, PushError, Shutdown};

const FALLBACK_PAGE_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum BufferError {
  #[error("缓冲区大小不能为 0")]
  ZeroSize,
  #[error("无效的内存布局: 大小 {size}, 对齐 {align}")]
  InvalidLayout { size: usize, align: usize },
  #[error("分配 {0} 字节的页对齐内存失败")]
  AllocationFailed(usize),
  #[error("数据长度不匹配: 期望 {expected}, 实际 {found}")]
  SizeMismatch { expected: usize, found: usize },
}

/// 平台内存页大小，只查询一次
pub fn page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    #[cfg(unix)]
    {
      // SAFETY: sysconf 只读取系统配置
      let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
      if size > 0 {
        return size as usize;
      }
    }
    FALLBACK_PAGE_SIZE
  })
}

/// 按内存页对齐的定长内存块，加速器可直接对其做 DMA 传输。
///
/// 内存在 `Drop` 时释放，且只释放一次。
pub struct AlignedBuffer {
  ptr: NonNull<u8>,
  layout: Layout,
}

// SAFETY: AlignedBuffer 独占其内存，与 Box<[u8]> 一样可以跨线程移动和共享只读引用
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
  pub fn new(size: usize) -> Result<Self, BufferError> {
    if size == 0 {
      return Err(BufferError::ZeroSize);
    }

    let align = page_size();
    let layout =
      Layout::from_size_align(size, align).map_err(|_| BufferError::InvalidLayout { size, align })?;

    // SAFETY: layout 大小非零
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    let ptr = NonNull::new(raw).ok_or(BufferError::AllocationFailed(size))?;

    Ok(Self { ptr, layout })
  }

  pub fn from_slice(data: &[u8]) -> Result<Self, BufferError> {
    let mut buffer = Self::new(data.len())?;
    buffer.copy_from_slice(data);
    Ok(buffer)
  }

  pub fn len(&self) -> usize {
    self.layout.size()
  }

  pub fn is_empty(&self) -> bool {
    self.layout.size() == 0
  }

  pub fn is_page_aligned(&self) -> bool {
    (self.ptr.as_ptr() as usize) % page_size() == 0
  }

  pub fn as_ptr(&self) -> *const u8 {
    self.ptr.as_ptr()
  }

  pub fn as_mut_ptr(&mut self) -> *mut u8 {
    self.ptr.as_ptr()
  }
}

impl Deref for AlignedBuffer {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    // SAFETY: ptr 指向 layout.size() 字节且已初始化（alloc_zeroed）
    unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
  }
}

impl DerefMut for AlignedBuffer {
  fn deref_mut(&mut self) -> &mut [u8] {
    // SAFETY: 同上，且 &mut self 保证独占
    unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
  }
}

impl Drop for AlignedBuffer {
  fn drop(&mut self) {
    // SAFETY: ptr 由同一 layout 的 alloc_zeroed 分配
    unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
  }
}

impl fmt::Debug for AlignedBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AlignedBuffer")
      .field("ptr", &self.ptr)
      .field("len", &self.layout.size())
      .field("align", &self.layout.align())
      .finish()
  }
}

/// 固定大小、固定数量的对齐缓冲池。
///
/// 缓冲区预先分配；`acquire` 在池空时阻塞，直到有缓冲区归还或池被关闭。
/// 回调式流水线用它限制在途的异步读请求数量，
/// 保证完成回调推入交接队列时队列永远不会满。
pub struct BufferPool {
  buffer_size: usize,
  capacity: usize,
  free: HandoffQueue<AlignedBuffer>,
  returns: HandoffSender<AlignedBuffer>,
}

impl BufferPool {
  pub fn new(buffer_size: usize, capacity: usize) -> Result<Self, BufferError> {
    let (returns, free) = HandoffQueue::with_capacity(capacity.max(1));
    for _ in 0..capacity.max(1) {
      let buffer = AlignedBuffer::new(buffer_size)?;
      // 容量与缓冲区数量一致，预填充不会失败
      let _ = returns.push(buffer);
    }
    debug!(
      "缓冲池就绪: {} 个 x {} 字节, 页大小 {}",
      capacity.max(1),
      buffer_size,
      page_size()
    );
    Ok(Self {
      buffer_size,
      capacity: capacity.max(1),
      free,
      returns,
    })
  }

  /// 取出一个空闲缓冲区；池关闭后返回 None
  pub fn acquire(&self) -> Option<AlignedBuffer> {
    self.free.pop()
  }

  pub fn release(&self, buffer: AlignedBuffer) {
    if buffer.len() != self.buffer_size {
      debug!("丢弃大小不符的缓冲区: {} != {}", buffer.len(), self.buffer_size);
      return;
    }
    // 池已满或已关闭时直接释放该缓冲区
    let _ = self.returns.push(buffer);
  }

  pub fn close(&self) {
    self.free.shutdown_handle().trigger();
  }

  pub fn buffer_size(&self) -> usize {
    self.buffer_size
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn available(&self) -> usize {
    self.free.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocation_is_page_aligned_and_exact() {
    for size in [1, 100, 4096, 80 * 80 * 255] {
      let buffer = AlignedBuffer::new(size).unwrap();
      assert!(buffer.is_page_aligned());
      assert_eq!(buffer.len(), size);
      assert!(buffer.iter().all(|&b| b == 0));
    }
  }

  #[test]
  fn zero_size_is_rejected() {
    assert!(matches!(AlignedBuffer::new(0), Err(BufferError::ZeroSize)));
  }

  #[test]
  fn buffer_is_writable() {
    let mut buffer = AlignedBuffer::from_slice(&[1, 2, 3]).unwrap();
    buffer[1] = 42;
    assert_eq!(&buffer[..], &[1, 42, 3]);
  }

  #[test]
  fn pool_recycles_buffers() {
    let pool = BufferPool::new(64, 2).unwrap();
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_eq!(pool.available(), 0);
    pool.release(a);
    assert_eq!(pool.available(), 1);
    pool.release(b);
    assert_eq!(pool.available(), 2);
  }

  #[test]
  fn closed_pool_unblocks_acquire() {
    let pool = BufferPool::new(16, 1).unwrap();
    let held = pool.acquire().unwrap();
    std::thread::scope(|s| {
      let waiter = s.spawn(|| pool.acquire().is_none());
      std::thread::sleep(std::time::Duration::from_millis(20));
      pool.close();
      assert!(waiter.join().unwrap());
    });
    drop(held);
  }
}
