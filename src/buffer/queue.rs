// 该文件是 Liushui （流水） 项目的一部分。
// src/buffer/queue.rs - 有界交接队列
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
  fmt,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded, select};
use parking_lot::Mutex;
use thiserror::Error;

const PUSH_WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Error)]
pub enum PushError<T> {
  #[error("交接队列已满")]
  Full(T),
  #[error("交接队列已关闭")]
  Closed(T),
}

impl<T> PushError<T> {
  pub fn into_inner(self) -> T {
    match self {
      PushError::Full(item) | PushError::Closed(item) => item,
    }
  }
}

impl<T> fmt::Debug for PushError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PushError::Full(_) => f.write_str("Full(..)"),
      PushError::Closed(_) => f.write_str("Closed(..)"),
    }
  }
}

/// 带超时的出队结果
#[derive(Debug)]
pub enum Popped<T> {
  Item(T),
  TimedOut,
  Shutdown,
}

/// 关闭信号。丢弃内部唯一的 Sender 会让所有监听者立即醒来。
#[derive(Clone)]
pub struct Shutdown {
  trigger: Arc<Mutex<Option<Sender<()>>>>,
  triggered: Arc<AtomicBool>,
  signal: Receiver<()>,
}

impl Shutdown {
  fn new() -> Self {
    let (tx, rx) = bounded(0);
    Self {
      trigger: Arc::new(Mutex::new(Some(tx))),
      triggered: Arc::new(AtomicBool::new(false)),
      signal: rx,
    }
  }

  pub fn trigger(&self) {
    self.triggered.store(true, Ordering::Release);
    self.trigger.lock().take();
  }

  pub fn is_triggered(&self) -> bool {
    self.triggered.load(Ordering::Acquire)
  }
}

/// 交接队列的生产端，可被多个完成回调克隆持有。
pub struct HandoffSender<T> {
  tx: Sender<T>,
  shutdown: Shutdown,
}

impl<T> Clone for HandoffSender<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      shutdown: self.shutdown.clone(),
    }
  }
}

impl<T> HandoffSender<T> {
  /// 非阻塞入队。底层是预分配的数组通道，入队不分配内存，
  /// 可以在加速器驱动的完成回调里调用。
  pub fn push(&self, item: T) -> Result<(), PushError<T>> {
    if self.shutdown.is_triggered() {
      return Err(PushError::Closed(item));
    }
    self.tx.try_send(item).map_err(|e| match e {
      TrySendError::Full(item) => PushError::Full(item),
      TrySendError::Disconnected(item) => PushError::Closed(item),
    })
  }

  /// 阻塞入队，直到有空位或队列被关闭。不要在完成回调中使用。
  pub fn push_wait(&self, item: T) -> Result<(), PushError<T>> {
    let mut item = item;
    loop {
      if self.shutdown.is_triggered() {
        return Err(PushError::Closed(item));
      }
      match self.tx.send_timeout(item, PUSH_WAIT_SLICE) {
        Ok(()) => return Ok(()),
        Err(SendTimeoutError::Timeout(back)) => item = back,
        Err(SendTimeoutError::Disconnected(back)) => return Err(PushError::Closed(back)),
      }
    }
  }
}

/// 有界交接队列的唯一消费端。
///
/// 多个生产者 `push`，解码线程 `pop`；每个流内保持 FIFO。
/// 关闭后已入队的元素仍会被依次取出，取空后返回空信号。
pub struct HandoffQueue<T> {
  rx: Receiver<T>,
  shutdown: Shutdown,
  capacity: usize,
}

impl<T> HandoffQueue<T> {
  pub fn with_capacity(capacity: usize) -> (HandoffSender<T>, HandoffQueue<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = bounded(capacity);
    let shutdown = Shutdown::new();
    (
      HandoffSender {
        tx,
        shutdown: shutdown.clone(),
      },
      HandoffQueue {
        rx,
        shutdown,
        capacity,
      },
    )
  }

  /// 阻塞出队，直到有元素或队列关闭
  pub fn pop(&self) -> Option<T> {
    if let Ok(item) = self.rx.try_recv() {
      return Some(item);
    }
    select! {
      recv(self.rx) -> item => item.ok(),
      recv(self.shutdown.signal) -> _ => self.rx.try_recv().ok(),
    }
  }

  pub fn pop_timeout(&self, timeout: Duration) -> Popped<T> {
    if let Ok(item) = self.rx.try_recv() {
      return Popped::Item(item);
    }
    select! {
      recv(self.rx) -> item => match item {
        Ok(item) => Popped::Item(item),
        Err(_) => Popped::Shutdown,
      },
      recv(self.shutdown.signal) -> _ => match self.rx.try_recv() {
        Ok(item) => Popped::Item(item),
        Err(_) => Popped::Shutdown,
      },
      default(timeout) => Popped::TimedOut,
    }
  }

  pub fn shutdown_handle(&self) -> Shutdown {
    self.shutdown.clone()
  }

  pub fn len(&self) -> usize {
    self.rx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rx.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}
