// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/publish.rs - 发布状态（单写多读）
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

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use image::RgbImage;
use tokio::sync::watch;

use super::CaptureState;
use crate::model::Detection;

/// 一次发布的完整快照，整体替换
#[derive(Debug, Clone, Default)]
pub struct PublishState {
  pub annotated_jpeg: Bytes,
  pub raw_jpeg: Bytes,
  /// 原始像素，用于按更高质量重新编码快照
  pub annotated_image: Option<Arc<RgbImage>>,
  pub raw_image: Option<Arc<RgbImage>>,
  pub detections: Vec<Detection>,
  /// 0 表示尚未发布任何帧
  pub sequence: u64,
  pub fps: f32,
  pub error: Option<String>,
  pub state: CaptureState,
  pub timestamp_ms: i64,
}

impl PublishState {
  pub fn has_frame(&self) -> bool {
    self.sequence > 0 && !self.annotated_jpeg.is_empty()
  }

  pub fn jpeg(&self, annotated: bool) -> &Bytes {
    if annotated {
      &self.annotated_jpeg
    } else {
      &self.raw_jpeg
    }
  }

  pub fn image(&self, annotated: bool) -> Option<&Arc<RgbImage>> {
    if annotated {
      self.annotated_image.as_ref()
    } else {
      self.raw_image.as_ref()
    }
  }
}

/// 发布端
///
/// 帧发布通过 `watch` 通知所有订阅者；状态与错误信息的变更只原地更新，
/// 不唤醒订阅者，所以每次通知都对应一个新的序列号。
#[derive(Debug)]
pub struct Publisher {
  tx: watch::Sender<Arc<PublishState>>,
  next_sequence: AtomicU64,
}

impl Default for Publisher {
  fn default() -> Self {
    Self::new()
  }
}

impl Publisher {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(Arc::new(PublishState::default()));
    Self {
      tx,
      next_sequence: AtomicU64::new(1),
    }
  }

  /// 分配下一个帧序列号，在整个发布端生命周期内严格递增
  pub fn next_sequence(&self) -> u64 {
    self.next_sequence.fetch_add(1, Ordering::AcqRel)
  }

  pub fn subscribe(&self) -> watch::Receiver<Arc<PublishState>> {
    self.tx.subscribe()
  }

  pub fn current(&self) -> Arc<PublishState> {
    self.tx.borrow().clone()
  }

  pub fn publish(&self, state: PublishState) {
    self.tx.send_replace(Arc::new(state));
  }

  /// 更新采集状态与错误信息，不产生新的帧通知
  pub fn set_status(&self, capture_state: CaptureState, error: Option<String>) {
    self.tx.send_if_modified(|current| {
      if current.state != capture_state || current.error != error {
        let mut next = (**current).clone();
        next.state = capture_state;
        next.error = error;
        *current = Arc::new(next);
      }
      false
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sequences_strictly_increase() {
    let publisher = Publisher::new();
    let a = publisher.next_sequence();
    let b = publisher.next_sequence();
    assert!(b > a);
    assert!(a > 0);
  }

  #[test]
  fn status_update_does_not_notify() {
    let publisher = Publisher::new();
    let mut rx = publisher.subscribe();
    rx.borrow_and_update();

    publisher.set_status(CaptureState::Degraded, Some("camera lost".into()));
    assert!(!rx.has_changed().unwrap());
    assert_eq!(publisher.current().state, CaptureState::Degraded);

    publisher.publish(PublishState {
      annotated_jpeg: Bytes::from_static(&[0xFF, 0xD8]),
      sequence: publisher.next_sequence(),
      ..PublishState::default()
    });
    assert!(rx.has_changed().unwrap());
    assert!(rx.borrow_and_update().has_frame());
  }
}
