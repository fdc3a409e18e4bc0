// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/state.rs - 采集状态机
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
  sync::atomic::{AtomicU8, Ordering},
};

use serde::Serialize;
use tracing::debug;

/// 采集循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CaptureState {
  #[default]
  Stopped = 0,
  Starting = 1,
  Running = 2,
  Stopping = 3,
  /// 输入源不可用，服务端继续提供旧帧或无帧状态
  Degraded = 4,
}

impl CaptureState {
  fn from_u8(value: u8) -> Self {
    match value {
      1 => CaptureState::Starting,
      2 => CaptureState::Running,
      3 => CaptureState::Stopping,
      4 => CaptureState::Degraded,
      _ => CaptureState::Stopped,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      CaptureState::Stopped => "STOPPED",
      CaptureState::Starting => "STARTING",
      CaptureState::Running => "RUNNING",
      CaptureState::Stopping => "STOPPING",
      CaptureState::Degraded => "DEGRADED",
    }
  }

  /// 采集线程存活（包括降级重试中）
  pub fn is_active(self) -> bool {
    matches!(
      self,
      CaptureState::Starting | CaptureState::Running | CaptureState::Degraded
    )
  }

  /// 状态转移表
  pub fn can_transition_to(self, next: CaptureState) -> bool {
    use CaptureState::*;
    matches!(
      (self, next),
      (Stopped, Starting)
        | (Starting, Running)
        | (Starting, Degraded)
        | (Running, Degraded)
        | (Degraded, Running)
        | (Starting, Stopping)
        | (Running, Stopping)
        | (Degraded, Stopping)
        | (Stopping, Stopped)
    )
  }
}

impl fmt::Display for CaptureState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 可在线程间共享的状态单元
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self) -> CaptureState {
    CaptureState::from_u8(self.0.load(Ordering::Acquire))
  }

  /// 按状态转移表迁移，非法迁移返回 false 且状态不变
  pub fn transition(&self, next: CaptureState) -> bool {
    let mut current = self.0.load(Ordering::Acquire);
    loop {
      let from = CaptureState::from_u8(current);
      if from == next {
        return true;
      }
      if !from.can_transition_to(next) {
        return false;
      }
      match self
        .0
        .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => {
          debug!("采集状态: {} -> {}", from, next);
          return true;
        }
        Err(actual) => current = actual,
      }
    }
  }
}
