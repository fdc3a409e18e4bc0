// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/fps.rs - 帧率统计
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

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// 1 秒窗口的帧率计数器：窗口结束时 fps = 帧数 / 经过时间
#[derive(Debug, Clone)]
pub struct FpsCounter {
  window_start: Option<Instant>,
  frames: u32,
  fps: f32,
}

impl Default for FpsCounter {
  fn default() -> Self {
    Self::new()
  }
}

impl FpsCounter {
  pub fn new() -> Self {
    Self {
      window_start: None,
      frames: 0,
      fps: 0.0,
    }
  }

  pub fn tick(&mut self) -> f32 {
    self.tick_at(Instant::now())
  }

  pub fn tick_at(&mut self, now: Instant) -> f32 {
    let start = *self.window_start.get_or_insert(now);
    self.frames += 1;
    let elapsed = now.saturating_duration_since(start);
    if elapsed >= WINDOW {
      self.fps = self.frames as f32 / elapsed.as_secs_f32();
      self.frames = 0;
      self.window_start = Some(now);
    }
    self.fps
  }

  pub fn fps(&self) -> f32 {
    self.fps
  }

  pub fn reset(&mut self) {
    *self = Self::new();
  }
}
