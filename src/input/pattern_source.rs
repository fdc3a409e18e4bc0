// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/pattern_source.rs - 测试图案输入源
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
  thread,
  time::{Duration, Instant},
};

use image::{Rgb, RgbImage};
use url::Url;

use super::{CaptureSettings, InputSource, query_map};
use crate::{FromUrl, FromUrlWithScheme, error::CaptureError, frame::Frame};

/// 生成移动色条的输入源，用于无摄像头环境下的联调
pub struct PatternSource {
  width: u32,
  height: u32,
  fps: u32,
  /// 帧数上限，`None` 表示无限
  frames: Option<u64>,
  produced: u64,
  paced: bool,
  last: Option<Instant>,
}

impl PatternSource {
  pub fn new(width: u32, height: u32, fps: u32) -> Self {
    Self {
      width: width.max(1),
      height: height.max(1),
      fps: fps.max(1),
      frames: None,
      produced: 0,
      paced: true,
      last: None,
    }
  }

  pub fn with_frames(mut self, frames: u64) -> Self {
    self.frames = Some(frames);
    self
  }

  /// 关闭按帧率节流，测试中使用
  pub fn unpaced(mut self) -> Self {
    self.paced = false;
    self
  }

  pub fn open_url(url: &Url, settings: &CaptureSettings) -> Result<Self, CaptureError> {
    if url.scheme() != Self::SCHEME {
      return Err(CaptureError::Unsupported(url.to_string()));
    }
    let query = query_map(url);
    let settings = settings.with_query(&query);
    let mut source = Self::new(settings.width, settings.height, settings.fps);
    if let Some(frames) = query.get("frames").and_then(|v| v.parse::<u64>().ok()) {
      source = source.with_frames(frames);
    }
    if query.get("paced").is_some_and(|v| v == "false") {
      source = source.unpaced();
    }
    Ok(source)
  }

  fn render(&self) -> RgbImage {
    let offset = (self.produced * 4) as u32;
    let band = (self.width / 8).max(1);
    RgbImage::from_fn(self.width, self.height, |x, y| {
      let stripe = ((x + offset) / band) % 8;
      let shade = (y * 255 / self.height.max(1)) as u8;
      match stripe {
        0 => Rgb([255, 255, 255]),
        1 => Rgb([255, 255, 0]),
        2 => Rgb([0, 255, 255]),
        3 => Rgb([0, 255, 0]),
        4 => Rgb([255, 0, 255]),
        5 => Rgb([255, 0, 0]),
        6 => Rgb([0, 0, 255]),
        _ => Rgb([shade, shade, shade]),
      }
    })
  }

  fn pace(&mut self) {
    if !self.paced {
      return;
    }
    let interval = Duration::from_secs_f64(1.0 / self.fps as f64);
    if let Some(last) = self.last {
      let elapsed = last.elapsed();
      if elapsed < interval {
        thread::sleep(interval - elapsed);
      }
    }
    self.last = Some(Instant::now());
  }
}

impl FromUrl for PatternSource {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Self::open_url(url, &CaptureSettings::default())
  }
}

impl FromUrlWithScheme for PatternSource {
  const SCHEME: &'static str = "pattern";
}

impl Iterator for PatternSource {
  type Item = Result<Frame, CaptureError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.frames.is_some_and(|limit| self.produced >= limit) {
      return None;
    }
    self.pace();
    let frame = Frame::new(self.render(), self.produced, crate::now_ms());
    self.produced += 1;
    Some(Ok(frame))
  }
}

impl InputSource for PatternSource {
  fn describe(&self) -> String {
    format!("pattern {}x{}@{}", self.width, self.height, self.fps)
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    Some(self.fps as f64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pattern_moves_between_frames() {
    let mut source = PatternSource::new(64, 16, 30).unpaced().with_frames(3);
    let first = source.next().unwrap().unwrap();
    let second = source.next().unwrap().unwrap();
    assert_eq!(first.width(), 64);
    assert_ne!(first.image().as_raw(), second.image().as_raw());
    assert!(source.next().is_some());
    assert!(source.next().is_none());
  }

  #[test]
  fn rejects_foreign_scheme() {
    let url = Url::parse("image:///tmp/a.png").unwrap();
    assert!(PatternSource::from_url(&url).is_err());
  }
}
