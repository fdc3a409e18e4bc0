// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::{Rgb, RgbImage};
use thiserror::Error;

const RGB_CHANNELS: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("不支持的通道数: {0}")]
  UnsupportedChannels(u32),
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("图像尺寸无效: {0}x{1}")]
  InvalidShape(u32, u32),
  #[error("没有可推理的帧")]
  Empty,
}

/// 一帧 RGB 图像及其采集信息
#[derive(Debug, Clone)]
pub struct Frame {
  image: RgbImage,
  sequence: u64,
  timestamp_ms: i64,
}

impl Frame {
  pub fn new(image: RgbImage, sequence: u64, timestamp_ms: i64) -> Self {
    Self {
      image,
      sequence,
      timestamp_ms,
    }
  }

  /// 由原始像素缓冲区构造帧
  ///
  /// 支持 1（灰度）、3（RGB）、4（RGBA）通道，统一转换为 RGB。
  pub fn from_raw(
    data: &[u8],
    width: u32,
    height: u32,
    channels: u32,
    sequence: u64,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape(width, height));
    }
    if !matches!(channels, 1 | 3 | 4) {
      return Err(FrameError::UnsupportedChannels(channels));
    }

    let expected = width as usize * height as usize * channels as usize;
    if data.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    let image = match channels {
      3 => RgbImage::from_raw(width, height, data.to_vec())
        .ok_or(FrameError::InvalidShape(width, height))?,
      _ => {
        let step = channels as usize;
        RgbImage::from_fn(width, height, |x, y| {
          let idx = (y as usize * width as usize + x as usize) * step;
          if step == 1 {
            Rgb([data[idx], data[idx], data[idx]])
          } else {
            Rgb([data[idx], data[idx + 1], data[idx + 2]])
          }
        })
      }
    };

    Ok(Self::new(image, sequence, crate::now_ms()))
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn channels(&self) -> u32 {
    RGB_CHANNELS
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn timestamp_ms(&self) -> i64 {
    self.timestamp_ms
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_image(self) -> RgbImage {
    self.image
  }
}
