// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/image_source.rs - 图片输入源
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

use std::path::Path;

use image::{ImageReader, RgbImage};
use tracing::error;
use url::Url;

use super::InputSource;
use crate::{FromUrl, FromUrlWithScheme, error::CaptureError, frame::Frame};

/// 图片输入源，只产生一帧
pub struct ImageSource {
  image: Option<RgbImage>,
  path: String,
  width: u32,
  height: u32,
}

impl ImageSource {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let image = ImageReader::open(path)
      .map_err(|e| CaptureError::Open(display.clone(), e.to_string()))?
      .with_guessed_format()
      .map_err(|e| CaptureError::Open(display.clone(), e.to_string()))?
      .decode()
      .map_err(|e| CaptureError::Open(display.clone(), e.to_string()))?
      .to_rgb8();

    let (width, height) = image.dimensions();
    Ok(Self {
      image: Some(image),
      path: display,
      width,
      height,
    })
  }

  pub fn open_url(url: &Url) -> Result<Self, CaptureError> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CaptureError::Unsupported(url.to_string()));
    }
    let path = urlencoding::decode(url.path())
      .map_err(|e| CaptureError::Open(url.path().to_string(), e.to_string()))?;
    Self::open(path.as_ref())
  }
}

impl FromUrl for ImageSource {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Self::open_url(url)
  }
}

impl FromUrlWithScheme for ImageSource {
  const SCHEME: &'static str = "image";
}

impl Iterator for ImageSource {
  type Item = Result<Frame, CaptureError>;

  fn next(&mut self) -> Option<Self::Item> {
    self
      .image
      .take()
      .map(|image| Ok(Frame::new(image, 0, crate::now_ms())))
  }
}

impl InputSource for ImageSource {
  fn describe(&self) -> String {
    format!("image {}", self.path)
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    None
  }
}
