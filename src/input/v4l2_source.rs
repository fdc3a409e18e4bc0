// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入源
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

use std::{io, pin::Pin};

use image::{ImageFormat, RgbImage};
use tracing::{debug, info, warn};
use url::Url;
use v4l::{
  FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  prelude::*,
  video::{Capture, capture::Parameters},
};

use super::{CaptureSettings, InputSource, query_map};
use crate::{FromUrl, FromUrlWithScheme, error::CaptureError, frame::Frame};

const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Mjpeg,
  Yuyv,
}

/// V4L2 摄像头输入源
///
/// v4l 的 Stream 需要引用 Device，这里用 Pin<Box<Device>> 固定设备地址，
/// 从而可以在同一个结构体里保存引用它的 Stream。
pub struct V4l2Source {
  /// 捕获流，必须先于 device 释放
  stream: Option<Stream<'static>>,
  device: Pin<Box<Device>>,
  path: String,
  format: PixelFormat,
  width: u32,
  height: u32,
  fps: u32,
}

// SAFETY: Stream 只持有设备文件描述符与 mmap 缓冲区，
// V4l2Source 整体只在采集线程中使用，不会被并发访问。
unsafe impl Send for V4l2Source {}

impl V4l2Source {
  /// 打开 V4L2 设备，优先协商 MJPEG，不支持时退回 YUYV
  pub fn open(path: &str, settings: &CaptureSettings) -> Result<Self, CaptureError> {
    let open_err = |e: io::Error| CaptureError::Open(path.to_string(), e.to_string());

    let device = Box::pin(Device::with_path(path).map_err(open_err)?);

    let mut format = device.format().map_err(open_err)?;
    format.width = settings.width;
    format.height = settings.height;
    format.fourcc = FourCC::new(b"MJPG");
    let mut negotiated = device.set_format(&format).map_err(open_err)?;

    if negotiated.fourcc != FourCC::new(b"MJPG") {
      debug!("设备 {} 不支持 MJPEG，尝试 YUYV", path);
      format.fourcc = FourCC::new(b"YUYV");
      negotiated = device.set_format(&format).map_err(open_err)?;
    }

    let pixel_format = if negotiated.fourcc == FourCC::new(b"MJPG") {
      PixelFormat::Mjpeg
    } else if negotiated.fourcc == FourCC::new(b"YUYV") {
      PixelFormat::Yuyv
    } else {
      return Err(CaptureError::Open(
        path.to_string(),
        format!("不支持的像素格式 {}", negotiated.fourcc),
      ));
    };

    if let Err(e) = device.set_params(&Parameters::with_fps(settings.fps)) {
      warn!("设备 {} 无法设置帧率 {}: {}", path, settings.fps, e);
    }

    info!(
      "打开摄像头 {}: {}x{} {:?}@{}fps",
      path, negotiated.width, negotiated.height, pixel_format, settings.fps
    );

    let mut source = Self {
      stream: None,
      device,
      path: path.to_string(),
      format: pixel_format,
      width: negotiated.width,
      height: negotiated.height,
      fps: settings.fps,
    };

    let device_ref: &Device = &source.device;
    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；
    // stream 存在同一个结构体中，并在 Drop 中先于 device 释放。
    let device_static: &'static Device = unsafe { std::mem::transmute(device_ref) };
    let mut stream =
      Stream::with_buffers(device_static, Type::VideoCapture, BUFFER_COUNT).map_err(open_err)?;
    stream.set_timeout(settings.timeout());

    source.stream = Some(stream);
    Ok(source)
  }

  pub fn open_url(url: &Url, settings: &CaptureSettings) -> Result<Self, CaptureError> {
    if url.scheme() != Self::SCHEME {
      return Err(CaptureError::Unsupported(url.to_string()));
    }
    let path = match url.host_str() {
      Some(host) if !host.is_empty() => {
        // v4l2://0 形式的设备序号
        match host.parse::<u32>() {
          Ok(index) => format!("/dev/video{index}"),
          Err(_) => format!("/{host}{}", url.path()),
        }
      }
      _ => url.path().to_string(),
    };
    let settings = settings.with_query(&query_map(url));
    Self::open(&path, &settings)
  }

  fn decode(&self, data: &[u8]) -> Result<RgbImage, CaptureError> {
    match self.format {
      PixelFormat::Mjpeg => image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| CaptureError::Acquire(format!("MJPEG 解码失败: {e}"))),
      PixelFormat::Yuyv => {
        let rgb = yuyv_to_rgb(data, self.width, self.height);
        RgbImage::from_raw(self.width, self.height, rgb)
          .ok_or_else(|| CaptureError::Acquire("YUYV 帧长度不足".to_string()))
      }
    }
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  let convert = |y: f32, u: f32, v: f32| {
    [
      (y + 1.402 * v).clamp(0.0, 255.0) as u8,
      (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8,
      (y + 1.772 * u).clamp(0.0, 255.0) as u8,
    ]
  };

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    rgb.extend_from_slice(&convert(chunk[0] as f32, u, v));
    rgb.extend_from_slice(&convert(chunk[2] as f32, u, v));
  }

  rgb
}

impl Drop for V4l2Source {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
    debug!("关闭摄像头 {}", self.path);
  }
}

impl FromUrl for V4l2Source {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Self::open_url(url, &CaptureSettings::default())
  }
}

impl FromUrlWithScheme for V4l2Source {
  const SCHEME: &'static str = "v4l2";
}

impl Iterator for V4l2Source {
  type Item = Result<Frame, CaptureError>;

  fn next(&mut self) -> Option<Self::Item> {
    let stream = self.stream.as_mut()?;

    let data = match stream.next() {
      Ok((buffer, meta)) => {
        let used = (meta.bytesused as usize).min(buffer.len());
        if used == 0 {
          buffer.to_vec()
        } else {
          buffer[..used].to_vec()
        }
      }
      Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
        return Some(Err(CaptureError::Timeout));
      }
      Err(e) => return Some(Err(CaptureError::Acquire(e.to_string()))),
    };

    Some(
      self
        .decode(&data)
        .map(|image| Frame::new(image, 0, crate::now_ms())),
    )
  }
}

impl InputSource for V4l2Source {
  fn describe(&self) -> String {
    format!("v4l2 {} {}x{}", self.path, self.width, self.height)
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
  fn yuyv_gray_maps_to_gray() {
    let yuyv = [128u8, 128, 128, 128];
    assert_eq!(yuyv_to_rgb(&yuyv, 2, 1), vec![128, 128, 128, 128, 128, 128]);
  }

  #[test]
  fn missing_device_fails_to_open() {
    let result = V4l2Source::open("/dev/shanan-no-such-video", &CaptureSettings::default());
    assert!(matches!(result, Err(CaptureError::Open(_, _))));
  }
}
