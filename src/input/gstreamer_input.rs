// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入
//!
//! 通过 `gst://` URL 构建 GStreamer 管道：
//!
//! - `gst://camera/dev/video0?width=1280&height=720&fps=30&format=YUY2&rotate=90`
//! - `gst://file/path/to/video.mp4`
//!
//! 管道末端统一转换为 RGB 并交给 appsink，采集循环通过带超时的
//! `try_pull_sample` 拉取帧。
//!
//! 使用前需要安装 GStreamer 开发库并启用 `gstreamer_input` 特性。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{info, warn};
use url::Url;

use super::{CaptureSettings, InputSource};
use crate::{FromUrl, FromUrlWithScheme, error::CaptureError, frame::Frame};

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => format!("filesrc location={} ! decodebin", path),
      PipelineItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode = io_mode.map(|m| format!(" io-mode={m}")).unwrap_or_default();
        format!(
          "v4l2src device={camera}{io_mode} ! video/x-raw,format={format},width={width},height={height},framerate={fps}/1"
        )
      }
      PipelineItem::VideoFlip { method } => format!("videoflip method={method}"),
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<PipelineItem>,
  query: HashMap<String, String>,
  timeout: std::time::Duration,
  description: String,
}

impl GStreamerInputPipelineBuilder {
  fn video_flip(rotate: Option<&str>) -> Option<PipelineItem> {
    let method = match rotate? {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    Some(PipelineItem::VideoFlip { method })
  }

  /// 用采集参数补全摄像头管道中未在 URL 指定的宽高与帧率
  pub fn with_settings(mut self, settings: &CaptureSettings) -> Self {
    let settings = settings.with_query(&self.query);
    for item in &mut self.items {
      if let PipelineItem::CameraSource {
        width, height, fps, ..
      } = item
      {
        *width = settings.width;
        *height = settings.height;
        *fps = settings.fps;
      }
    }
    self.timeout = settings.timeout();
    self
  }

  pub fn build(self) -> Result<GStreamerInput, CaptureError> {
    let open_err = |e: String| CaptureError::Open(self.description.clone(), e);
    gst::init().map_err(|e| open_err(e.to_string()))?;

    let basic = self
      .items
      .iter()
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    let full = format!("{basic} ! appsink max-buffers=2 drop=true name=sink");
    info!("GStreamer 管道: {}", full);

    let pipeline = gst::parse::launch(&full)
      .map_err(|e| open_err(e.to_string()))?
      .downcast::<gst::Pipeline>()
      .map_err(|_| open_err("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| open_err("找不到 appsink".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| open_err("appsink 类型错误".to_string()))?;

    pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| open_err(e.to_string()))?;

    Ok(GStreamerInput {
      pipeline,
      appsink,
      description: self.description,
      timeout: self.timeout,
      width: 0,
      height: 0,
    })
  }
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CaptureError::Unsupported(url.to_string()));
    }

    let query = super::query_map(url);
    let defaults = CaptureSettings::default().with_query(&query);

    let mut items = match url.host_str() {
      Some("camera") => vec![PipelineItem::CameraSource {
        camera: url.path().to_string(),
        io_mode: query.get("io-mode").and_then(|v| v.parse::<u32>().ok()),
        format: query
          .get("format")
          .cloned()
          .unwrap_or_else(|| "YUY2".to_string()),
        width: defaults.width,
        height: defaults.height,
        fps: defaults.fps,
      }],
      Some("file") => vec![PipelineItem::FileSource(url.path().to_string())],
      _ => return Err(CaptureError::Unsupported(url.to_string())),
    };

    if let Some(flip) = Self::video_flip(query.get("rotate").map(String::as_str)) {
      items.push(flip);
    }
    items.push(PipelineItem::TargetFormat);

    Ok(Self {
      items,
      query,
      timeout: defaults.timeout(),
      description: url.to_string(),
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

/// GStreamer 视频输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  description: String,
  timeout: std::time::Duration,
  width: u32,
  height: u32,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl GStreamerInput {
  fn convert(&mut self, sample: gst::Sample) -> Result<Frame, CaptureError> {
    let acquire = |e: &str| CaptureError::Acquire(e.to_string());
    let buffer = sample.buffer().ok_or_else(|| acquire("样本中没有缓冲区"))?;
    let caps = sample.caps().ok_or_else(|| acquire("样本中没有 caps"))?;
    let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| acquire("无法解析视频信息"))?;

    let (width, height) = (info.width(), info.height());
    let stride = info.stride()[0] as usize;
    let map = buffer
      .map_readable()
      .map_err(|e| CaptureError::Acquire(e.to_string()))?;
    let data = map.as_slice();

    let row = width as usize * 3;
    if stride < row || data.len() < stride * (height as usize - 1) + row {
      return Err(acquire("缓冲区长度不足"));
    }

    let bgr = match info.format() {
      gst_video::VideoFormat::Rgb => false,
      gst_video::VideoFormat::Bgr => true,
      other => {
        return Err(CaptureError::Acquire(format!(
          "不支持的视频格式: {:?}",
          other
        )));
      }
    };

    let image = RgbImage::from_fn(width, height, |x, y| {
      let idx = y as usize * stride + x as usize * 3;
      if bgr {
        image::Rgb([data[idx + 2], data[idx + 1], data[idx]])
      } else {
        image::Rgb([data[idx], data[idx + 1], data[idx + 2]])
      }
    });

    self.width = width;
    self.height = height;
    Ok(Frame::new(image, 0, crate::now_ms()))
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<Frame, CaptureError>;

  fn next(&mut self) -> Option<Self::Item> {
    let timeout = gst::ClockTime::from_nseconds(self.timeout.as_nanos() as u64);
    match self.appsink.try_pull_sample(timeout) {
      Some(sample) => Some(self.convert(sample)),
      None if self.appsink.is_eos() => None,
      None => Some(Err(CaptureError::Timeout)),
    }
  }
}

impl InputSource for GStreamerInput {
  fn describe(&self) -> String {
    format!("gstreamer {}", self.description)
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
