// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use url::Url;

use crate::{FromUrlWithScheme, error::CaptureError, frame::Frame};

mod pattern_source;
mod v4l2_source;

pub use self::pattern_source::PatternSource;
pub use self::v4l2_source::V4l2Source;

#[cfg(feature = "read_image_file")]
mod image_source;
#[cfg(feature = "read_image_file")]
pub use self::image_source::ImageSource;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputPipelineBuilder};

/// 采集参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
  pub width: u32,
  pub height: u32,
  pub fps: u32,
  /// 单帧采集超时（毫秒）
  pub timeout_ms: u64,
}

impl Default for CaptureSettings {
  fn default() -> Self {
    Self {
      width: 1280,
      height: 720,
      fps: 30,
      timeout_ms: 2000,
    }
  }
}

impl CaptureSettings {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms.max(1))
  }

  /// URL 查询参数覆盖默认采集参数
  pub fn with_query(&self, query: &HashMap<String, String>) -> Self {
    let pick = |key: &str, fallback: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
    };
    Self {
      width: pick("width", self.width),
      height: pick("height", self.height),
      fps: pick("fps", self.fps),
      timeout_ms: self.timeout_ms,
    }
  }
}

/// 输入源
///
/// 迭代器返回 `None` 表示输入源已经结束（图片、有限的视频流），
/// 返回 `Some(Err(_))` 表示本次采集失败，调用方可以重试或重新打开。
pub trait InputSource: Iterator<Item = Result<Frame, CaptureError>> + Send {
  /// 输入源描述，用于日志
  fn describe(&self) -> String;

  fn width(&self) -> u32;

  fn height(&self) -> u32;

  /// 输入源帧率（如果适用）
  fn fps(&self) -> Option<f64>;
}

pub(crate) fn query_map(url: &Url) -> HashMap<String, String> {
  url
    .query_pairs()
    .map(|(k, v)| (String::from(k), String::from(v)))
    .collect()
}

/// 按 URL 打开输入源
///
/// 支持的格式：
/// - `v4l2:///dev/video0?width=1280&height=720&fps=30`
/// - `image:///path/to/image.jpg?fps=5`
/// - `pattern://?width=640&height=480&fps=30&frames=100`
/// - `gst://camera/dev/video0?...` / `gst://file/path/to/video.mp4`
pub fn open_source(
  url: &Url,
  settings: &CaptureSettings,
) -> Result<Box<dyn InputSource>, CaptureError> {
  info!("打开输入源: {}", url);
  let scheme = url.scheme();

  if scheme == V4l2Source::SCHEME {
    return Ok(Box::new(V4l2Source::open_url(url, settings)?));
  }
  if scheme == PatternSource::SCHEME {
    return Ok(Box::new(PatternSource::open_url(url, settings)?));
  }
  #[cfg(feature = "read_image_file")]
  {
    if scheme == ImageSource::SCHEME {
      return Ok(Box::new(ImageSource::open_url(url)?));
    }
  }
  #[cfg(feature = "gstreamer_input")]
  {
    use crate::FromUrl;

    if scheme == GStreamerInputPipelineBuilder::SCHEME {
      let input = GStreamerInputPipelineBuilder::from_url(url)?
        .with_settings(settings)
        .build()?;
      return Ok(Box::new(input));
    }
  }

  error!("不支持的输入源: {}", url);
  Err(CaptureError::Unsupported(url.to_string()))
}

/// 按字符串打开输入源，便于命令行与配置文件使用
pub fn open_source_str(
  source: &str,
  settings: &CaptureSettings,
) -> Result<Box<dyn InputSource>, CaptureError> {
  let url = Url::parse(source).map_err(|e| CaptureError::Unsupported(format!("{source}: {e}")))?;
  open_source(&url, settings)
}

/// 设备序号对应的 V4L2 URL
pub fn v4l2_url(device_index: u32) -> String {
  format!("v4l2:///dev/video{device_index}")
}
