// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 网关参数与配置文件
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

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  context::ContextOptions,
  input::CaptureSettings,
  output::{AnnotationOptions, SNAPSHOT_JPEG_QUALITY, STREAM_JPEG_QUALITY},
  pipeline::PipelineConfig,
  stats::DEFAULT_HISTORY_CAPACITY,
};

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {0}: {1}")]
  Io(PathBuf, std::io::Error),
  #[error("配置文件格式错误 {0}: {1}")]
  Parse(PathBuf, serde_json::Error),
}

/// Shanan 边缘网关参数配置
///
/// 命令行参数覆盖配置文件中的同名字段。
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct GatewayArgs {
  /// JSON 配置文件路径
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 监听地址
  #[arg(long, value_name = "HOST")]
  pub bind: Option<String>,

  /// 监听端口
  #[arg(long, short, value_name = "PORT")]
  pub port: Option<u16>,

  /// 输入来源
  /// 支持格式:
  /// - V4L2: v4l2:///dev/video0
  /// - 图片: image:///path/to/image.jpg
  /// - 测试图案: pattern://?width=640&height=480&fps=30
  /// - GStreamer: gst://camera/dev/video0（需要 gstreamer_input 特性）
  #[arg(long, value_name = "SOURCE")]
  pub source: Option<String>,

  /// 采集宽度
  #[arg(long, value_name = "PIXELS")]
  pub width: Option<u32>,

  /// 采集高度
  #[arg(long, value_name = "PIXELS")]
  pub height: Option<u32>,

  /// 采集帧率
  #[arg(long, value_name = "FPS")]
  pub fps: Option<u32>,

  /// 启动时加载的模型目录或文件
  #[arg(long, value_name = "PATH")]
  pub model: Option<PathBuf>,

  /// 可通过 /api/model 切换的模型目录
  #[arg(long, value_name = "DIR")]
  pub models_dir: Option<PathBuf>,

  /// 推流 JPEG 质量 (1 - 100)
  #[arg(long, value_name = "QUALITY")]
  pub stream_quality: Option<u8>,

  /// 快照 JPEG 质量 (1 - 100)
  #[arg(long, value_name = "QUALITY")]
  pub snapshot_quality: Option<u8>,

  /// 标注字体文件
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 保留的检测记录条数
  #[arg(long, value_name = "COUNT")]
  pub history_capacity: Option<usize>,
}

/// 网关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  pub bind: String,
  pub port: u16,
  pub source: String,
  #[serde(flatten)]
  pub capture: CaptureSettings,
  pub model: Option<PathBuf>,
  pub models_dir: Option<PathBuf>,
  pub stream_quality: u8,
  pub snapshot_quality: u8,
  pub annotation: AnnotationOptions,
  pub history_capacity: usize,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      bind: "0.0.0.0".to_string(),
      port: DEFAULT_PORT,
      source: "v4l2:///dev/video0".to_string(),
      capture: CaptureSettings::default(),
      model: None,
      models_dir: None,
      stream_quality: STREAM_JPEG_QUALITY,
      snapshot_quality: SNAPSHOT_JPEG_QUALITY,
      annotation: AnnotationOptions::default(),
      history_capacity: DEFAULT_HISTORY_CAPACITY,
    }
  }
}

impl GatewayConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let text =
      std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
  }

  pub fn bind_address(&self) -> String {
    format!("{}:{}", self.bind, self.port)
  }

  pub fn context_options(&self) -> ContextOptions {
    ContextOptions {
      pipeline: PipelineConfig {
        annotation: self.annotation.clone(),
        stream_quality: self.stream_quality.clamp(1, 100),
        ..PipelineConfig::default()
      },
      capture: self.capture.clone(),
      history_capacity: self.history_capacity,
      snapshot_quality: self.snapshot_quality.clamp(1, 100),
      bind_host: self.bind.clone(),
      models_dir: self.models_dir.clone(),
    }
  }
}

impl GatewayArgs {
  /// 读取配置文件（如有）并应用命令行覆盖
  pub fn resolve(&self) -> Result<GatewayConfig, ConfigError> {
    let mut config = match &self.config {
      Some(path) => GatewayConfig::from_file(path)?,
      None => GatewayConfig::default(),
    };

    if let Some(bind) = &self.bind {
      config.bind = bind.clone();
    }
    if let Some(port) = self.port {
      config.port = port;
    }
    if let Some(source) = &self.source {
      config.source = source.clone();
    }
    if let Some(width) = self.width {
      config.capture.width = width;
    }
    if let Some(height) = self.height {
      config.capture.height = height;
    }
    if let Some(fps) = self.fps {
      config.capture.fps = fps;
    }
    if self.model.is_some() {
      config.model = self.model.clone();
    }
    if self.models_dir.is_some() {
      config.models_dir = self.models_dir.clone();
    }
    if let Some(quality) = self.stream_quality {
      config.stream_quality = quality;
    }
    if let Some(quality) = self.snapshot_quality {
      config.snapshot_quality = quality;
    }
    if self.font.is_some() {
      config.annotation.font_path = self.font.clone();
    }
    if let Some(capacity) = self.history_capacity {
      config.history_capacity = capacity;
    }
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  #[test]
  fn file_values_are_overridden_by_flags() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
      file,
      r#"{{"port": 9000, "source": "pattern://", "width": 640, "stream_quality": 70,
          "annotation": {{"show_fps": false}}}}"#
    )
    .unwrap();

    let args = GatewayArgs {
      config: Some(file.path().to_path_buf()),
      port: Some(9100),
      height: Some(360),
      ..GatewayArgs::default()
    };
    let config = args.resolve().unwrap();
    assert_eq!(config.port, 9100);
    assert_eq!(config.source, "pattern://");
    assert_eq!(config.capture.width, 640);
    assert_eq!(config.capture.height, 360);
    assert_eq!(config.stream_quality, 70);
    assert_eq!(config.snapshot_quality, SNAPSHOT_JPEG_QUALITY);
    assert!(!config.annotation.show_fps);
    assert!(config.annotation.show_boxes);
    assert_eq!(config.bind_address(), "0.0.0.0:9100");
  }

  #[test]
  fn defaults_without_file() {
    let config = GatewayArgs::default().resolve().unwrap();
    assert_eq!(config, GatewayConfig::default());
    assert_eq!(config.port, 8080);
    assert_eq!(config.capture.width, 1280);
    assert_eq!(config.capture.height, 720);
    assert_eq!(config.capture.fps, 30);
  }

  #[test]
  fn reports_bad_json() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();
    let err = GatewayConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(..)));
  }

  #[test]
  fn parses_command_line() {
    let args = GatewayArgs::parse_from([
      "shanan-gateway",
      "--port",
      "8081",
      "--source",
      "pattern://?fps=10",
      "--models-dir",
      "/opt/models",
    ]);
    let config = args.resolve().unwrap();
    assert_eq!(config.port, 8081);
    assert_eq!(config.source, "pattern://?fps=10");
    assert_eq!(config.models_dir, Some(PathBuf::from("/opt/models")));
  }
}
