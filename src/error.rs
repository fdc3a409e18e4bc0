// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 错误类型与状态码
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

use std::path::PathBuf;

use thiserror::Error;

use crate::{frame::FrameError, model::ModelFormat};

/// 模型加载错误，加载失败时原有模型保持不变
#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型路径不存在: {0}")]
  NotFound(PathBuf),
  #[error("无法识别模型格式: {0}")]
  UnknownFormat(PathBuf),
  #[error("缺少模型文件: {0}")]
  MissingFile(String),
  #[error("标签文件缺失或为空: {0}")]
  Labels(PathBuf),
  #[error("模型清单无效: {0}")]
  Manifest(String),
  #[error("当前构建未包含 {0} 推理后端")]
  BackendUnavailable(ModelFormat),
  #[error("推理后端拒绝加载模型: {0}")]
  Backend(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 推理错误
#[derive(Error, Debug)]
pub enum InferenceError {
  /// 在未加载模型的上下文上调用推理
  #[error("未加载模型")]
  NoModel,
  #[error("输入无效: {0}")]
  Input(#[from] FrameError),
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("模型输出解码失败: {0}")]
  Decode(String),
}

/// 采集错误，采集循环据此进入 DEGRADED 状态
#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("无法打开输入源 {0}: {1}")]
  Open(String, String),
  #[error("采集帧失败: {0}")]
  Acquire(String),
  #[error("采集超时")]
  Timeout,
  #[error("输入源已结束")]
  EndOfStream,
  #[error("不支持的输入源: {0}")]
  Unsupported(String),
  #[error("采集已在运行")]
  AlreadyRunning,
}

/// 流客户端的网络 / HTTP 错误，可通过重试或降级恢复
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientTransportError {
  #[error("连接失败: {0}")]
  Connect(String),
  #[error("HTTP 状态异常: {0}")]
  Status(u16),
  #[error("图像加载失败")]
  ImageLoad,
  #[error("读取响应失败: {0}")]
  Body(String),
}

/// 重试预算耗尽，需要人工重连
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TerminalClientError {
  pub message: String,
}

/// 服务启动错误
#[derive(Error, Debug)]
pub enum ServerError {
  #[error("服务已在运行")]
  AlreadyRunning,
  #[error("无法绑定地址 {0}: {1}")]
  Bind(String, std::io::Error),
  #[error("无法创建异步运行时: {0}")]
  Runtime(std::io::Error),
}

/// 库级错误汇总
#[derive(Error, Debug)]
pub enum Error {
  #[error(transparent)]
  ModelLoad(#[from] ModelLoadError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  Capture(#[from] CaptureError),
  #[error(transparent)]
  Frame(#[from] FrameError),
  #[error(transparent)]
  Server(#[from] ServerError),
  #[error(transparent)]
  Transport(#[from] ClientTransportError),
  #[error(transparent)]
  TerminalClient(#[from] TerminalClientError),
}

/// 对外状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
  Ok = 0,
  Error = -1,
  ErrorFile = -2,
  ErrorModel = -3,
  ErrorMemory = -4,
  ErrorInput = -5,
}

impl Status {
  pub fn code(self) -> i32 {
    self as i32
  }

  pub fn is_ok(self) -> bool {
    self == Status::Ok
  }
}

impl Error {
  pub fn status(&self) -> Status {
    match self {
      Error::ModelLoad(ModelLoadError::MissingFile(_))
      | Error::ModelLoad(ModelLoadError::Labels(_))
      | Error::ModelLoad(ModelLoadError::Io(_)) => Status::ErrorFile,
      Error::ModelLoad(_) => Status::ErrorModel,
      Error::Inference(InferenceError::NoModel) => Status::ErrorModel,
      Error::Inference(InferenceError::Input(_)) | Error::Frame(_) => Status::ErrorInput,
      Error::Inference(_) => Status::Error,
      Error::Capture(CaptureError::Unsupported(_)) => Status::ErrorInput,
      Error::Capture(_) | Error::Server(_) => Status::Error,
      Error::Transport(_) | Error::TerminalClient(_) => Status::Error,
    }
  }
}
