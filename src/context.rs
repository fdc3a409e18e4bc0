// 该文件是 Shanan （山南西风） 项目的一部分。
// src/context.rs - 推理上下文
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

//! 推理上下文：模型、采集循环与 HTTP 服务的统一入口。
//!
//! 所有操作都返回 [`Status`]，失败时可通过 [`InferenceContext::error`] 取得说明。

use std::{
  net::SocketAddr,
  path::{Path, PathBuf},
  sync::Arc,
};

use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::{
  error::{CaptureError, Error, InferenceError, ServerError, Status},
  frame::{Frame, FrameError},
  input::{CaptureSettings, open_source, v4l2_url},
  model::{Detection, Model, ModelSlot},
  output::SNAPSHOT_JPEG_QUALITY,
  pipeline::{
    CaptureHandle, CaptureState, Pipeline, PipelineConfig, PublishState, Publisher, SourceOpener,
  },
  server::{AppState, StreamServer},
  stats::{DEFAULT_HISTORY_CAPACITY, DetectionStats},
};

/// 上下文创建参数
#[derive(Debug, Clone)]
pub struct ContextOptions {
  pub pipeline: PipelineConfig,
  pub capture: CaptureSettings,
  pub history_capacity: usize,
  pub snapshot_quality: u8,
  /// `start_server` 绑定的主机地址
  pub bind_host: String,
  pub models_dir: Option<PathBuf>,
}

impl Default for ContextOptions {
  fn default() -> Self {
    Self {
      pipeline: PipelineConfig::default(),
      capture: CaptureSettings::default(),
      history_capacity: DEFAULT_HISTORY_CAPACITY,
      snapshot_quality: SNAPSHOT_JPEG_QUALITY,
      bind_host: "0.0.0.0".to_string(),
      models_dir: None,
    }
  }
}

/// 上下文状态，任一操作失败后为 `Error`，下一次成功的操作恢复为 `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ContextState {
  Ready = 0,
  Loading = 1,
  Error = 2,
}

impl ContextState {
  pub fn code(self) -> i32 {
    self as i32
  }
}

pub struct InferenceContext {
  models: Arc<ModelSlot>,
  publisher: Arc<Publisher>,
  pipeline: Pipeline,
  app: AppState,
  capture_settings: CaptureSettings,
  bind_host: String,
  capture: Option<CaptureHandle>,
  server: Option<StreamServer>,
  results: Vec<Detection>,
  batch_results: Vec<Vec<Detection>>,
  last_error: Option<String>,
  state: ContextState,
  predictions: u64,
}

impl InferenceContext {
  pub fn create() -> Self {
    Self::with_options(ContextOptions::default())
  }

  pub fn with_options(options: ContextOptions) -> Self {
    let models = Arc::new(ModelSlot::new());
    let publisher = Arc::new(Publisher::new());
    let stats = Arc::new(DetectionStats::new(options.history_capacity));
    let pipeline = Pipeline::new(
      models.clone(),
      publisher.clone(),
      stats.clone(),
      options.pipeline,
    );
    let app = AppState::new(publisher.clone(), models.clone(), stats, options.models_dir)
      .with_snapshot_quality(options.snapshot_quality);
    Self {
      models,
      publisher,
      pipeline,
      app,
      capture_settings: options.capture,
      bind_host: options.bind_host,
      capture: None,
      server: None,
      results: Vec::new(),
      batch_results: Vec::new(),
      last_error: None,
      state: ContextState::Ready,
      predictions: 0,
    }
  }

  pub fn version() -> &'static str {
    crate::VERSION
  }

  fn fail(&mut self, err: impl Into<Error>) -> Status {
    let err = err.into();
    warn!("{}", err);
    let status = err.status();
    self.last_error = Some(err.to_string());
    self.state = ContextState::Error;
    status
  }

  fn succeed(&mut self) -> Status {
    self.last_error = None;
    self.state = ContextState::Ready;
    Status::Ok
  }

  /// 最近一次失败的说明
  pub fn error(&self) -> Option<String> {
    self.last_error.clone()
  }

  pub fn state(&self) -> ContextState {
    self.state
  }

  /// 加载模型，失败时保留原模型
  pub fn load(&mut self, path: impl AsRef<Path>) -> Status {
    self.state = ContextState::Loading;
    match self.models.load(path.as_ref()) {
      Ok(model) => {
        info!("模型已加载: {}", model.name());
        self.succeed()
      }
      Err(e) => self.fail(e),
    }
  }

  /// 直接安装已构建的模型，用于自定义推理后端
  pub fn install(&mut self, model: Model) -> Status {
    self.models.install(model);
    self.succeed()
  }

  pub fn unload(&mut self) {
    self.models.unload();
  }

  pub fn model_name(&self) -> Option<String> {
    self.models.name()
  }

  pub fn set_models_dir(&mut self, dir: Option<PathBuf>) {
    self.app.set_models_dir(dir);
  }

  /// 对一张原始图像推理，结果保存在上下文中
  pub fn predict_image(&mut self, data: &[u8], width: u32, height: u32, channels: u32) -> Status {
    self.results.clear();
    self.batch_results.clear();
    self.predictions += 1;
    let frame = match Frame::from_raw(data, width, height, channels, self.predictions) {
      Ok(frame) => frame,
      Err(e) => return self.fail(e),
    };
    match self.models.predict(&frame) {
      Ok(detections) => {
        self.results = detections;
        self.succeed()
      }
      Err(e) => self.fail(e),
    }
  }

  /// 依次推理多帧，遇到第一个失败即停止
  ///
  /// 每帧的结果可通过 [`Self::batch_results`] 取得，`results` 为最后一帧的结果。
  pub fn predict_batch(&mut self, frames: &[Frame]) -> Status {
    self.results.clear();
    self.batch_results.clear();
    if frames.is_empty() {
      return self.fail(InferenceError::Input(FrameError::Empty));
    }
    for frame in frames {
      match self.models.predict(frame) {
        Ok(detections) => self.batch_results.push(detections),
        Err(e) => return self.fail(e),
      }
    }
    self.results = self.batch_results.last().cloned().unwrap_or_default();
    self.succeed()
  }

  pub fn batch_results(&self) -> &[Vec<Detection>] {
    &self.batch_results
  }

  pub fn results(&self) -> &[Detection] {
    &self.results
  }

  pub fn result_count(&self) -> usize {
    self.results.len()
  }

  /// 第 `index` 个结果的归一化边框 `(x, y, w, h)`
  pub fn result_bbox(&self, index: usize) -> Option<(f32, f32, f32, f32)> {
    self
      .results
      .get(index)
      .map(|d| (d.bbox[0], d.bbox[1], d.bbox[2], d.bbox[3]))
  }

  pub fn result_score(&self, index: usize) -> f32 {
    self.results.get(index).map_or(0.0, |d| d.confidence)
  }

  pub fn result_label(&self, index: usize) -> Option<&str> {
    self.results.get(index).map(|d| d.label.as_str())
  }

  pub fn result_json(&self) -> String {
    serde_json::json!({
      "detections": self.results,
      "count": self.results.len(),
    })
    .to_string()
  }

  /// 在 `bind_host:port` 上启动 HTTP 服务
  pub fn start_server(&mut self, port: u16) -> Status {
    let bind = format!("{}:{}", self.bind_host, port);
    self.start_server_on(&bind)
  }

  pub fn start_server_on(&mut self, bind: &str) -> Status {
    if self.server.is_some() {
      return self.fail(ServerError::AlreadyRunning);
    }
    match StreamServer::start(bind, self.app.clone()) {
      Ok(server) => {
        self.server = Some(server);
        self.succeed()
      }
      Err(e) => self.fail(e),
    }
  }

  pub fn server_addr(&self) -> Option<SocketAddr> {
    self.server.as_ref().map(StreamServer::local_addr)
  }

  pub fn stop_server(&mut self) {
    if let Some(mut server) = self.server.take() {
      server.stop();
    }
  }

  /// 打开 `/dev/video{index}` 并启动采集循环
  pub fn start_camera(&mut self, device_index: u32) -> Status {
    self.start_source(&v4l2_url(device_index))
  }

  /// 按 URL 打开输入源并启动采集循环，只允许在 STOPPED 状态下调用
  ///
  /// 输入源暂时不可用时仍然启动，采集循环处于 DEGRADED 并按退避重试。
  pub fn start_source(&mut self, source: &str) -> Status {
    if self.capture.is_some() {
      return self.fail(CaptureError::AlreadyRunning);
    }
    let url = match Url::parse(source) {
      Ok(url) => url,
      Err(e) => return self.fail(CaptureError::Unsupported(format!("{source}: {e}"))),
    };

    let settings = self.capture_settings.clone();
    let mut first = match open_source(&url, &settings) {
      Ok(opened) => Some(opened),
      Err(e @ CaptureError::Unsupported(_)) => return self.fail(e),
      Err(e) => {
        warn!("输入源暂不可用，采集循环将重试: {}", e);
        None
      }
    };

    let opener: SourceOpener = Box::new(move || match first.take() {
      Some(opened) => Ok(opened),
      None => open_source(&url, &settings),
    });

    match self.pipeline.spawn(opener) {
      Ok(handle) => {
        self.capture = Some(handle);
        self.succeed()
      }
      Err(e) => self.fail(e),
    }
  }

  pub fn stop_camera(&mut self) {
    if let Some(mut capture) = self.capture.take() {
      capture.stop();
    }
  }

  pub fn capture_state(&self) -> CaptureState {
    self
      .capture
      .as_ref()
      .map_or(CaptureState::Stopped, CaptureHandle::state)
  }

  /// 最近一次发布的帧率，未采集时为 0
  pub fn get_fps(&self) -> f32 {
    if self.capture.is_some() {
      self.publisher.current().fps
    } else {
      0.0
    }
  }

  /// 订阅发布的帧
  pub fn publish_receiver(&self) -> watch::Receiver<Arc<PublishState>> {
    self.publisher.subscribe()
  }

  /// 停止采集与服务并释放上下文
  pub fn destroy(mut self) {
    self.shutdown();
  }

  fn shutdown(&mut self) {
    self.stop_camera();
    self.stop_server();
  }
}

impl Default for InferenceContext {
  fn default() -> Self {
    Self::create()
  }
}

impl Drop for InferenceContext {
  fn drop(&mut self) {
    self.shutdown();
  }
}
