// 该文件是 Shanan （山南西风） 项目的一部分。
// src/client/machine.rs - 推流客户端状态机
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

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ClientTransportError, TerminalClientError};

/// 轮询重试预算耗尽时的错误信息
pub const FAILED_TO_FETCH: &str = "Failed to fetch frames";

/// 当前使用的取帧方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
  Mjpeg,
  Polling,
}

/// 启动时的取帧策略，`Auto` 先尝试 MJPEG，失败后降级为轮询
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum InitialMode {
  #[default]
  Auto,
  Mjpeg,
  Polling,
}

impl From<Mode> for InitialMode {
  fn from(mode: Mode) -> Self {
    match mode {
      Mode::Mjpeg => InitialMode::Mjpeg,
      Mode::Polling => InitialMode::Polling,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  /// MJPEG 连接中，尚未收到第一帧
  Connecting,
  Streaming,
  Polling,
  /// 重试预算耗尽，等待人工重连或页面重新可见
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  pub initial_mode: InitialMode,
  /// 使用带标注的推流，否则使用原始推流
  pub annotated: bool,
  pub poll_interval_ms: u64,
  pub connect_timeout_ms: u64,
  pub watchdog_interval_ms: u64,
  pub stall_threshold_ms: u64,
  pub max_mjpeg_errors: u32,
  pub mjpeg_retry_ms: u64,
  pub polling_retry_ms: u64,
  pub max_polling_failures: u32,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      initial_mode: InitialMode::Auto,
      annotated: true,
      poll_interval_ms: 100,
      connect_timeout_ms: 5000,
      watchdog_interval_ms: 2000,
      stall_threshold_ms: 8000,
      max_mjpeg_errors: 3,
      mjpeg_retry_ms: 2000,
      polling_retry_ms: 1000,
      max_polling_failures: 10,
    }
  }
}

impl ClientConfig {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  fn watchdog_interval(&self) -> Duration {
    Duration::from_millis(self.watchdog_interval_ms)
  }

  fn stall_threshold(&self) -> Duration {
    Duration::from_millis(self.stall_threshold_ms)
  }

  fn mjpeg_retry(&self) -> Duration {
    Duration::from_millis(self.mjpeg_retry_ms)
  }

  fn polling_retry(&self) -> Duration {
    Duration::from_millis(self.polling_retry_ms)
  }
}

/// 每类定时器同时最多一个
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
  Connect,
  Watchdog,
  Retry,
  Poll,
}

impl TimerKind {
  const ALL: [TimerKind; 4] = [
    TimerKind::Connect,
    TimerKind::Watchdog,
    TimerKind::Retry,
    TimerKind::Poll,
  ];

  fn index(self) -> usize {
    self as usize
  }
}

/// 定时器标识，代数不匹配的触发会被忽略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
  pub kind: TimerKind,
  pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchId(pub u64);

/// 已显示的帧资源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

/// 输入状态机的事件
#[derive(Debug, Clone)]
pub enum Event {
  Start,
  /// 推流连接收到一帧
  StreamFrame { id: StreamId, body: Bytes },
  StreamError {
    id: StreamId,
    error: ClientTransportError,
  },
  TimerFired(TimerId),
  FetchSucceeded {
    id: FetchId,
    sequence: Option<u64>,
    body: Bytes,
  },
  FetchFailed {
    id: FetchId,
    error: ClientTransportError,
  },
  VisibilityChanged { visible: bool },
  SwitchMode(Mode),
  Reconnect,
  Stop,
}

/// 对外通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
  ModeChanged(Mode),
  Connected(Mode),
  Failed(TerminalClientError),
}

/// 状态机要求执行的动作
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  OpenStream { id: StreamId, url: String },
  CloseStream { id: StreamId },
  StartTimer { id: TimerId, after: Duration },
  CancelTimer { id: TimerId },
  Fetch { id: FetchId, url: String },
  CancelFetch { id: FetchId },
  Display {
    resource: ResourceId,
    sequence: Option<u64>,
    body: Bytes,
  },
  Release { resource: ResourceId },
  Notify(Notification),
}

/// 推流客户端状态机，不做任何 I/O
#[derive(Debug)]
pub struct StreamClient {
  base_url: String,
  config: ClientConfig,
  policy: InitialMode,
  mode: Option<Mode>,
  phase: Phase,
  errors: u32,
  poll_failures: u32,
  confirmed: bool,
  timers: [Option<u64>; 4],
  generation: u64,
  next_id: u64,
  nonce: u64,
  stream: Option<StreamId>,
  stream_url: Option<String>,
  fetch: Option<FetchId>,
  displayed: Option<ResourceId>,
  last_sequence: Option<u64>,
  last_frame_at: Option<Instant>,
  visible: bool,
  out: Vec<Command>,
}

impl StreamClient {
  pub fn new(base_url: impl Into<String>, config: ClientConfig) -> Self {
    let base_url = base_url.into().trim_end_matches('/').to_string();
    Self {
      base_url,
      policy: config.initial_mode,
      config,
      mode: None,
      phase: Phase::Idle,
      errors: 0,
      poll_failures: 0,
      confirmed: false,
      timers: [None; 4],
      generation: 0,
      next_id: 0,
      nonce: 0,
      stream: None,
      stream_url: None,
      fetch: None,
      displayed: None,
      last_sequence: None,
      last_frame_at: None,
      visible: true,
      out: Vec::new(),
    }
  }

  pub fn config(&self) -> &ClientConfig {
    &self.config
  }

  pub fn mode(&self) -> Option<Mode> {
    self.mode
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn policy(&self) -> InitialMode {
    self.policy
  }

  /// MJPEG 连接错误计数
  pub fn error_count(&self) -> u32 {
    self.errors
  }

  /// 连续轮询失败次数
  pub fn polling_failures(&self) -> u32 {
    self.poll_failures
  }

  pub fn displayed(&self) -> Option<ResourceId> {
    self.displayed
  }

  pub fn last_sequence(&self) -> Option<u64> {
    self.last_sequence
  }

  pub fn is_visible(&self) -> bool {
    self.visible
  }

  /// 是否仍有定时器、请求或推流连接在进行
  pub fn has_pending(&self) -> bool {
    self.timers.iter().any(Option::is_some) || self.fetch.is_some() || self.stream.is_some()
  }

  /// 处理一个事件，返回需要执行的命令
  pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Command> {
    match event {
      Event::Start | Event::Reconnect => self.restart(),
      Event::SwitchMode(mode) => {
        info!("手动切换取帧方式: {:?}", mode);
        self.policy = mode.into();
        self.restart();
      }
      Event::Stop => self.teardown(),
      Event::VisibilityChanged { visible } => {
        self.visible = visible;
        if visible && (self.phase == Phase::Failed || !self.has_pending()) {
          info!("页面重新可见，重新连接");
          self.policy = self.config.initial_mode;
          self.restart();
        }
      }
      Event::StreamFrame { id, body } => self.on_stream_frame(id, body, now),
      Event::StreamError { id, error } => self.on_stream_error(id, error),
      Event::TimerFired(id) => self.on_timer(id, now),
      Event::FetchSucceeded { id, sequence, body } => {
        self.on_fetch_succeeded(id, sequence, body, now)
      }
      Event::FetchFailed { id, error } => self.on_fetch_failed(id, error),
    }
    std::mem::take(&mut self.out)
  }

  fn next_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  fn cache_busted(&mut self, path: &str) -> String {
    self.nonce += 1;
    format!("{}{}?t={}", self.base_url, path, self.nonce)
  }

  fn stream_path(&self) -> &'static str {
    if self.config.annotated {
      "/stream/annotated"
    } else {
      "/stream/raw"
    }
  }

  fn set_mode(&mut self, mode: Mode) {
    if self.mode != Some(mode) {
      info!("取帧方式切换为 {:?}", mode);
      self.mode = Some(mode);
      self.out.push(Command::Notify(Notification::ModeChanged(mode)));
    }
  }

  fn arm(&mut self, kind: TimerKind, after: Duration) {
    self.cancel(kind);
    self.generation += 1;
    self.timers[kind.index()] = Some(self.generation);
    self.out.push(Command::StartTimer {
      id: TimerId {
        kind,
        generation: self.generation,
      },
      after,
    });
  }

  fn cancel(&mut self, kind: TimerKind) {
    if let Some(generation) = self.timers[kind.index()].take() {
      self.out.push(Command::CancelTimer {
        id: TimerId { kind, generation },
      });
    }
  }

  /// 当前有效的定时器触发时返回 true 并清除该定时器
  fn take_fired(&mut self, id: TimerId) -> bool {
    let slot = &mut self.timers[id.kind.index()];
    if *slot == Some(id.generation) {
      *slot = None;
      true
    } else {
      false
    }
  }

  fn close_stream(&mut self) {
    if let Some(id) = self.stream.take() {
      self.out.push(Command::CloseStream { id });
    }
  }

  /// 打开推流连接，`fresh` 时生成新的防缓存 URL
  fn open_stream(&mut self, fresh: bool) {
    self.close_stream();
    let url = match self.stream_url.clone() {
      Some(url) if !fresh => url,
      _ => {
        let path = self.stream_path();
        let url = self.cache_busted(path);
        self.stream_url = Some(url.clone());
        url
      }
    };
    let id = StreamId(self.next_id());
    debug!("打开推流连接 #{}: {}", id.0, url);
    self.stream = Some(id);
    self.out.push(Command::OpenStream { id, url });
  }

  fn fetch_now(&mut self) {
    if self.fetch.is_some() {
      return;
    }
    let id = FetchId(self.next_id());
    let url = self.cache_busted("/frame/latest");
    self.fetch = Some(id);
    self.out.push(Command::Fetch { id, url });
  }

  fn display(&mut self, body: Bytes, sequence: Option<u64>) {
    let resource = ResourceId(self.next_id());
    self.out.push(Command::Display {
      resource,
      sequence,
      body,
    });
    if let Some(old) = self.displayed.replace(resource) {
      self.out.push(Command::Release { resource: old });
    }
    self.last_sequence = sequence;
  }

  /// 取消全部定时器、请求与连接，释放当前显示的资源
  fn teardown(&mut self) {
    for kind in TimerKind::ALL {
      self.cancel(kind);
    }
    self.close_stream();
    self.stream_url = None;
    if let Some(id) = self.fetch.take() {
      self.out.push(Command::CancelFetch { id });
    }
    if let Some(resource) = self.displayed.take() {
      self.out.push(Command::Release { resource });
    }
    self.last_sequence = None;
    self.last_frame_at = None;
    self.errors = 0;
    self.poll_failures = 0;
    self.confirmed = false;
    self.phase = Phase::Idle;
  }

  fn restart(&mut self) {
    self.teardown();
    match self.policy {
      InitialMode::Polling => self.enter_polling(),
      InitialMode::Auto | InitialMode::Mjpeg => self.enter_mjpeg(),
    }
  }

  fn enter_mjpeg(&mut self) {
    self.set_mode(Mode::Mjpeg);
    self.phase = Phase::Connecting;
    self.open_stream(true);
    self.arm(TimerKind::Connect, self.config.connect_timeout());
    self.arm(TimerKind::Watchdog, self.config.watchdog_interval());
  }

  fn enter_polling(&mut self) {
    self.close_stream();
    for kind in TimerKind::ALL {
      self.cancel(kind);
    }
    self.set_mode(Mode::Polling);
    self.phase = Phase::Polling;
    self.errors = 0;
    self.poll_failures = 0;
    self.confirmed = false;
    self.fetch_now();
  }

  fn mjpeg_error(&mut self) {
    self.close_stream();
    self.errors += 1;
    if self.policy == InitialMode::Auto && self.errors >= self.config.max_mjpeg_errors {
      warn!("MJPEG 连续失败 {} 次，降级为轮询", self.errors);
      self.enter_polling();
      return;
    }
    self.phase = Phase::Connecting;
    self.cancel(TimerKind::Connect);
    self.arm(TimerKind::Retry, self.config.mjpeg_retry());
  }

  fn on_stream_frame(&mut self, id: StreamId, body: Bytes, now: Instant) {
    if self.stream != Some(id) {
      return;
    }
    if self.phase == Phase::Connecting {
      self.phase = Phase::Streaming;
      self.cancel(TimerKind::Connect);
      info!("MJPEG 推流已连接");
      self
        .out
        .push(Command::Notify(Notification::Connected(Mode::Mjpeg)));
    }
    self.errors = 0;
    self.last_frame_at = Some(now);
    if !body.is_empty() {
      self.display(body, None);
    }
  }

  fn on_stream_error(&mut self, id: StreamId, error: ClientTransportError) {
    if self.stream != Some(id) {
      return;
    }
    warn!("MJPEG 推流错误: {}", error);
    self.mjpeg_error();
  }

  fn on_timer(&mut self, id: TimerId, now: Instant) {
    if !self.take_fired(id) {
      debug!("忽略过期的定时器: {:?}", id);
      return;
    }
    match id.kind {
      TimerKind::Connect => {
        if self.mode == Some(Mode::Mjpeg) && self.phase == Phase::Connecting {
          warn!("MJPEG 连接超时");
          if self.policy == InitialMode::Auto {
            self.enter_polling();
          } else {
            self.mjpeg_error();
          }
        }
      }
      TimerKind::Watchdog => {
        if self.mode != Some(Mode::Mjpeg) {
          return;
        }
        self.arm(TimerKind::Watchdog, self.config.watchdog_interval());
        let stalled = self.phase == Phase::Streaming
          && self
            .last_frame_at
            .is_some_and(|at| now.saturating_duration_since(at) > self.config.stall_threshold());
        if stalled {
          self.errors += 1;
          warn!("MJPEG 推流停滞，重新连接（第 {} 次）", self.errors);
          if self.policy == InitialMode::Auto && self.errors >= self.config.max_mjpeg_errors {
            self.enter_polling();
          } else {
            self.open_stream(true);
          }
        }
      }
      TimerKind::Retry => match self.mode {
        Some(Mode::Mjpeg) => {
          self.phase = Phase::Connecting;
          self.open_stream(false);
          self.arm(TimerKind::Connect, self.config.connect_timeout());
        }
        Some(Mode::Polling) => self.fetch_now(),
        None => {}
      },
      TimerKind::Poll => {
        if self.mode == Some(Mode::Polling) {
          self.fetch_now();
        }
      }
    }
  }

  fn on_fetch_succeeded(&mut self, id: FetchId, sequence: Option<u64>, body: Bytes, now: Instant) {
    if self.fetch != Some(id) {
      return;
    }
    self.fetch = None;
    if self.mode != Some(Mode::Polling) {
      return;
    }
    self.poll_failures = 0;
    self.errors = 0;
    self.phase = Phase::Polling;
    if !self.confirmed {
      self.confirmed = true;
      self
        .out
        .push(Command::Notify(Notification::Connected(Mode::Polling)));
    }

    if !body.is_empty() {
      // 网关重启后序号从 1 重新开始，因此只比较是否变化
      let advanced =
        self.displayed.is_none() || sequence.is_none() || sequence != self.last_sequence;
      if advanced {
        self.display(body, sequence);
        self.last_frame_at = Some(now);
      }
    }
    self.arm(TimerKind::Poll, self.config.poll_interval());
  }

  fn on_fetch_failed(&mut self, id: FetchId, error: ClientTransportError) {
    if self.fetch != Some(id) {
      return;
    }
    self.fetch = None;
    if self.mode != Some(Mode::Polling) {
      return;
    }
    self.poll_failures += 1;
    warn!(
      "获取最新帧失败（{}/{}）: {}",
      self.poll_failures, self.config.max_polling_failures, error
    );
    if self.poll_failures >= self.config.max_polling_failures {
      for kind in TimerKind::ALL {
        self.cancel(kind);
      }
      self.phase = Phase::Failed;
      self
        .out
        .push(Command::Notify(Notification::Failed(TerminalClientError {
          message: FAILED_TO_FETCH.to_string(),
        })));
      return;
    }
    self.arm(TimerKind::Retry, self.config.polling_retry());
  }
}
