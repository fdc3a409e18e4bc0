// 该文件是 Shanan （山南西风） 项目的一部分。
// src/client/driver.rs - 推流客户端的网络驱动
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

use std::{collections::HashMap, time::Instant};

use bytes::{Buf, Bytes, BytesMut};
use reqwest::header::CACHE_CONTROL;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use super::machine::{
  ClientConfig, Command, Event, FetchId, Mode, Notification, StreamClient, StreamId, TimerKind,
};
use crate::{
  error::{ClientTransportError, TerminalClientError},
  server::FRAME_SEQUENCE_HEADER,
};

/// multipart 分片头的最大长度
const MAX_PART_HEADER: usize = 16 * 1024;

/// 驱动对外报告的变化
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
  ModeChanged(Mode),
  Connected(Mode),
  Frame { sequence: Option<u64>, jpeg: Bytes },
  Failed(TerminalClientError),
}

/// 从缓冲区中取出一个完整的 multipart JPEG 分片，数据不足时返回 `None`
pub fn read_multipart_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ClientTransportError> {
  while buf.starts_with(b"\r\n") {
    buf.advance(2);
  }
  let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
    if buf.len() > MAX_PART_HEADER {
      return Err(ClientTransportError::Body("multipart 分片头过长".to_string()));
    }
    return Ok(None);
  };

  let header = String::from_utf8_lossy(&buf[..header_end]);
  let length = header
    .lines()
    .filter_map(|line| line.split_once(':'))
    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
    .ok_or_else(|| ClientTransportError::Body("multipart 分片缺少 Content-Length".to_string()))?;

  let body_start = header_end + 4;
  if buf.len() < body_start + length {
    return Ok(None);
  }
  buf.advance(body_start);
  Ok(Some(buf.split_to(length).freeze()))
}

async fn stream_frames(
  http: &reqwest::Client,
  id: StreamId,
  url: &str,
  events: &mpsc::UnboundedSender<Event>,
) -> Result<(), ClientTransportError> {
  let mut response = http
    .get(url)
    .header(CACHE_CONTROL, "no-cache")
    .send()
    .await
    .map_err(|e| ClientTransportError::Connect(e.to_string()))?;
  if !response.status().is_success() {
    return Err(ClientTransportError::Status(response.status().as_u16()));
  }

  let mut buf = BytesMut::new();
  loop {
    while let Some(jpeg) = read_multipart_frame(&mut buf)? {
      if jpeg.is_empty() {
        return Err(ClientTransportError::ImageLoad);
      }
      if events.send(Event::StreamFrame { id, body: jpeg }).is_err() {
        return Ok(());
      }
    }
    match response
      .chunk()
      .await
      .map_err(|e| ClientTransportError::Body(e.to_string()))?
    {
      Some(chunk) => buf.extend_from_slice(&chunk),
      None => return Err(ClientTransportError::Body("推流连接已关闭".to_string())),
    }
  }
}

async fn fetch_frame(
  http: &reqwest::Client,
  url: &str,
  timeout: std::time::Duration,
) -> Result<(Option<u64>, Bytes), ClientTransportError> {
  let response = http
    .get(url)
    .header(CACHE_CONTROL, "no-store")
    .timeout(timeout)
    .send()
    .await
    .map_err(|e| ClientTransportError::Connect(e.to_string()))?;
  if !response.status().is_success() {
    return Err(ClientTransportError::Status(response.status().as_u16()));
  }
  let sequence = response
    .headers()
    .get(FRAME_SEQUENCE_HEADER)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok());
  let body = response
    .bytes()
    .await
    .map_err(|e| ClientTransportError::Body(e.to_string()))?;
  Ok((sequence, body))
}

/// 向运行中的驱动发送控制事件
#[derive(Debug, Clone)]
pub struct DriverHandle {
  events: mpsc::UnboundedSender<Event>,
}

impl DriverHandle {
  pub fn switch_mode(&self, mode: Mode) {
    let _ = self.events.send(Event::SwitchMode(mode));
  }

  pub fn reconnect(&self) {
    let _ = self.events.send(Event::Reconnect);
  }

  pub fn set_visible(&self, visible: bool) {
    let _ = self.events.send(Event::VisibilityChanged { visible });
  }

  /// 停止驱动，`run` 随后返回
  pub fn stop(&self) {
    let _ = self.events.send(Event::Stop);
  }
}

/// 用 tokio 与 reqwest 执行状态机命令
pub struct StreamDriver {
  machine: StreamClient,
  http: reqwest::Client,
  events_tx: mpsc::UnboundedSender<Event>,
  events_rx: mpsc::UnboundedReceiver<Event>,
  updates: mpsc::UnboundedSender<ClientUpdate>,
  timers: HashMap<TimerKind, (u64, JoinHandle<()>)>,
  streams: HashMap<StreamId, JoinHandle<()>>,
  fetches: HashMap<FetchId, JoinHandle<()>>,
}

impl StreamDriver {
  pub fn new(
    base_url: impl Into<String>,
    config: ClientConfig,
  ) -> Result<(Self, mpsc::UnboundedReceiver<ClientUpdate>), ClientTransportError> {
    let http = reqwest::Client::builder()
      .connect_timeout(config.connect_timeout())
      .build()
      .map_err(|e| ClientTransportError::Connect(e.to_string()))?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (updates, updates_rx) = mpsc::unbounded_channel();
    let driver = Self {
      machine: StreamClient::new(base_url, config),
      http,
      events_tx,
      events_rx,
      updates,
      timers: HashMap::new(),
      streams: HashMap::new(),
      fetches: HashMap::new(),
    };
    Ok((driver, updates_rx))
  }

  pub fn handle(&self) -> DriverHandle {
    DriverHandle {
      events: self.events_tx.clone(),
    }
  }

  /// 启动客户端并处理事件，直到收到停止事件
  pub async fn run(mut self) {
    info!("推流客户端启动");
    self.apply(Event::Start);
    while let Some(event) = self.events_rx.recv().await {
      let stop = matches!(event, Event::Stop);
      self.apply(event);
      if stop {
        break;
      }
    }
    self.abort_all();
    info!("推流客户端已停止");
  }

  fn apply(&mut self, event: Event) {
    if let Event::FetchSucceeded { id, .. } | Event::FetchFailed { id, .. } = &event {
      self.fetches.remove(id);
    }
    for command in self.machine.handle(event, Instant::now()) {
      self.execute(command);
    }
  }

  fn execute(&mut self, command: Command) {
    match command {
      Command::OpenStream { id, url } => {
        debug!("打开推流: {}", url);
        let http = self.http.clone();
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
          if let Err(error) = stream_frames(&http, id, &url, &events).await {
            let _ = events.send(Event::StreamError { id, error });
          }
        });
        self.streams.insert(id, task);
      }
      Command::CloseStream { id } => {
        if let Some(task) = self.streams.remove(&id) {
          task.abort();
        }
      }
      Command::StartTimer { id, after } => {
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
          tokio::time::sleep(after).await;
          let _ = events.send(Event::TimerFired(id));
        });
        if let Some((_, old)) = self.timers.insert(id.kind, (id.generation, task)) {
          old.abort();
        }
      }
      Command::CancelTimer { id } => {
        if self
          .timers
          .get(&id.kind)
          .is_some_and(|(generation, _)| *generation == id.generation)
        {
          if let Some((_, task)) = self.timers.remove(&id.kind) {
            task.abort();
          }
        }
      }
      Command::Fetch { id, url } => {
        let http = self.http.clone();
        let events = self.events_tx.clone();
        let timeout = self.machine.config().connect_timeout();
        let task = tokio::spawn(async move {
          let event = match fetch_frame(&http, &url, timeout).await {
            Ok((sequence, body)) => Event::FetchSucceeded { id, sequence, body },
            Err(error) => Event::FetchFailed { id, error },
          };
          let _ = events.send(event);
        });
        self.fetches.insert(id, task);
      }
      Command::CancelFetch { id } => {
        if let Some(task) = self.fetches.remove(&id) {
          task.abort();
        }
      }
      Command::Display {
        resource,
        sequence,
        body,
      } => {
        debug!("显示帧 {:?}: {} 字节", resource, body.len());
        let _ = self.updates.send(ClientUpdate::Frame {
          sequence,
          jpeg: body,
        });
      }
      Command::Release { resource } => debug!("释放帧 {:?}", resource),
      Command::Notify(notification) => {
        let update = match notification {
          Notification::ModeChanged(mode) => ClientUpdate::ModeChanged(mode),
          Notification::Connected(mode) => ClientUpdate::Connected(mode),
          Notification::Failed(error) => {
            warn!("推流客户端进入错误状态: {}", error);
            ClientUpdate::Failed(error)
          }
        };
        let _ = self.updates.send(update);
      }
    }
  }

  fn abort_all(&mut self) {
    for (_, (_, task)) in self.timers.drain() {
      task.abort();
    }
    for (_, task) in self.streams.drain() {
      task.abort();
    }
    for (_, task) in self.fetches.drain() {
      task.abort();
    }
  }
}

impl Drop for StreamDriver {
  fn drop(&mut self) {
    self.abort_all();
  }
}
