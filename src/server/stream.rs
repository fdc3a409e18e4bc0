// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server/stream.rs - MJPEG 推流、最新帧与快照
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

use std::convert::Infallible;

use async_stream::stream;
use axum::{
  body::Body,
  extract::{Query, State},
  http::{StatusCode, header},
  response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AppState, FRAME_SEQUENCE_HEADER, routes::json_error};
use crate::output::encode_jpeg;

const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// 组装一个 multipart 分片
fn multipart_part(jpeg: &[u8]) -> Bytes {
  let header = format!(
    "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
    jpeg.len()
  );
  let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
  part.put_slice(header.as_bytes());
  part.put_slice(jpeg);
  part.put_slice(b"\r\n");
  part.freeze()
}

fn no_frame() -> Response {
  json_error(StatusCode::SERVICE_UNAVAILABLE, "No frame available")
}

/// 推流会话：每个连接持有独立的订阅，只发送最新的一帧
fn mjpeg_response(state: AppState, annotated: bool) -> Response {
  let mut rx = state.publisher.subscribe();
  let kind = if annotated { "annotated" } else { "raw" };
  debug!("推流会话开始: {}", kind);

  let body = stream! {
    let mut last_sequence = 0u64;
    loop {
      let current = rx.borrow_and_update().clone();
      if current.has_frame() && current.sequence > last_sequence {
        last_sequence = current.sequence;
        yield Ok::<Bytes, Infallible>(multipart_part(current.jpeg(annotated)));
      }
      if rx.changed().await.is_err() {
        debug!("发布端已关闭，结束推流会话: {}", kind);
        break;
      }
    }
  };

  Response::builder()
    .status(StatusCode::OK)
    .header(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)
    .header(header::CACHE_CONTROL, "no-cache, no-store")
    .body(Body::from_stream(body))
    .unwrap_or_else(|e| json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
}

pub(super) async fn annotated_stream(State(state): State<AppState>) -> Response {
  mjpeg_response(state, true)
}

pub(super) async fn raw_stream(State(state): State<AppState>) -> Response {
  mjpeg_response(state, false)
}

/// 最新一帧（带标注），轮询客户端使用
pub(super) async fn latest_frame(State(state): State<AppState>) -> Response {
  let current = state.publisher.current();
  if !current.has_frame() {
    return no_frame();
  }

  (
    [
      (header::CONTENT_TYPE, "image/jpeg".to_string()),
      (header::CACHE_CONTROL, "no-cache, no-store".to_string()),
      (
        header::HeaderName::from_static(FRAME_SEQUENCE_HEADER),
        current.sequence.to_string(),
      ),
    ],
    current.annotated_jpeg.clone(),
  )
    .into_response()
}

#[derive(Debug, Deserialize)]
pub(super) struct SnapshotQuery {
  annotated: Option<String>,
}

impl SnapshotQuery {
  fn annotated(&self) -> bool {
    !matches!(
      self.annotated.as_deref().map(str::to_ascii_lowercase).as_deref(),
      Some("false" | "0" | "no")
    )
  }
}

/// 快照下载，默认带标注，按更高质量重新编码
pub(super) async fn snapshot(
  State(state): State<AppState>,
  Query(query): Query<SnapshotQuery>,
) -> Response {
  let current = state.publisher.current();
  if !current.has_frame() {
    return no_frame();
  }
  let annotated = query.annotated();
  let quality = state.snapshot_quality;

  let jpeg = match current.image(annotated).cloned() {
    Some(image) => {
      let encoded =
        tokio::task::spawn_blocking(move || encode_jpeg(&image, quality)).await;
      match encoded {
        Ok(Ok(jpeg)) => Bytes::from(jpeg),
        Ok(Err(e)) => {
          warn!("快照编码失败，使用推流帧: {}", e);
          current.jpeg(annotated).clone()
        }
        Err(e) => {
          warn!("快照编码任务失败，使用推流帧: {}", e);
          current.jpeg(annotated).clone()
        }
      }
    }
    None => current.jpeg(annotated).clone(),
  };

  (
    [
      (header::CONTENT_TYPE, "image/jpeg".to_string()),
      (
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"snapshot_{}.jpg\"", current.sequence),
      ),
      (header::CACHE_CONTROL, "no-cache, no-store".to_string()),
    ],
    jpeg,
  )
    .into_response()
}
