// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server/routes.rs - JSON 接口
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

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use axum::{
  Json,
  body::Bytes,
  extract::{Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use crate::{
  error::ModelLoadError,
  model::{Detection, ModelFiles, ModelFormat},
  stats::parse_period,
};

pub(super) fn json_error(status: StatusCode, message: &str) -> Response {
  (status, Json(json!({ "error": message }))).into_response()
}

fn local_timestamp() -> String {
  chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[derive(Debug, Deserialize)]
pub(super) struct PeriodQuery {
  period: Option<String>,
}

impl PeriodQuery {
  /// 解析时间段，无效时返回 400 响应
  fn parse(&self) -> Result<Option<(String, std::time::Duration)>, Response> {
    match self.period.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
      None => Ok(None),
      Some(text) => parse_period(text)
        .map(|d| Some((text.to_string(), d)))
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &e.to_string())),
    }
  }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
  status: &'static str,
  version: &'static str,
  uptime: u64,
  timestamp: String,
  fps: f32,
  temperature: f32,
  cpu_usage: f32,
  memory_usage: f32,
  model_loaded: bool,
  model_name: Option<String>,
  camera_running: bool,
  camera_state: &'static str,
  detections: usize,
  defects_total: u64,
  defects_per_hour: f64,
}

/// 存活检查，任何采集状态下都返回 200
pub(super) async fn health(State(state): State<AppState>) -> Response {
  let current = state.publisher.current();
  let system = state.system.clone();
  let metrics = tokio::task::spawn_blocking(move || system.sample())
    .await
    .unwrap_or_default();
  let counters = state.stats.counters();

  let status = if current.state == crate::pipeline::CaptureState::Degraded {
    "degraded"
  } else {
    "ok"
  };

  Json(HealthResponse {
    status,
    version: crate::VERSION,
    uptime: state.stats.uptime().as_secs(),
    timestamp: local_timestamp(),
    fps: current.fps,
    temperature: metrics.temperature,
    cpu_usage: metrics.cpu_usage,
    memory_usage: metrics.memory_usage,
    model_loaded: state.models.is_loaded(),
    model_name: state.models.name(),
    camera_running: current.state.is_active(),
    camera_state: current.state.as_str(),
    detections: current.detections.len(),
    defects_total: counters.total_detections,
    defects_per_hour: state.stats.detections_per_hour(),
  })
  .into_response()
}

#[derive(Debug, Serialize)]
struct ResultsResponse {
  detections: Vec<Detection>,
  count: usize,
  sequence: u64,
  timestamp: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  period: Option<String>,
}

/// 当前绘制的检测结果，或指定时间段内记录的检测结果
pub(super) async fn results(
  State(state): State<AppState>,
  Query(query): Query<PeriodQuery>,
) -> Response {
  let period = match query.parse() {
    Ok(period) => period,
    Err(response) => return response,
  };
  let current = state.publisher.current();

  let (detections, period) = match period {
    None => (current.detections.clone(), None),
    Some((text, duration)) => (
      state.stats.detections_within(duration, crate::now_ms()),
      Some(text),
    ),
  };

  Json(ResultsResponse {
    count: detections.len(),
    detections,
    sequence: current.sequence,
    timestamp: current.timestamp_ms,
    period,
  })
  .into_response()
}

#[derive(Debug, Serialize)]
struct StatsResponse {
  total_detections: u64,
  total_frames: u64,
  by_label: BTreeMap<String, u64>,
  fps: f32,
  uptime_sec: u64,
  timestamp: String,
  model_loaded: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  period: Option<String>,
}

/// 累计统计，指定时间段时只统计该时间段
pub(super) async fn stats(
  State(state): State<AppState>,
  Query(query): Query<PeriodQuery>,
) -> Response {
  let period = match query.parse() {
    Ok(period) => period,
    Err(response) => return response,
  };

  let (counters, period) = match period {
    None => (state.stats.counters(), None),
    Some((text, duration)) => (
      state.stats.counters_within(duration, crate::now_ms()),
      Some(text),
    ),
  };

  Json(StatsResponse {
    total_detections: counters.total_detections,
    total_frames: counters.total_frames,
    by_label: counters.by_label,
    fps: state.publisher.current().fps,
    uptime_sec: state.stats.uptime().as_secs(),
    timestamp: local_timestamp(),
    model_loaded: state.models.is_loaded(),
    period,
  })
  .into_response()
}

#[derive(Debug, Serialize)]
struct ModelEntry {
  name: String,
  format: Option<ModelFormat>,
  active: bool,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
  models_dir: Option<PathBuf>,
  active: Option<String>,
  models: Vec<ModelEntry>,
}

fn scan_models(dir: &Path, active: Option<&Path>) -> std::io::Result<Vec<ModelEntry>> {
  let mut models = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    let name = entry.file_name().to_string_lossy().into_owned();
    if name.starts_with('.') {
      continue;
    }
    let format = if path.is_dir() {
      ModelFiles::discover(&path, None).ok().map(|f| f.format)
    } else {
      match ModelFormat::from_extension(&path) {
        Some(format) => Some(format),
        None => continue,
      }
    };
    models.push(ModelEntry {
      active: active == Some(path.as_path()),
      name,
      format,
    });
  }
  models.sort_by(|a, b| a.name.cmp(&b.name));
  Ok(models)
}

/// 列出模型目录下的模型
pub(super) async fn list_models(State(state): State<AppState>) -> Response {
  let dir = state.models_dir();
  let current = state.models.current();
  let active_path = current.as_ref().and_then(|m| m.source().map(Path::to_path_buf));

  let models = match dir.clone() {
    Some(dir) => {
      let scanned =
        tokio::task::spawn_blocking(move || scan_models(&dir, active_path.as_deref())).await;
      match scanned {
        Ok(Ok(models)) => models,
        Ok(Err(e)) => {
          warn!("无法读取模型目录: {}", e);
          return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
      }
    }
    None => Vec::new(),
  };

  Json(ModelsResponse {
    models_dir: dir,
    active: current.map(|m| m.name().to_string()),
    models,
  })
  .into_response()
}

#[derive(Debug, Deserialize)]
struct SwitchModelRequest {
  name: String,
}

/// 模型名只允许单级目录名
fn is_safe_model_name(name: &str) -> bool {
  !name.is_empty()
    && name != "."
    && !name.contains("..")
    && !name.contains('/')
    && !name.contains('\\')
    && !name.contains('\0')
}

/// 切换模型，失败时原模型继续服务
pub(super) async fn switch_model(State(state): State<AppState>, body: Bytes) -> Response {
  let request: SwitchModelRequest = match serde_json::from_slice(&body) {
    Ok(request) => request,
    Err(e) => return json_error(StatusCode::BAD_REQUEST, &format!("请求体无效: {e}")),
  };
  let name = request.name.trim().to_string();
  if !is_safe_model_name(&name) {
    return json_error(StatusCode::BAD_REQUEST, "模型名无效");
  }
  let Some(dir) = state.models_dir() else {
    return json_error(StatusCode::NOT_FOUND, "未配置模型目录");
  };
  let path = dir.join(&name);
  if !path.exists() {
    return json_error(StatusCode::NOT_FOUND, &format!("模型不存在: {name}"));
  }

  info!("请求切换模型: {}", path.display());
  let models = state.models.clone();
  let loaded = tokio::task::spawn_blocking(move || models.load(&path)).await;

  match loaded {
    Ok(Ok(model)) => Json(json!({
      "status": "ok",
      "model": model.name(),
      "format": model.config().format,
      "labels": model.labels().len(),
    }))
    .into_response(),
    Ok(Err(ModelLoadError::NotFound(path))) => json_error(
      StatusCode::NOT_FOUND,
      &format!("模型不存在: {}", path.display()),
    ),
    Ok(Err(e)) => {
      warn!("模型切换失败，保留当前模型: {}", e);
      (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
          "error": e.to_string(),
          "active": state.models.name(),
        })),
      )
        .into_response()
    }
    Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_path_like_names() {
    assert!(is_safe_model_name("yolov8n"));
    assert!(is_safe_model_name("pcb-v2.1"));
    assert!(!is_safe_model_name(""));
    assert!(!is_safe_model_name("../etc"));
    assert!(!is_safe_model_name("a/b"));
    assert!(!is_safe_model_name("a\\b"));
  }
}
