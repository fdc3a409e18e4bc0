// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/server.rs - HTTP 接口测试
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

mod common;

use std::{path::PathBuf, sync::Arc};

use axum::{
  Router,
  body::Body,
  http::{Method, Request, StatusCode, header},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use image::RgbImage;
use tower::ServiceExt;

use shanan_edge::{
  model::{Detection, ModelSlot},
  output::encode_jpeg,
  pipeline::{CaptureState, PublishState, Publisher},
  server::{AppState, FRAME_SEQUENCE_HEADER, router},
  stats::DetectionStats,
};

use common::defect_model;

struct Fixture {
  publisher: Arc<Publisher>,
  models: Arc<ModelSlot>,
  stats: Arc<DetectionStats>,
  app: Router,
}

fn fixture(models_dir: Option<PathBuf>) -> Fixture {
  let publisher = Arc::new(Publisher::new());
  let models = Arc::new(ModelSlot::new());
  let stats = Arc::new(DetectionStats::default());
  let state = AppState::new(publisher.clone(), models.clone(), stats.clone(), models_dir);
  Fixture {
    publisher,
    models,
    stats,
    app: router(state),
  }
}

fn detection() -> Detection {
  Detection {
    class_id: 1,
    label: "defect".to_string(),
    confidence: 0.87,
    bbox: [0.1, 0.2, 0.3, 0.4],
  }
}

/// 发布一帧并返回其序号
fn publish(fixture: &Fixture, detections: Vec<Detection>) -> u64 {
  let image = Arc::new(RgbImage::from_pixel(32, 24, image::Rgb([200, 40, 40])));
  let jpeg = Bytes::from(encode_jpeg(&image, 80).unwrap());
  let sequence = fixture.publisher.next_sequence();
  fixture.stats.record_frame(chrono::Utc::now().timestamp_millis(), &detections);
  fixture.publisher.publish(PublishState {
    annotated_jpeg: jpeg.clone(),
    raw_jpeg: jpeg,
    annotated_image: Some(image.clone()),
    raw_image: Some(image),
    detections,
    sequence,
    fps: 12.5,
    error: None,
    state: CaptureState::Running,
    timestamp_ms: chrono::Utc::now().timestamp_millis(),
  });
  sequence
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
  app
    .clone()
    .oneshot(Request::get(uri).body(Body::empty()).unwrap())
    .await
    .unwrap()
}

async fn post_json(app: &Router, uri: &str, body: &str) -> axum::response::Response {
  app
    .clone()
    .oneshot(
      Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap(),
    )
    .await
    .unwrap()
}

async fn json(response: axum::response::Response) -> serde_json::Value {
  let bytes = response.into_body().collect().await.unwrap().to_bytes();
  serde_json::from_slice(&bytes).unwrap()
}

async fn body(response: axum::response::Response) -> Bytes {
  response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn health_answers_without_camera() {
  let f = fixture(None);
  let response = get(&f.app, "/health").await;
  assert_eq!(response.status(), StatusCode::OK);
  let health = json(response).await;
  assert_eq!(health["status"], "ok");
  assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
  assert_eq!(health["model_loaded"], false);
  assert_eq!(health["camera_running"], false);
  assert_eq!(health["camera_state"], "STOPPED");
  assert!(health["timestamp"].as_str().is_some_and(|t| t.contains('T')));
}

#[tokio::test]
async fn health_reports_degraded_capture() {
  let f = fixture(None);
  f.publisher
    .set_status(CaptureState::Degraded, Some("camera lost".into()));
  f.models.install(defect_model("pcb"));
  let health = json(get(&f.app, "/health").await).await;
  assert_eq!(health["status"], "degraded");
  assert_eq!(health["camera_state"], "DEGRADED");
  assert_eq!(health["model_loaded"], true);
  assert_eq!(health["model_name"], "pcb");
}

#[tokio::test]
async fn latest_frame_carries_sequence() {
  let f = fixture(None);
  let response = get(&f.app, "/frame/latest").await;
  assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
  assert_eq!(json(response).await["error"], "No frame available");

  let sequence = publish(&f, vec![]);
  let response = get(&f.app, "/frame/latest").await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
  assert_eq!(
    response.headers()[FRAME_SEQUENCE_HEADER],
    sequence.to_string().as_str()
  );
  assert!(
    response.headers()[header::CACHE_CONTROL]
      .to_str()
      .unwrap()
      .contains("no-store")
  );
  assert!(body(response).await.starts_with(&[0xFF, 0xD8]));
}

#[tokio::test]
async fn stream_starts_with_current_frame() {
  let f = fixture(None);
  publish(&f, vec![]);
  let response = get(&f.app, "/stream/annotated").await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers()[header::CONTENT_TYPE],
    "multipart/x-mixed-replace; boundary=frame"
  );

  let mut stream_body = response.into_body();
  let first = stream_body
    .frame()
    .await
    .expect("first part")
    .unwrap()
    .into_data()
    .unwrap();
  assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: "));

  let raw = get(&f.app, "/stream/raw").await;
  assert_eq!(raw.status(), StatusCode::OK);
}

#[tokio::test]
async fn bare_stream_path_serves_annotated_stream() {
  let f = fixture(None);
  publish(&f, vec![]);
  let response = get(&f.app, "/stream").await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers()[header::CONTENT_TYPE],
    "multipart/x-mixed-replace; boundary=frame"
  );
  let first = response
    .into_body()
    .frame()
    .await
    .expect("first part")
    .unwrap()
    .into_data()
    .unwrap();
  assert!(first.starts_with(b"--frame\r\n"));
}

#[tokio::test]
async fn snapshot_is_downloadable() {
  let f = fixture(None);
  assert_eq!(
    get(&f.app, "/snapshot").await.status(),
    StatusCode::SERVICE_UNAVAILABLE
  );

  let sequence = publish(&f, vec![detection()]);
  let response = get(&f.app, "/snapshot").await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers()[header::CONTENT_DISPOSITION],
    format!("attachment; filename=\"snapshot_{sequence}.jpg\"").as_str()
  );
  assert!(body(response).await.starts_with(&[0xFF, 0xD8]));

  let raw = get(&f.app, "/snapshot?annotated=false").await;
  assert_eq!(raw.status(), StatusCode::OK);
}

#[tokio::test]
async fn results_and_stats_follow_published_frames() {
  let f = fixture(None);
  publish(&f, vec![detection()]);
  let sequence = publish(&f, vec![detection(), detection()]);

  let results = json(get(&f.app, "/api/results").await).await;
  assert_eq!(results["count"], 2);
  assert_eq!(results["sequence"], sequence);
  assert_eq!(results["detections"][0]["label"], "defect");
  assert_eq!(results["detections"][0]["bbox"].as_array().map(Vec::len), Some(4));

  let recent = json(get(&f.app, "/api/results?period=1h").await).await;
  assert_eq!(recent["count"], 3);
  assert_eq!(recent["period"], "1h");

  let stats = json(get(&f.app, "/api/stats").await).await;
  assert_eq!(stats["total_detections"], 3);
  assert_eq!(stats["total_frames"], 2);
  assert_eq!(stats["by_label"]["defect"], 3);

  let windowed = json(get(&f.app, "/api/stats?period=15m").await).await;
  assert_eq!(windowed["total_detections"], 3);
  assert_eq!(windowed["period"], "15m");

  let bad = get(&f.app, "/api/stats?period=soon").await;
  assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
  let bad = get(&f.app, "/api/results?period=0s").await;
  assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
}

fn models_dir() -> tempfile::TempDir {
  let dir = tempfile::tempdir().unwrap();
  let alpha = dir.path().join("alpha");
  std::fs::create_dir(&alpha).unwrap();
  std::fs::write(alpha.join("model.onnx"), b"not really onnx").unwrap();
  std::fs::write(alpha.join("labels.txt"), "ok\ndefect\n").unwrap();
  // 缺少权重文件的模型目录
  let broken = dir.path().join("broken");
  std::fs::create_dir(&broken).unwrap();
  std::fs::write(broken.join("labels.txt"), "ok\ndefect\n").unwrap();
  std::fs::write(dir.path().join("gamma.onnx"), b"x").unwrap();
  std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
  std::fs::create_dir(dir.path().join(".cache")).unwrap();
  dir
}

#[tokio::test]
async fn lists_models_in_directory() {
  let dir = models_dir();
  let f = fixture(Some(dir.path().to_path_buf()));
  let listing = json(get(&f.app, "/api/models").await).await;

  let names: Vec<&str> = listing["models"]
    .as_array()
    .unwrap()
    .iter()
    .filter_map(|m| m["name"].as_str())
    .collect();
  assert_eq!(names, vec!["alpha", "broken", "gamma.onnx"]);
  assert_eq!(listing["models"][0]["format"], "onnx");
  assert!(listing["models"][1]["format"].is_null());
  assert_eq!(listing["active"], serde_json::Value::Null);
}

#[tokio::test]
async fn failed_model_switch_keeps_prior_model_serving() {
  let dir = models_dir();
  let f = fixture(Some(dir.path().to_path_buf()));
  f.models.install(defect_model("pcb"));
  publish(&f, vec![detection()]);
  let before = body(get(&f.app, "/frame/latest").await).await;

  let response = post_json(&f.app, "/api/model", r#"{"name":"broken"}"#).await;
  assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
  let failure = json(response).await;
  assert_eq!(failure["active"], "pcb");
  assert!(failure["error"].as_str().is_some_and(|e| !e.is_empty()));

  assert_eq!(f.models.name().as_deref(), Some("pcb"));
  let response = get(&f.app, "/frame/latest").await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(body(response).await, before);
}

#[tokio::test]
async fn model_switch_validates_requests() {
  let dir = models_dir();
  let f = fixture(Some(dir.path().to_path_buf()));

  let missing = post_json(&f.app, "/api/model", r#"{"name":"nope"}"#).await;
  assert_eq!(missing.status(), StatusCode::NOT_FOUND);
  let escape = post_json(&f.app, "/api/model", r#"{"name":"../alpha"}"#).await;
  assert_eq!(escape.status(), StatusCode::BAD_REQUEST);
  let malformed = post_json(&f.app, "/api/model", "{name}").await;
  assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

  let unconfigured = fixture(None);
  let response = post_json(&unconfigured.app, "/api/model", r#"{"name":"alpha"}"#).await;
  assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_exposes_frame_sequence() {
  let f = fixture(None);
  publish(&f, vec![]);
  let response = f
    .app
    .clone()
    .oneshot(
      Request::get("/frame/latest")
        .header(header::ORIGIN, "http://dashboard.local")
        .body(Body::empty())
        .unwrap(),
    )
    .await
    .unwrap();
  assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
  let exposed = response.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS]
    .to_str()
    .unwrap()
    .to_ascii_lowercase();
  assert!(exposed.contains(FRAME_SEQUENCE_HEADER));

  let preflight = f
    .app
    .clone()
    .oneshot(
      Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/model")
        .header(header::ORIGIN, "http://dashboard.local")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap(),
    )
    .await
    .unwrap();
  assert!(preflight.status().is_success());
}
