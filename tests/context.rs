// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/context.rs - 推理上下文测试
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

use std::time::Duration;

use image::RgbImage;
use shanan_edge::{
  InferenceContext, Status,
  context::ContextState,
  frame::Frame,
  pipeline::CaptureState,
};

use common::{defect_model, failing_model, wait_until};

const PATTERN: &str = "pattern://?width=64&height=48&fps=60";

#[test]
fn predict_before_load_reports_no_model() {
  let mut ctx = InferenceContext::create();
  let status = ctx.predict_image(&[0u8; 2 * 2 * 3], 2, 2, 3);
  assert_eq!(status, Status::ErrorModel);
  assert_eq!(status.code(), -3);
  assert!(ctx.error().is_some());
  assert_eq!(ctx.result_count(), 0);
  let json: serde_json::Value = serde_json::from_str(&ctx.result_json()).unwrap();
  assert_eq!(json, serde_json::json!({ "detections": [], "count": 0 }));
}

#[test]
fn failed_load_keeps_context_usable() {
  let mut ctx = InferenceContext::create();
  assert_eq!(ctx.state(), ContextState::Ready);
  let status = ctx.load("/definitely/not/a/model");
  assert_eq!(status, Status::ErrorModel);
  assert_eq!(ctx.state(), ContextState::Error);
  assert_eq!(ctx.state().code(), 2);
  assert!(ctx.error().is_some_and(|e| !e.is_empty()));
  assert_eq!(ctx.model_name(), None);

  assert_eq!(ctx.install(defect_model("pcb")), Status::Ok);
  assert_eq!(ctx.error(), None);
  assert_eq!(ctx.state(), ContextState::Ready);
  assert_eq!(ctx.predict_image(&[128u8; 32 * 32 * 3], 32, 32, 3), Status::Ok);
  assert_eq!(ctx.result_count(), 1);
}

fn gray_frame(sequence: u64) -> Frame {
  Frame::new(RgbImage::from_pixel(32, 24, image::Rgb([90, 90, 90])), sequence, 0)
}

#[test]
fn batch_predicts_every_frame() {
  let mut ctx = InferenceContext::create();
  ctx.install(defect_model("pcb"));
  let frames: Vec<Frame> = (1..=3).map(gray_frame).collect();

  assert_eq!(ctx.predict_batch(&frames), Status::Ok);
  assert_eq!(ctx.batch_results().len(), 3);
  assert!(ctx.batch_results().iter().all(|d| d.len() == 1));
  assert_eq!(ctx.result_count(), 1);
  assert_eq!(ctx.result_label(0), Some("defect"));
  assert_eq!(ctx.state(), ContextState::Ready);
}

#[test]
fn batch_stops_at_first_failure() {
  let mut ctx = InferenceContext::create();
  let frames: Vec<Frame> = (1..=3).map(gray_frame).collect();
  assert_eq!(ctx.predict_batch(&frames), Status::ErrorModel);
  assert!(ctx.batch_results().is_empty());
  assert_eq!(ctx.result_count(), 0);
  assert_eq!(ctx.state(), ContextState::Error);

  ctx.install(failing_model("npu"));
  assert_eq!(ctx.predict_batch(&frames), Status::Error);
  assert!(ctx.batch_results().is_empty());
  assert!(ctx.error().is_some_and(|e| e.contains("NPU")));

  assert_eq!(ctx.predict_batch(&[]), Status::ErrorInput);
}

#[test]
fn exposes_results_by_index() {
  let mut ctx = InferenceContext::create();
  ctx.install(defect_model("pcb"));
  assert_eq!(ctx.predict_image(&[0u8; 16 * 8 * 4], 16, 8, 4), Status::Ok);

  assert_eq!(ctx.result_count(), 1);
  assert_eq!(ctx.result_label(0), Some("defect"));
  assert!(ctx.result_score(0) > 0.5);
  let (x, y, w, h) = ctx.result_bbox(0).expect("bbox");
  assert!((x - 0.375).abs() < 1e-4);
  assert!((y - 0.4375).abs() < 1e-4);
  assert!((w - 0.25).abs() < 1e-4);
  assert!((h - 0.125).abs() < 1e-4);

  assert_eq!(ctx.result_label(1), None);
  assert_eq!(ctx.result_bbox(1), None);
  assert_eq!(ctx.result_score(1), 0.0);

  let json: serde_json::Value = serde_json::from_str(&ctx.result_json()).unwrap();
  assert_eq!(json["count"], 1);
  let detection = &json["detections"][0];
  assert_eq!(detection["label"], "defect");
  assert_eq!(detection["bbox"].as_array().map(Vec::len), Some(4));
  assert!(detection.get("class_id").is_none());
}

#[test]
fn rejects_malformed_input() {
  let mut ctx = InferenceContext::create();
  ctx.install(defect_model("pcb"));
  assert_eq!(ctx.predict_image(&[0u8; 8], 2, 2, 2), Status::ErrorInput);
  assert_eq!(ctx.predict_image(&[0u8; 11], 2, 2, 3), Status::ErrorInput);
  assert_eq!(ctx.result_count(), 0);
  assert!(ctx.error().is_some());
}

#[test]
fn gray_input_is_accepted() {
  let mut ctx = InferenceContext::create();
  ctx.install(defect_model("pcb"));
  assert_eq!(ctx.predict_image(&[10u8; 4 * 4], 4, 4, 1), Status::Ok);
}

#[test]
fn unload_returns_to_no_model() {
  let mut ctx = InferenceContext::create();
  ctx.install(defect_model("pcb"));
  assert_eq!(ctx.model_name().as_deref(), Some("pcb"));
  ctx.unload();
  assert_eq!(ctx.predict_image(&[0u8; 12], 2, 2, 3), Status::ErrorModel);
}

#[test]
fn camera_start_is_exclusive() {
  let mut ctx = InferenceContext::create();
  assert_eq!(ctx.start_source(PATTERN), Status::Ok);
  assert!(ctx.capture_state().is_active());

  assert_eq!(ctx.start_source(PATTERN), Status::Error);
  assert!(ctx.error().is_some());

  let rx = ctx.publish_receiver();
  assert!(wait_until(Duration::from_secs(5), || rx.borrow().sequence > 0));
  assert!(wait_until(Duration::from_secs(5), || ctx.get_fps() > 0.0));

  ctx.stop_camera();
  assert_eq!(ctx.capture_state(), CaptureState::Stopped);
  assert_eq!(ctx.get_fps(), 0.0);
  assert_eq!(ctx.start_source(PATTERN), Status::Ok);
  ctx.destroy();
}

#[test]
fn unsupported_source_is_rejected() {
  let mut ctx = InferenceContext::create();
  assert_eq!(ctx.start_source("rtmp://example/live"), Status::ErrorInput);
  assert_eq!(ctx.start_source("not a url"), Status::ErrorInput);
  assert_eq!(ctx.capture_state(), CaptureState::Stopped);
}

#[test]
fn missing_camera_degrades_instead_of_failing() {
  let mut ctx = InferenceContext::create();
  assert_eq!(ctx.start_camera(250), Status::Ok);
  let rx = ctx.publish_receiver();
  assert!(wait_until(Duration::from_secs(5), || {
    ctx.capture_state() == CaptureState::Degraded && rx.borrow().error.is_some()
  }));
  ctx.stop_camera();
}

#[test]
fn server_start_is_exclusive() {
  let mut ctx = InferenceContext::create();
  assert_eq!(ctx.start_server_on("127.0.0.1:0"), Status::Ok);
  let addr = ctx.server_addr().expect("bound");
  assert_ne!(addr.port(), 0);
  assert_eq!(ctx.start_server_on("127.0.0.1:0"), Status::Error);

  ctx.stop_server();
  assert!(ctx.server_addr().is_none());
  assert_eq!(ctx.start_server_on("127.0.0.1:0"), Status::Ok);
}

#[test]
fn version_matches_package() {
  assert_eq!(InferenceContext::version(), env!("CARGO_PKG_VERSION"));
}
