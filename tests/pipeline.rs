// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 采集循环测试
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

use std::{sync::Arc, time::Duration};

use shanan_edge::{
  error::CaptureError,
  input::{InputSource, PatternSource},
  model::ModelSlot,
  pipeline::{CaptureState, Pipeline, PipelineConfig, Publisher, SourceOpener},
  stats::DetectionStats,
};

use common::{defect_model, failing_model, wait_until};

struct Harness {
  models: Arc<ModelSlot>,
  publisher: Arc<Publisher>,
  stats: Arc<DetectionStats>,
  pipeline: Pipeline,
}

fn harness() -> Harness {
  let models = Arc::new(ModelSlot::new());
  let publisher = Arc::new(Publisher::new());
  let stats = Arc::new(DetectionStats::default());
  let config = PipelineConfig {
    backoff_initial_ms: 10,
    backoff_max_ms: 40,
    idle_fps: 50.0,
    ..PipelineConfig::default()
  };
  let pipeline = Pipeline::new(models.clone(), publisher.clone(), stats.clone(), config);
  Harness {
    models,
    publisher,
    stats,
    pipeline,
  }
}

/// `frames` 为 `None` 时不限帧数
fn pattern(frames: Option<u64>) -> SourceOpener {
  Box::new(move || {
    let mut source = PatternSource::new(64, 48, 30).unpaced();
    if let Some(frames) = frames {
      source = source.with_frames(frames);
    }
    let source: Box<dyn InputSource> = Box::new(source);
    Ok(source)
  })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequences_strictly_increase() {
  let h = harness();
  let mut rx = h.publisher.subscribe();
  let mut handle = h.pipeline.spawn(pattern(None)).unwrap();

  let mut seen = Vec::new();
  while seen.len() < 30 {
    tokio::time::timeout(Duration::from_secs(5), rx.changed())
      .await
      .expect("frame published in time")
      .expect("publisher alive");
    let sequence = rx.borrow_and_update().sequence;
    seen.push(sequence);
  }
  handle.stop();

  assert!(seen[0] > 0);
  assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
}

#[test]
fn published_frames_carry_detections_and_jpeg() {
  let h = harness();
  h.models.install(defect_model("pcb"));
  let mut handle = h.pipeline.spawn(pattern(None)).unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    let current = h.publisher.current();
    current.has_frame() && !current.detections.is_empty()
  }));
  let current = h.publisher.current();
  assert!(current.annotated_jpeg.starts_with(&[0xFF, 0xD8]));
  assert!(current.raw_jpeg.starts_with(&[0xFF, 0xD8]));
  assert_ne!(current.annotated_jpeg, current.raw_jpeg);
  assert_eq!(current.detections[0].label, "defect");
  assert_eq!(current.state, CaptureState::Running);
  assert!(h.stats.counters().by_label["defect"] > 0);

  handle.stop();
  assert_eq!(handle.state(), CaptureState::Stopped);
  assert_eq!(h.publisher.current().state, CaptureState::Stopped);
}

#[test]
fn frames_without_model_pass_through() {
  let h = harness();
  let mut handle = h.pipeline.spawn(pattern(None)).unwrap();
  assert!(wait_until(Duration::from_secs(5), || h.publisher.current().has_frame()));
  let current = h.publisher.current();
  assert!(current.detections.is_empty());
  assert!(current.error.is_none());
  handle.stop();
}

#[test]
fn failing_source_degrades_and_retries() {
  let h = harness();
  let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
  let counter = attempts.clone();
  let opener: SourceOpener = Box::new(move || {
    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    Err(CaptureError::Open("/dev/video9".into(), "No such device".into()))
  });
  let mut handle = h.pipeline.spawn(opener).unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    handle.state() == CaptureState::Degraded
      && attempts.load(std::sync::atomic::Ordering::SeqCst) >= 3
  }));
  let current = h.publisher.current();
  assert_eq!(current.state, CaptureState::Degraded);
  assert!(current.error.as_deref().is_some_and(|e| e.contains("/dev/video9")));
  assert!(!current.has_frame());

  handle.stop();
  assert_eq!(handle.state(), CaptureState::Stopped);
}

#[test]
fn finite_source_keeps_last_frame_alive() {
  let h = harness();
  let mut handle = h.pipeline.spawn(pattern(Some(3))).unwrap();
  assert!(wait_until(Duration::from_secs(5), || {
    h.publisher.current().sequence > 6
  }));
  assert!(handle.is_running());
  handle.stop();
}

#[test]
fn idle_republish_does_not_count_frames() {
  let h = harness();
  h.models.install(defect_model("pcb"));
  let mut handle = h.pipeline.spawn(pattern(Some(3))).unwrap();
  assert!(wait_until(Duration::from_secs(5), || {
    h.publisher.current().sequence > 15
  }));
  let current = h.publisher.current();
  assert!(current.has_frame());
  assert_eq!(current.detections[0].label, "defect");
  handle.stop();

  let counters = h.stats.counters();
  assert_eq!(counters.total_frames, 3);
  assert_eq!(counters.total_detections, 3);
  assert_eq!(counters.by_label["defect"], 3);
}

#[test]
fn inference_failure_serves_raw_frame() {
  let h = harness();
  h.models.install(failing_model("broken"));
  let mut handle = h.pipeline.spawn(pattern(None)).unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    let current = h.publisher.current();
    current.has_frame() && current.error.is_some()
  }));
  let first = h.publisher.current();
  assert_eq!(first.annotated_jpeg, first.raw_jpeg);
  assert!(first.detections.is_empty());
  assert!(first.error.as_deref().is_some_and(|e| e.contains("NPU")));
  assert_eq!(first.state, CaptureState::Running);

  assert!(wait_until(Duration::from_secs(5), || {
    h.publisher.current().sequence > first.sequence + 3
  }));
  let later = h.publisher.current();
  assert_eq!(later.annotated_jpeg, later.raw_jpeg);
  assert!(later.error.is_some());
  assert!(handle.is_running());
  handle.stop();
}

#[test]
fn model_swap_applies_to_next_frames() {
  let h = harness();
  let mut handle = h.pipeline.spawn(pattern(None)).unwrap();
  assert!(wait_until(Duration::from_secs(5), || h.publisher.current().has_frame()));
  assert!(h.publisher.current().detections.is_empty());

  h.models.install(defect_model("pcb"));
  assert!(wait_until(Duration::from_secs(5), || {
    !h.publisher.current().detections.is_empty()
  }));
  handle.stop();
}
