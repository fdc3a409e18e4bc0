// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 采集、推理、标注、发布循环
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  error::{CaptureError, InferenceError},
  frame::Frame,
  input::{CaptureSettings, InputSource, open_source},
  model::{Detection, ModelSlot},
  output::{AnnotationOptions, Annotator, STREAM_JPEG_QUALITY, encode_jpeg},
  stats::DetectionStats,
};

mod fps;
mod persistence;
mod publish;
mod state;

pub use self::fps::FpsCounter;
pub use self::persistence::{MAX_PERSIST_AGE, PersistedDetectionSet};
pub use self::publish::{PublishState, Publisher};
pub use self::state::{CaptureState, StateCell};

/// 每次调用打开一个新的输入源，采集失败后用它重新打开
pub type SourceOpener = Box<dyn FnMut() -> Result<Box<dyn InputSource>, CaptureError> + Send>;

/// 按 URL 打开输入源的 opener
pub fn url_opener(url: Url, settings: CaptureSettings) -> SourceOpener {
  Box::new(move || open_source(&url, &settings))
}

/// 采集循环配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub annotation: AnnotationOptions,
  pub stream_quality: u8,
  /// 有限输入源结束后重复发布最后一帧的帧率
  pub idle_fps: f32,
  pub backoff_initial_ms: u64,
  pub backoff_max_ms: u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      annotation: AnnotationOptions::default(),
      stream_quality: STREAM_JPEG_QUALITY,
      idle_fps: 5.0,
      backoff_initial_ms: 250,
      backoff_max_ms: 5000,
    }
  }
}

/// 指数退避：从初始值开始每次翻倍，不超过上限
#[derive(Debug, Clone)]
struct Backoff {
  initial: Duration,
  max: Duration,
  current: Duration,
}

impl Backoff {
  fn new(initial: Duration, max: Duration) -> Self {
    Self {
      initial,
      max,
      current: initial,
    }
  }

  fn next_delay(&mut self) -> Duration {
    let delay = self.current;
    self.current = (self.current * 2).min(self.max);
    delay
  }

  fn reset(&mut self) {
    self.current = self.initial;
  }
}

/// 采集循环共享的组件
#[derive(Clone)]
pub struct Pipeline {
  models: Arc<ModelSlot>,
  publisher: Arc<Publisher>,
  stats: Arc<DetectionStats>,
  annotator: Arc<Annotator>,
  config: PipelineConfig,
}

impl Pipeline {
  pub fn new(
    models: Arc<ModelSlot>,
    publisher: Arc<Publisher>,
    stats: Arc<DetectionStats>,
    config: PipelineConfig,
  ) -> Self {
    let annotator = Arc::new(Annotator::new(config.annotation.clone()));
    Self {
      models,
      publisher,
      stats,
      annotator,
      config,
    }
  }

  pub fn publisher(&self) -> &Arc<Publisher> {
    &self.publisher
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// 在独立线程中启动采集循环
  pub fn spawn(&self, opener: SourceOpener) -> Result<CaptureHandle, CaptureError> {
    let state = Arc::new(StateCell::new());
    let stop = Arc::new(AtomicBool::new(false));
    state.transition(CaptureState::Starting);
    self.publisher.set_status(CaptureState::Starting, None);

    let worker = Worker {
      pipeline: self.clone(),
      state: state.clone(),
      stop: stop.clone(),
      persistence: PersistedDetectionSet::new(),
      fps: FpsCounter::new(),
      last_published: None,
    };

    let thread = thread::Builder::new()
      .name("shanan-capture".to_string())
      .spawn(move || worker.run(opener))
      .map_err(|e| CaptureError::Open("capture thread".to_string(), e.to_string()))?;

    info!("采集线程已启动");
    Ok(CaptureHandle {
      state,
      stop,
      thread: Some(thread),
      publisher: self.publisher.clone(),
    })
  }
}

/// 运行中的采集循环
pub struct CaptureHandle {
  state: Arc<StateCell>,
  stop: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
  publisher: Arc<Publisher>,
}

impl CaptureHandle {
  pub fn state(&self) -> CaptureState {
    self.state.get()
  }

  pub fn is_running(&self) -> bool {
    self.state.get().is_active()
  }

  /// 停止采集并等待线程退出
  pub fn stop(&mut self) {
    let Some(thread) = self.thread.take() else {
      return;
    };
    self.state.transition(CaptureState::Stopping);
    self.publisher.set_status(CaptureState::Stopping, None);
    self.stop.store(true, Ordering::Release);

    if thread.join().is_err() {
      error!("采集线程异常退出");
    }
    self.state.transition(CaptureState::Stopped);
    self.publisher.set_status(CaptureState::Stopped, None);
    info!("采集线程已停止");
  }
}

impl Drop for CaptureHandle {
  fn drop(&mut self) {
    self.stop();
  }
}

struct Worker {
  pipeline: Pipeline,
  state: Arc<StateCell>,
  stop: Arc<AtomicBool>,
  persistence: PersistedDetectionSet,
  fps: FpsCounter,
  /// 有限输入源结束后重复发布的帧
  last_published: Option<PublishState>,
}

impl Worker {
  fn stopped(&self) -> bool {
    self.stop.load(Ordering::Acquire)
  }

  /// 可被停止信号打断的睡眠
  fn sleep(&self, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !self.stopped() {
      let now = Instant::now();
      if now >= deadline {
        break;
      }
      thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
  }

  fn degrade(&self, err: &CaptureError) {
    self.state.transition(CaptureState::Degraded);
    self
      .pipeline
      .publisher
      .set_status(CaptureState::Degraded, Some(err.to_string()));
  }

  fn recover(&self) {
    self.state.transition(CaptureState::Running);
    self.pipeline.publisher.set_status(CaptureState::Running, None);
  }

  fn run(mut self, mut opener: SourceOpener) {
    let config = &self.pipeline.config;
    let mut backoff = Backoff::new(
      Duration::from_millis(config.backoff_initial_ms),
      Duration::from_millis(config.backoff_max_ms.max(config.backoff_initial_ms)),
    );
    let idle_interval = Duration::from_secs_f32(1.0 / config.idle_fps.max(0.1));

    let mut source: Option<Box<dyn InputSource>> = None;
    let mut ended = false;

    while !self.stopped() {
      if source.is_none() && !ended {
        match opener() {
          Ok(opened) => {
            info!("输入源已打开: {}", opened.describe());
            source = Some(opened);
            backoff.reset();
            self.recover();
          }
          Err(e) => {
            warn!("打开输入源失败: {}", e);
            self.degrade(&e);
            self.sleep(backoff.next_delay());
            continue;
          }
        }
      }

      let next = match source.as_mut() {
        Some(source) if !ended => source.next(),
        _ => None,
      };

      match next {
        Some(Ok(frame)) => self.process(frame.into_image()),
        Some(Err(e)) => {
          warn!("采集帧失败，准备重新打开输入源: {}", e);
          source = None;
          self.degrade(&e);
          self.sleep(backoff.next_delay());
        }
        None => {
          if !ended {
            info!("输入源已结束，按空闲帧率重复发布最后一帧");
            ended = true;
            source = None;
          }
          if self.last_published.is_some() {
            self.sleep(idle_interval);
            if !self.stopped() {
              self.republish();
            }
          } else {
            // 没有产生过任何帧的输入源视为不可用，重新打开
            ended = false;
            self.degrade(&CaptureError::EndOfStream);
            self.sleep(backoff.next_delay());
          }
        }
      }
    }
    debug!("采集循环退出");
  }

  /// 以新的序号重新发布最后一帧，不再推理也不计入统计
  fn republish(&mut self) {
    let Some(last) = self.last_published.as_ref() else {
      return;
    };
    let mut state = last.clone();
    state.sequence = self.pipeline.publisher.next_sequence();
    state.fps = self.fps.tick();
    state.state = self.state.get();
    state.timestamp_ms = crate::now_ms();
    debug!("重复发布最后一帧 #{}", state.sequence);
    self.pipeline.publisher.publish(state);
  }

  fn process(&mut self, image: RgbImage) {
    let pipeline = &self.pipeline;
    let sequence = pipeline.publisher.next_sequence();
    let frame = Frame::new(image, sequence, crate::now_ms());
    let timestamp_ms = frame.timestamp_ms();

    let (detections, inference_error) = match pipeline.models.predict(&frame) {
      Ok(detections) => (detections, None),
      Err(InferenceError::NoModel) => (Vec::new(), None),
      Err(e) => {
        warn!("推理失败，输出原始帧: {}", e);
        (Vec::new(), Some(e.to_string()))
      }
    };
    pipeline.stats.record_frame(timestamp_ms, &detections);
    let fps = self.fps.tick();

    let raw = frame.into_image();
    let raw_jpeg = match encode_jpeg(&raw, pipeline.config.stream_quality) {
      Ok(jpeg) => Bytes::from(jpeg),
      Err(e) => {
        error!("JPEG 编码失败: {}", e);
        return;
      }
    };
    let raw = Arc::new(raw);

    let (annotated_jpeg, annotated_image, drawn): (Bytes, Arc<RgbImage>, Vec<Detection>) =
      if inference_error.is_some() {
        (raw_jpeg.clone(), raw.clone(), Vec::new())
      } else {
        let drawn = self.persistence.update(&detections);
        let mut annotated = (*raw).clone();
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        pipeline
          .annotator
          .annotate(&mut annotated, &drawn, fps, &timestamp);
        match encode_jpeg(&annotated, pipeline.config.stream_quality) {
          Ok(jpeg) => (Bytes::from(jpeg), Arc::new(annotated), drawn),
          Err(e) => {
            error!("JPEG 编码失败: {}", e);
            return;
          }
        }
      };

    debug!(
      "发布帧 #{}: {} 个检测结果, {:.1} fps",
      sequence,
      drawn.len(),
      fps
    );

    let state = PublishState {
      annotated_jpeg,
      raw_jpeg,
      annotated_image: Some(annotated_image),
      raw_image: Some(raw),
      detections: drawn,
      sequence,
      fps,
      error: inference_error,
      state: self.state.get(),
      timestamp_ms,
    };
    pipeline.publisher.publish(state.clone());
    self.last_published = Some(state);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_doubles_up_to_cap() {
    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(5));
    let delays: Vec<u64> = (0..7)
      .map(|_| backoff.next_delay().as_millis() as u64)
      .collect();
    assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);
    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(250));
  }
}
