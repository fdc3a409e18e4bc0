// 该文件是 Shanan （山南西风） 项目的一部分。
// src/stats.rs - 检测计数与系统指标
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
  collections::{BTreeMap, VecDeque},
  sync::{Mutex, PoisonError},
  time::{Duration, Instant},
};

use serde::Serialize;
use sysinfo::{Components, System};
use thiserror::Error;

use crate::model::Detection;

/// 默认保留的检测记录条数
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// 帧计数按分钟分桶
const FRAME_BUCKET_MS: i64 = 60_000;
/// 帧计数分桶最多保留 7 天
const MAX_FRAME_BUCKETS: usize = 7 * 24 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("无效的时间段: {0}")]
pub struct PeriodError(pub String);

/// 解析时间段：`30s`、`15m`、`1h`、`7d` 或不带单位的秒数
pub fn parse_period(text: &str) -> Result<Duration, PeriodError> {
  let text = text.trim();
  let err = || PeriodError(text.to_string());
  let (digits, unit) = match text.char_indices().last() {
    Some((idx, c)) if c.is_ascii_alphabetic() => (&text[..idx], c.to_ascii_lowercase()),
    Some(_) => (text, 's'),
    None => return Err(err()),
  };
  let value: u64 = digits.parse().map_err(|_| err())?;
  if value == 0 {
    return Err(err());
  }
  let seconds = match unit {
    's' => value,
    'm' => value.checked_mul(60).ok_or_else(err)?,
    'h' => value.checked_mul(3600).ok_or_else(err)?,
    'd' => value.checked_mul(86_400).ok_or_else(err)?,
    _ => return Err(err()),
  };
  Ok(Duration::from_secs(seconds))
}

#[derive(Debug, Clone)]
struct Record {
  timestamp_ms: i64,
  detections: Vec<Detection>,
}

#[derive(Debug, Default)]
struct Inner {
  total_detections: u64,
  total_frames: u64,
  by_label: BTreeMap<String, u64>,
  history: VecDeque<Record>,
  frame_buckets: VecDeque<(i64, u64)>,
}

/// 计数快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Counters {
  pub total_detections: u64,
  pub total_frames: u64,
  pub by_label: BTreeMap<String, u64>,
}

/// 检测统计，采集线程写入，服务端读取
#[derive(Debug)]
pub struct DetectionStats {
  inner: Mutex<Inner>,
  capacity: usize,
  started: Instant,
}

impl Default for DetectionStats {
  fn default() -> Self {
    Self::new(DEFAULT_HISTORY_CAPACITY)
  }
}

impl DetectionStats {
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      capacity: capacity.max(1),
      started: Instant::now(),
    }
  }

  pub fn uptime(&self) -> Duration {
    self.started.elapsed()
  }

  /// 记录一帧的模型检测结果（不含持久化补出的框）
  pub fn record_frame(&self, timestamp_ms: i64, detections: &[Detection]) {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.total_frames += 1;
    inner.total_detections += detections.len() as u64;
    for detection in detections {
      *inner.by_label.entry(detection.label.clone()).or_default() += 1;
    }

    let bucket = timestamp_ms.div_euclid(FRAME_BUCKET_MS);
    match inner.frame_buckets.back_mut() {
      Some((last, count)) if *last == bucket => *count += 1,
      _ => {
        inner.frame_buckets.push_back((bucket, 1));
        if inner.frame_buckets.len() > MAX_FRAME_BUCKETS {
          inner.frame_buckets.pop_front();
        }
      }
    }

    if !detections.is_empty() {
      inner.history.push_back(Record {
        timestamp_ms,
        detections: detections.to_vec(),
      });
      while inner.history.len() > self.capacity {
        inner.history.pop_front();
      }
    }
  }

  pub fn counters(&self) -> Counters {
    let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    Counters {
      total_detections: inner.total_detections,
      total_frames: inner.total_frames,
      by_label: inner.by_label.clone(),
    }
  }

  /// 统计 `[now - period, now]` 内的计数
  pub fn counters_within(&self, period: Duration, now_ms: i64) -> Counters {
    let since = now_ms - period.as_millis() as i64;
    let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

    let mut counters = Counters::default();
    for record in inner.history.iter().filter(|r| r.timestamp_ms >= since) {
      counters.total_detections += record.detections.len() as u64;
      for detection in &record.detections {
        *counters.by_label.entry(detection.label.clone()).or_default() += 1;
      }
    }
    let first_bucket = since.div_euclid(FRAME_BUCKET_MS);
    counters.total_frames = inner
      .frame_buckets
      .iter()
      .filter(|(bucket, _)| *bucket >= first_bucket)
      .map(|(_, count)| count)
      .sum();
    counters
  }

  /// 时间段内记录的检测结果，按时间先后排列
  pub fn detections_within(&self, period: Duration, now_ms: i64) -> Vec<Detection> {
    let since = now_ms - period.as_millis() as i64;
    let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner
      .history
      .iter()
      .filter(|r| r.timestamp_ms >= since)
      .flat_map(|r| r.detections.iter().cloned())
      .collect()
  }

  /// 每小时检测数（按运行时长折算）
  pub fn detections_per_hour(&self) -> f64 {
    let uptime = self.uptime().as_secs_f64();
    if uptime <= 0.0 {
      return 0.0;
    }
    self.counters().total_detections as f64 * 3600.0 / uptime
  }
}

/// 系统指标
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
  pub cpu_usage: f32,
  pub memory_usage: f32,
  pub temperature: f32,
}

/// 系统指标采样器，保留 `System` 以便计算两次刷新间的 CPU 使用率
pub struct SystemSampler {
  system: Mutex<System>,
}

impl Default for SystemSampler {
  fn default() -> Self {
    Self::new()
  }
}

impl SystemSampler {
  pub fn new() -> Self {
    let mut system = System::new();
    system.refresh_cpu_usage();
    system.refresh_memory();
    Self {
      system: Mutex::new(system),
    }
  }

  pub fn sample(&self) -> SystemMetrics {
    let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu_usage = system.global_cpu_usage();
    let total = system.total_memory();
    let memory_usage = if total > 0 {
      (1.0 - system.available_memory() as f64 / total as f64) as f32 * 100.0
    } else {
      0.0
    };

    let components = Components::new_with_refreshed_list();
    let temperature = components
      .iter()
      .filter_map(|c| c.temperature())
      .find(|t| t.is_finite() && *t > 0.0)
      .unwrap_or(0.0);

    SystemMetrics {
      cpu_usage,
      memory_usage,
      temperature,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn det(label: &str) -> Detection {
    Detection {
      class_id: 0,
      label: label.to_string(),
      confidence: 0.8,
      bbox: [0.0, 0.0, 0.1, 0.1],
    }
  }

  #[test]
  fn parses_periods() {
    assert_eq!(parse_period("30s"), Ok(Duration::from_secs(30)));
    assert_eq!(parse_period("15m"), Ok(Duration::from_secs(900)));
    assert_eq!(parse_period("1H"), Ok(Duration::from_secs(3600)));
    assert_eq!(parse_period("7d"), Ok(Duration::from_secs(604_800)));
    assert_eq!(parse_period("3600"), Ok(Duration::from_secs(3600)));
    assert!(parse_period("").is_err());
    assert!(parse_period("0s").is_err());
    assert!(parse_period("5w").is_err());
    assert!(parse_period("abc").is_err());
  }

  #[test]
  fn counts_frames_and_labels() {
    let stats = DetectionStats::new(16);
    stats.record_frame(1_000, &[det("scratch"), det("dent")]);
    stats.record_frame(2_000, &[]);
    stats.record_frame(3_000, &[det("scratch")]);

    let counters = stats.counters();
    assert_eq!(counters.total_frames, 3);
    assert_eq!(counters.total_detections, 3);
    assert_eq!(counters.by_label["scratch"], 2);
    assert_eq!(counters.by_label["dent"], 1);
  }

  #[test]
  fn window_filters_old_records() {
    let stats = DetectionStats::new(16);
    let now = 10 * 60_000;
    stats.record_frame(now - 5 * 60_000, &[det("old")]);
    stats.record_frame(now - 10_000, &[det("new")]);

    let recent = stats.detections_within(Duration::from_secs(60), now);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].label, "new");

    let counters = stats.counters_within(Duration::from_secs(60), now);
    assert_eq!(counters.total_detections, 1);
    assert!(!counters.by_label.contains_key("old"));
  }

  #[test]
  fn history_is_bounded() {
    let stats = DetectionStats::new(2);
    for i in 0..5 {
      stats.record_frame(i, &[det("x")]);
    }
    assert_eq!(stats.detections_within(Duration::from_secs(3600), 10).len(), 2);
    assert_eq!(stats.counters().total_detections, 5);
  }
}
