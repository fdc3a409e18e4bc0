// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/persistence.rs - 检测结果持久化（减少画面闪烁）
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

use crate::{detector::iou, model::Detection};

/// 未被强化的检测结果最多保留的帧数
pub const MAX_PERSIST_AGE: u32 = 3;

/// 新检测与旧检测视为同一目标的 IoU 阈值
const REINFORCE_IOU: f32 = 0.5;

#[derive(Debug, Clone)]
struct Entry {
  detection: Detection,
  age: u32,
}

/// 实际绘制的检测集合
///
/// 每帧：未被强化的旧条目年龄加一，年龄超过 3 的被淘汰，然后加入新检测。
/// 新检测与同类别、IoU 足够大的旧条目视为同一目标，替换旧条目。
#[derive(Debug, Clone, Default)]
pub struct PersistedDetectionSet {
  entries: Vec<Entry>,
}

fn corners(bbox: &[f32; 4]) -> [f32; 4] {
  [bbox[0], bbox[1], bbox[0] + bbox[2], bbox[1] + bbox[3]]
}

impl PersistedDetectionSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// 合并本帧检测结果，返回合并后的集合
  pub fn update(&mut self, detections: &[Detection]) -> Vec<Detection> {
    let mut aged: Vec<Entry> = self
      .entries
      .drain(..)
      .filter(|old| {
        !detections.iter().any(|new| {
          new.class_id == old.detection.class_id
            && iou(&corners(&new.bbox), &corners(&old.detection.bbox)) >= REINFORCE_IOU
        })
      })
      .map(|mut old| {
        old.age += 1;
        old
      })
      .filter(|old| old.age <= MAX_PERSIST_AGE)
      .collect();

    let mut entries: Vec<Entry> = detections
      .iter()
      .cloned()
      .map(|detection| Entry { detection, age: 0 })
      .collect();
    entries.append(&mut aged);
    self.entries = entries;

    self.detections()
  }

  pub fn detections(&self) -> Vec<Detection> {
    self.entries.iter().map(|e| e.detection.clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }
}
