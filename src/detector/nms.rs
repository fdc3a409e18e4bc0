// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detector/nms.rs - 非极大值抑制
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

use std::collections::BTreeMap;

use super::Candidate;

/// 计算两个角点格式边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别执行 NMS
///
/// 每个类别内按置信度稳定降序排序（同分保留先出现的框），
/// 与已保留框 IoU 超过阈值的框被抑制，最后按类别编号拼接。
pub fn non_max_suppression(
  candidates: Vec<Candidate>,
  threshold: f32,
  max_detections: usize,
) -> Vec<Candidate> {
  let mut by_class: BTreeMap<usize, Vec<Candidate>> = BTreeMap::new();
  for candidate in candidates {
    by_class.entry(candidate.class_id).or_default().push(candidate);
  }

  let mut kept = Vec::new();
  for (_, mut group) in by_class {
    // sort_by 是稳定排序
    group.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut class_kept: Vec<Candidate> = Vec::with_capacity(group.len());
    for candidate in group {
      if class_kept
        .iter()
        .all(|k| iou(&k.bbox, &candidate.bbox) <= threshold)
      {
        class_kept.push(candidate);
      }
    }
    kept.extend(class_kept);
  }

  if kept.len() > max_detections {
    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept.truncate(max_detections);
  }
  kept
}
