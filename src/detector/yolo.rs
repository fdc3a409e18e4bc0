// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detector/yolo.rs - YOLO 输出解码
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

use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{Tensor, non_max_suppression};

/// YOLOv4 标准 anchor（输入像素单位），按步长 8 / 16 / 32 分组
const YOLOV4_ANCHORS: [[(f32, f32); 3]; 3] = [
  [(12.0, 16.0), (19.0, 36.0), (40.0, 28.0)],
  [(36.0, 75.0), (76.0, 55.0), (72.0, 146.0)],
  [(142.0, 110.0), (192.0, 243.0), (459.0, 401.0)],
];
const ANCHORS_PER_SCALE: usize = 3;

/// YOLOv5/v7 常见的拼接输出框数量（640 / 480 / 320 输入）
const V5_BOX_COUNTS: [usize; 3] = [25200, 18900, 6300];
/// YOLOv3/v4 单尺度输出框数量（13² / 26² / 52² × 3）
const V4_BOX_COUNTS: [usize; 3] = [507, 2028, 8112];

/// YOLO 解码变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum YoloVersion {
  /// 根据输出形状自动判断
  #[default]
  Auto,
  /// YOLOv3/v4：基于 anchor，多尺度
  V4,
  /// YOLOv5/v7：拼接的预解码输出
  V5,
  /// YOLOv8/v9/v11：转置输出，无目标置信度
  V8,
  /// YOLOv10：端到端输出，无需 NMS
  V10,
}

impl YoloVersion {
  /// 解析版本字符串（不区分大小写，按子串匹配）
  pub fn parse(value: &str) -> Self {
    let lower = value.to_ascii_lowercase();
    if lower.contains("v10") {
      YoloVersion::V10
    } else if ["v8", "v9", "v11"].iter().any(|p| lower.contains(p)) {
      YoloVersion::V8
    } else if ["v5", "v7"].iter().any(|p| lower.contains(p)) {
      YoloVersion::V5
    } else if ["v3", "v4"].iter().any(|p| lower.contains(p)) {
      YoloVersion::V4
    } else {
      YoloVersion::Auto
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      YoloVersion::Auto => "auto",
      YoloVersion::V4 => "YOLOv4",
      YoloVersion::V5 => "YOLOv5/v7",
      YoloVersion::V8 => "YOLOv8/v9/v11",
      YoloVersion::V10 => "YOLOv10",
    }
  }
}

impl FromStr for YoloVersion {
  type Err = Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self::parse(s))
  }
}

impl From<String> for YoloVersion {
  fn from(value: String) -> Self {
    Self::parse(&value)
  }
}

impl From<YoloVersion> for String {
  fn from(value: YoloVersion) -> Self {
    match value {
      YoloVersion::Auto => "auto",
      YoloVersion::V4 => "v4",
      YoloVersion::V5 => "v5",
      YoloVersion::V8 => "v8",
      YoloVersion::V10 => "v10",
    }
    .to_string()
  }
}

impl fmt::Display for YoloVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("模型没有输出")]
  EmptyOutput,
  #[error("输出形状 {shape:?} 不适用于 {version}: {reason}")]
  Shape {
    shape: Vec<usize>,
    version: YoloVersion,
    reason: &'static str,
  },
}

/// 解码参数
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeConfig {
  pub version: YoloVersion,
  pub input_width: u32,
  pub input_height: u32,
  pub num_classes: usize,
  pub confidence_threshold: f32,
  pub nms_threshold: f32,
  pub max_detections: usize,
}

impl Default for DecodeConfig {
  fn default() -> Self {
    Self {
      version: YoloVersion::Auto,
      input_width: 416,
      input_height: 416,
      num_classes: 80,
      confidence_threshold: 0.5,
      nms_threshold: 0.4,
      max_detections: 256,
    }
  }
}

/// 候选框，坐标为模型输入空间内的像素
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub class_id: usize,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

/// 根据输出张量形状推断 YOLO 版本，无法判断时返回 `Auto`
pub fn detect_version(outputs: &[Tensor], num_classes: usize) -> YoloVersion {
  let Some(first) = outputs.first() else {
    return YoloVersion::Auto;
  };

  let shape = first.squeezed_shape();
  if shape.len() > 2 {
    // 原始网格输出 [A*(5+C), H, W] 或 [H, W, A, 5+C]
    return YoloVersion::V4;
  }
  if shape.len() < 2 {
    return YoloVersion::Auto;
  }

  let (dim1, dim2) = (shape[0], shape[1]);
  if dim1 == 300 && dim2 == 6 {
    YoloVersion::V10
  } else if dim2 == 8400 && dim1 == 4 + num_classes {
    YoloVersion::V8
  } else if V5_BOX_COUNTS.contains(&dim1) {
    YoloVersion::V5
  } else if dim1 < 100 && dim2 > 1000 {
    YoloVersion::V8
  } else if dim1 > 1000 && dim2 < 100 {
    YoloVersion::V5
  } else if V4_BOX_COUNTS.contains(&dim1) || outputs.len() > 1 {
    YoloVersion::V4
  } else {
    YoloVersion::Auto
  }
}

/// 解码模型输出并执行按类别的 NMS
pub fn decode(outputs: &[Tensor], config: &DecodeConfig) -> Result<Vec<Candidate>, DecodeError> {
  if outputs.is_empty() {
    return Err(DecodeError::EmptyOutput);
  }

  let version = match config.version {
    YoloVersion::Auto => detect_version(outputs, config.num_classes),
    version => version,
  };
  debug!(
    "解码模型输出: 版本={}, 输出数量={}, 首个形状={:?}",
    version,
    outputs.len(),
    outputs[0].shape
  );

  let mut candidates = Vec::new();
  match version {
    YoloVersion::V4 => {
      for tensor in outputs {
        if tensor.squeezed_shape().len() == 2 {
          decode_rows(tensor, config, version, &mut candidates)?;
        } else {
          decode_grid(tensor, config, &mut candidates)?;
        }
      }
    }
    // 无法判断时按 v5 格式尝试
    YoloVersion::V5 | YoloVersion::Auto => {
      decode_rows(&outputs[0], config, YoloVersion::V5, &mut candidates)?
    }
    YoloVersion::V8 => decode_transposed(&outputs[0], config, &mut candidates)?,
    YoloVersion::V10 => decode_end_to_end(&outputs[0], config, &mut candidates)?,
  }

  debug!("候选框数量: {}", candidates.len());

  if version == YoloVersion::V10 {
    candidates.truncate(config.max_detections);
    return Ok(candidates);
  }

  Ok(non_max_suppression(
    candidates,
    config.nms_threshold,
    config.max_detections,
  ))
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 数值落在 [0, 1] 之外时视为 logit
fn activate(x: f32) -> f32 {
  if (0.0..=1.0).contains(&x) { x } else { sigmoid(x) }
}

fn best_class(scores: impl Iterator<Item = f32>) -> (usize, f32) {
  let mut best = (0usize, f32::MIN);
  for (idx, score) in scores.enumerate() {
    if score > best.1 {
      best = (idx, score);
    }
  }
  best
}

/// (cx, cy, w, h) 转为角点坐标，全部不大于 1 时按归一化坐标放大到输入尺寸
fn center_to_corners(cx: f32, cy: f32, w: f32, h: f32, config: &DecodeConfig) -> [f32; 4] {
  let (mut cx, mut cy, mut w, mut h) = (cx, cy, w, h);
  if cx <= 1.0 && cy <= 1.0 && w <= 1.0 && h <= 1.0 {
    let (iw, ih) = (config.input_width as f32, config.input_height as f32);
    cx *= iw;
    cy *= ih;
    w *= iw;
    h *= ih;
  }
  [cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5]
}

fn shape_error(tensor: &Tensor, version: YoloVersion, reason: &'static str) -> DecodeError {
  DecodeError::Shape {
    shape: tensor.shape.clone(),
    version,
    reason,
  }
}

fn check_len(
  tensor: &Tensor,
  expected: usize,
  version: YoloVersion,
) -> Result<(), DecodeError> {
  if tensor.data.len() < expected {
    return Err(shape_error(tensor, version, "数据长度小于形状声明"));
  }
  Ok(())
}

/// 行格式 [N, 5+C]：cx, cy, w, h, obj, classes...
fn decode_rows(
  tensor: &Tensor,
  config: &DecodeConfig,
  version: YoloVersion,
  out: &mut Vec<Candidate>,
) -> Result<(), DecodeError> {
  let shape = tensor.squeezed_shape();
  if shape.len() != 2 {
    return Err(shape_error(tensor, version, "需要二维输出"));
  }

  let (rows, box_size) = (shape[0], shape[1]);
  if box_size < 6 {
    return Err(shape_error(tensor, version, "每行至少需要 6 个数值"));
  }
  check_len(tensor, rows * box_size, version)?;

  let num_classes = if config.num_classes == 0 || box_size < 5 + config.num_classes {
    box_size - 5
  } else {
    config.num_classes
  };

  for row in tensor.data.chunks_exact(box_size).take(rows) {
    let objectness = activate(row[4]);
    if objectness < config.confidence_threshold {
      continue;
    }

    let (class_id, prob) = best_class(row[5..5 + num_classes].iter().copied());
    let score = objectness * activate(prob);
    if score < config.confidence_threshold {
      continue;
    }

    out.push(Candidate {
      class_id,
      score,
      bbox: center_to_corners(row[0], row[1], row[2], row[3], config),
    });
  }
  Ok(())
}

/// 转置格式 [4+C, N]，没有目标置信度
fn decode_transposed(
  tensor: &Tensor,
  config: &DecodeConfig,
  out: &mut Vec<Candidate>,
) -> Result<(), DecodeError> {
  let version = YoloVersion::V8;
  let shape = tensor.squeezed_shape();
  if shape.len() != 2 {
    return Err(shape_error(tensor, version, "需要二维输出"));
  }
  check_len(tensor, shape[0] * shape[1], version)?;

  // 个别导出为 [N, 4+C]，类别数对不上时按较小的维度作为通道
  let transposed = if shape[0] == 4 + config.num_classes {
    true
  } else if shape[1] == 4 + config.num_classes {
    false
  } else {
    shape[0] <= shape[1]
  };
  let (channels, boxes) = if transposed {
    (shape[0], shape[1])
  } else {
    (shape[1], shape[0])
  };
  if channels <= 4 {
    return Err(shape_error(tensor, version, "通道数必须大于 4"));
  }
  let num_classes = channels - 4;

  let at = |channel: usize, index: usize| -> f32 {
    if transposed {
      tensor.data[channel * boxes + index]
    } else {
      tensor.data[index * channels + channel]
    }
  };

  for i in 0..boxes {
    let (class_id, raw) = best_class((0..num_classes).map(|c| at(4 + c, i)));
    let score = activate(raw);
    if score < config.confidence_threshold {
      continue;
    }

    out.push(Candidate {
      class_id,
      score,
      bbox: center_to_corners(at(0, i), at(1, i), at(2, i), at(3, i), config),
    });
  }
  Ok(())
}

/// 端到端格式 [N, 6]：x1, y1, x2, y2, score, class
fn decode_end_to_end(
  tensor: &Tensor,
  config: &DecodeConfig,
  out: &mut Vec<Candidate>,
) -> Result<(), DecodeError> {
  let version = YoloVersion::V10;
  let shape = tensor.squeezed_shape();
  if shape.len() != 2 || shape[1] < 6 {
    return Err(shape_error(tensor, version, "需要 [N, 6] 输出"));
  }
  check_len(tensor, shape[0] * shape[1], version)?;

  for row in tensor.data.chunks_exact(shape[1]).take(shape[0]) {
    let score = row[4];
    if score < config.confidence_threshold {
      continue;
    }

    let mut bbox = [row[0], row[1], row[2], row[3]];
    if bbox.iter().all(|v| *v <= 1.0) {
      let (iw, ih) = (config.input_width as f32, config.input_height as f32);
      bbox = [bbox[0] * iw, bbox[1] * ih, bbox[2] * iw, bbox[3] * ih];
    }

    out.push(Candidate {
      class_id: row[5].max(0.0) as usize,
      score,
      bbox,
    });
  }
  Ok(())
}

fn anchors_for_stride(stride: f32) -> &'static [(f32, f32); 3] {
  if stride <= 8.5 {
    &YOLOV4_ANCHORS[0]
  } else if stride <= 16.5 {
    &YOLOV4_ANCHORS[1]
  } else {
    &YOLOV4_ANCHORS[2]
  }
}

/// 原始网格输出：[A*(5+C), H, W]（通道在前）或 [H, W, A, 5+C]
fn decode_grid(
  tensor: &Tensor,
  config: &DecodeConfig,
  out: &mut Vec<Candidate>,
) -> Result<(), DecodeError> {
  let version = YoloVersion::V4;
  let shape = tensor.squeezed_shape().to_vec();

  let (grid_h, grid_w, anchors, attrs, channels_first) = match shape.as_slice() {
    &[channels, h, w] => {
      if channels % ANCHORS_PER_SCALE != 0 {
        return Err(shape_error(tensor, version, "通道数不是 anchor 数的整数倍"));
      }
      (h, w, ANCHORS_PER_SCALE, channels / ANCHORS_PER_SCALE, true)
    }
    &[h, w, a, attrs] => (h, w, a, attrs, false),
    _ => return Err(shape_error(tensor, version, "不支持的网格维度")),
  };
  if attrs < 6 || grid_h == 0 || grid_w == 0 || anchors > ANCHORS_PER_SCALE {
    return Err(shape_error(tensor, version, "网格参数无效"));
  }
  check_len(tensor, grid_h * grid_w * anchors * attrs, version)?;

  let num_classes = attrs - 5;
  let stride_x = config.input_width as f32 / grid_w as f32;
  let stride_y = config.input_height as f32 / grid_h as f32;
  let anchor_table = anchors_for_stride(stride_x);

  let at = |a: usize, k: usize, y: usize, x: usize| -> f32 {
    if channels_first {
      tensor.data[((a * attrs + k) * grid_h + y) * grid_w + x]
    } else {
      tensor.data[((y * grid_w + x) * anchors + a) * attrs + k]
    }
  };

  for y in 0..grid_h {
    for x in 0..grid_w {
      for (a, &(anchor_w, anchor_h)) in anchor_table.iter().enumerate().take(anchors) {
        let objectness = sigmoid(at(a, 4, y, x));
        if objectness < config.confidence_threshold {
          continue;
        }

        let (class_id, logit) = best_class((0..num_classes).map(|c| at(a, 5 + c, y, x)));
        let score = objectness * sigmoid(logit);
        if score < config.confidence_threshold {
          continue;
        }

        let cx = (sigmoid(at(a, 0, y, x)) + x as f32) * stride_x;
        let cy = (sigmoid(at(a, 1, y, x)) + y as f32) * stride_y;
        let w = anchor_w * at(a, 2, y, x).exp();
        let h = anchor_h * at(a, 3, y, x).exp();

        out.push(Candidate {
          class_id,
          score,
          bbox: [cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5],
        });
      }
    }
  }
  Ok(())
}
