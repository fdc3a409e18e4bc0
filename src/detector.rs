// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detector.rs - 检测输出解码
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

mod nms;
mod yolo;

pub use self::nms::{iou, non_max_suppression};
pub use self::yolo::{Candidate, DecodeConfig, DecodeError, YoloVersion, decode, detect_version};

/// 模型输出张量（行优先，f32）
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl Tensor {
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self { shape, data }
  }

  /// 去掉前导的批次维度（大小为 1）
  pub(crate) fn squeezed_shape(&self) -> &[usize] {
    let mut shape = self.shape.as_slice();
    while shape.len() > 2 && shape[0] == 1 {
      shape = &shape[1..];
    }
    shape
  }
}
