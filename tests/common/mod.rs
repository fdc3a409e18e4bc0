// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的模型与工具
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

#![allow(dead_code)]

use std::time::{Duration, Instant};

use shanan_edge::{
  detector::{Tensor, YoloVersion},
  error::InferenceError,
  model::{InferenceBackend, Model, ModelConfig},
};

/// 固定输出的后端，行格式 [cx, cy, w, h, obj, ok, defect]
pub struct FixedBackend {
  rows: Vec<[f32; 7]>,
}

impl InferenceBackend for FixedBackend {
  fn name(&self) -> &str {
    "fixed"
  }

  fn infer(&self, _input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    let data = self.rows.iter().flatten().copied().collect();
    Ok(vec![Tensor::new(vec![1, self.rows.len(), 7], data)])
  }
}

pub fn fixed_model(name: &str, rows: Vec<[f32; 7]>) -> Model {
  let mut config = ModelConfig::new(name, vec!["ok".to_string(), "defect".to_string()]);
  config.version = YoloVersion::V5;
  Model::from_backend(config, Box::new(FixedBackend { rows }))
}

/// 在 416x416 输入的中央输出一个 defect
pub fn defect_model(name: &str) -> Model {
  fixed_model(name, vec![[208.0, 208.0, 104.0, 52.0, 0.95, 0.1, 0.9]])
}

/// 每次推理都失败的后端
pub struct FailingBackend;

impl InferenceBackend for FailingBackend {
  fn name(&self) -> &str {
    "failing"
  }

  fn infer(&self, _input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    Err(InferenceError::Backend("NPU 超时".to_string()))
  }
}

pub fn failing_model(name: &str) -> Model {
  let config = ModelConfig::new(name, vec!["ok".to_string(), "defect".to_string()]);
  Model::from_backend(config, Box::new(FailingBackend))
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(10));
  }
  condition()
}
