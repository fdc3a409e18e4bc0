// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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

use std::path::Path;

use ndarray::Array4;
use ort::{GraphOptimizationLevel, Session};
use tracing::{debug, info};

use super::{InferenceBackend, ModelConfig};
use crate::{
  detector::Tensor,
  error::{InferenceError, ModelLoadError},
};

const INTRA_THREADS: usize = 4;

pub struct OnnxBackend {
  session: Session,
  input_name: String,
  output_names: Vec<String>,
}

impl OnnxBackend {
  pub fn open(path: &Path, config: &ModelConfig) -> Result<Self, ModelLoadError> {
    info!("创建 ONNX Runtime 会话: {}", path.display());
    let session = Session::builder()
      .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
      .and_then(|b| b.with_intra_threads(INTRA_THREADS))
      .and_then(|b| b.commit_from_file(path))
      .map_err(|e| ModelLoadError::Backend(e.to_string()))?;

    let input_name = session
      .inputs
      .first()
      .map(|i| i.name.clone())
      .ok_or_else(|| ModelLoadError::Backend("模型没有输入".to_string()))?;
    let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
    if output_names.is_empty() {
      return Err(ModelLoadError::Backend("模型没有输出".to_string()));
    }

    debug!(
      "模型输入: {}, 输出: {:?}, 期望输入尺寸 {}x{}",
      input_name, output_names, config.input_width, config.input_height
    );

    Ok(Self {
      session,
      input_name,
      output_names,
    })
  }
}

impl InferenceBackend for OnnxBackend {
  fn name(&self) -> &str {
    "onnx"
  }

  fn infer(&self, input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    let backend_err = |e: ort::Error| InferenceError::Backend(e.to_string());

    let shape = match input.shape.as_slice() {
      &[n, c, h, w] => (n, c, h, w),
      other => {
        return Err(InferenceError::Backend(format!(
          "输入形状无效: {:?}",
          other
        )));
      }
    };
    let array = Array4::from_shape_vec(shape, input.data.clone())
      .map_err(|e| InferenceError::Backend(e.to_string()))?;

    let inputs = ort::inputs![self.input_name.as_str() => array.view()].map_err(backend_err)?;
    let outputs = self.session.run(inputs).map_err(backend_err)?;

    let mut tensors = Vec::with_capacity(self.output_names.len());
    for name in &self.output_names {
      let view = outputs[name.as_str()]
        .try_extract_tensor::<f32>()
        .map_err(backend_err)?;
      tensors.push(Tensor::new(
        view.shape().to_vec(),
        view.iter().copied().collect(),
      ));
    }
    Ok(tensors)
  }
}
