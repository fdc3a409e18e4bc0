// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/backend.rs - 推理后端选择
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

use tracing::{debug, error};

use super::{InferenceBackend, ModelConfig, ModelFiles, ModelFormat};
use crate::error::ModelLoadError;

/// 按格式打开推理后端
pub(super) fn open(
  files: &ModelFiles,
  config: &ModelConfig,
) -> Result<Box<dyn InferenceBackend>, ModelLoadError> {
  check_readable(files)?;

  match files.format {
    #[cfg(feature = "onnx")]
    ModelFormat::Onnx => Ok(Box::new(super::onnx::OnnxBackend::open(
      &files.primary,
      config,
    )?)),
    format => {
      let _ = config;
      error!("{} 推理后端未编译进当前版本", format);
      Err(ModelLoadError::BackendUnavailable(format))
    }
  }
}

/// 权重文件必须非空且可读
fn check_readable(files: &ModelFiles) -> Result<(), ModelLoadError> {
  for path in std::iter::once(&files.primary).chain(files.secondary.iter()) {
    let meta = std::fs::metadata(path)?;
    debug!(
      "模型文件 {}: {:.2} MB",
      path.display(),
      meta.len() as f64 / (1024.0 * 1024.0)
    );
    if meta.len() == 0 {
      return Err(ModelLoadError::Backend(format!(
        "模型文件为空: {}",
        path.display()
      )));
    }
  }
  Ok(())
}
