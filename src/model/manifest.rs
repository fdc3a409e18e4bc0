// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/manifest.rs - 模型目录、清单与标签
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
  fmt,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{detector::YoloVersion, error::ModelLoadError};

pub const MANIFEST_FILE: &str = "cira_model.json";
pub const LABEL_FILES: [&str; 2] = ["obj.names", "labels.txt"];

/// 模型格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
  Darknet,
  Ncnn,
  Onnx,
  #[serde(alias = "trt", alias = "engine")]
  TensorRt,
}

impl fmt::Display for ModelFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ModelFormat::Darknet => "darknet",
      ModelFormat::Ncnn => "ncnn",
      ModelFormat::Onnx => "onnx",
      ModelFormat::TensorRt => "tensorrt",
    })
  }
}

impl ModelFormat {
  /// 根据单个文件的扩展名判断格式
  pub fn from_extension(path: &Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
      "weights" | "cfg" => Some(ModelFormat::Darknet),
      "param" | "bin" => Some(ModelFormat::Ncnn),
      "onnx" => Some(ModelFormat::Onnx),
      "engine" | "trt" => Some(ModelFormat::TensorRt),
      _ => None,
    }
  }

  /// 格式所需的 (主文件, 辅助文件) 扩展名
  fn extensions(&self) -> (&'static [&'static str], Option<&'static str>) {
    match self {
      ModelFormat::Darknet => (&["weights"], Some("cfg")),
      ModelFormat::Ncnn => (&["param"], Some("bin")),
      ModelFormat::Onnx => (&["onnx"], None),
      ModelFormat::TensorRt => (&["engine", "trt"], None),
    }
  }
}

/// `cira_model.json` 清单，所有字段均可缺省
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelManifest {
  pub name: Option<String>,
  pub format: Option<ModelFormat>,
  pub yolo_version: Option<YoloVersion>,
  pub input_size: Option<u32>,
  pub input_width: Option<u32>,
  pub input_height: Option<u32>,
  pub num_classes: Option<usize>,
  pub class_names: Vec<String>,
  pub confidence_threshold: Option<f32>,
  pub nms_threshold: Option<f32>,
}

impl ModelManifest {
  /// 读取目录下的清单，不存在时返回 `None`
  pub fn read(dir: &Path) -> Result<Option<Self>, ModelLoadError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
      debug!("未找到模型清单 {}，使用自动检测", path.display());
      return Ok(None);
    }

    let text = std::fs::read_to_string(&path)?;
    let manifest = serde_json::from_str(&text)
      .map_err(|e| ModelLoadError::Manifest(format!("{}: {}", path.display(), e)))?;
    debug!("模型清单: {:?}", manifest);
    Ok(Some(manifest))
  }
}

/// 读取标签：优先使用标签文件，其次使用清单中的 `class_names`
pub fn load_labels(dir: &Path, manifest: &ModelManifest) -> Result<Vec<String>, ModelLoadError> {
  for name in LABEL_FILES {
    let path = dir.join(name);
    if !path.is_file() {
      continue;
    }

    let labels: Vec<String> = std::fs::read_to_string(&path)?
      .lines()
      .map(str::trim)
      .filter(|l| !l.is_empty())
      .map(String::from)
      .collect();
    if labels.is_empty() {
      return Err(ModelLoadError::Labels(path));
    }
    debug!("从 {} 读取 {} 个标签", path.display(), labels.len());
    return Ok(labels);
  }

  if manifest.class_names.is_empty() {
    return Err(ModelLoadError::Labels(dir.join(LABEL_FILES[1])));
  }
  Ok(manifest.class_names.clone())
}

/// 模型文件集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
  pub format: ModelFormat,
  pub root: PathBuf,
  pub primary: PathBuf,
  pub secondary: Option<PathBuf>,
}

impl ModelFiles {
  /// 在目录或单个文件上确定格式与所需文件
  pub fn discover(path: &Path, format: Option<ModelFormat>) -> Result<Self, ModelLoadError> {
    if path.is_dir() {
      Self::discover_dir(path, format)
    } else {
      Self::discover_file(path, format)
    }
  }

  fn discover_dir(dir: &Path, format: Option<ModelFormat>) -> Result<Self, ModelLoadError> {
    let entries = sorted_files(dir)?;

    if let Some(format) = format {
      return Self::collect(dir, &entries, format)?
        .ok_or_else(|| missing(format.extensions().0[0]));
    }

    // 依次尝试 Darknet、NCNN、ONNX、TensorRT
    for format in [
      ModelFormat::Darknet,
      ModelFormat::Ncnn,
      ModelFormat::Onnx,
      ModelFormat::TensorRt,
    ] {
      if let Some(files) = Self::collect(dir, &entries, format)? {
        return Ok(files);
      }
    }
    Err(ModelLoadError::UnknownFormat(dir.to_path_buf()))
  }

  /// 在目录中收集某格式的文件；主文件不存在返回 `None`，辅助文件缺失视为错误
  fn collect(
    dir: &Path,
    entries: &[PathBuf],
    format: ModelFormat,
  ) -> Result<Option<Self>, ModelLoadError> {
    let (primary_exts, secondary_ext) = format.extensions();
    let Some(primary) = entries.iter().find(|p| has_extension(p, primary_exts)) else {
      return Ok(None);
    };

    let secondary = match secondary_ext {
      Some(ext) => Some(
        sibling(primary, ext)
          .or_else(|| entries.iter().find(|p| has_extension(p, &[ext])).cloned())
          .ok_or_else(|| missing(ext))?,
      ),
      None => None,
    };

    Ok(Some(Self {
      format,
      root: dir.to_path_buf(),
      primary: primary.clone(),
      secondary,
    }))
  }

  fn discover_file(path: &Path, format: Option<ModelFormat>) -> Result<Self, ModelLoadError> {
    let format = format
      .or_else(|| ModelFormat::from_extension(path))
      .ok_or_else(|| ModelLoadError::UnknownFormat(path.to_path_buf()))?;
    let root = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));

    let (primary_exts, secondary_ext) = format.extensions();
    let (primary, secondary) = match secondary_ext {
      // 给的是辅助文件（.cfg / .bin）时反过来找主文件
      Some(ext) if has_extension(path, &[ext]) => {
        let primary = primary_exts
          .iter()
          .find_map(|e| sibling(path, e))
          .ok_or_else(|| missing(primary_exts[0]))?;
        (primary, Some(path.to_path_buf()))
      }
      Some(ext) => {
        let secondary = sibling(path, ext).ok_or_else(|| missing(ext))?;
        (path.to_path_buf(), Some(secondary))
      }
      None => (path.to_path_buf(), None),
    };

    Ok(Self {
      format,
      root,
      primary,
      secondary,
    })
  }
}

fn missing(ext: &str) -> ModelLoadError {
  ModelLoadError::MissingFile(format!("*.{}", ext))
}

fn has_extension(path: &Path, exts: &[&str]) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| exts.iter().any(|x| e.eq_ignore_ascii_case(x)))
    .unwrap_or(false)
}

fn sibling(path: &Path, ext: &str) -> Option<PathBuf> {
  let candidate = path.with_extension(ext);
  candidate.is_file().then_some(candidate)
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, ModelLoadError> {
  let mut files = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if path.is_file() {
      files.push(path);
    }
  }
  files.sort();
  Ok(files)
}
