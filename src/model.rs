// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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
  path::{Path, PathBuf},
  sync::{Arc, PoisonError, RwLock},
  time::Instant,
};

use image::{RgbImage, imageops::FilterType};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
  detector::{self, DecodeConfig, Tensor, YoloVersion},
  error::{InferenceError, ModelLoadError},
  frame::Frame,
};

mod backend;
mod manifest;
#[cfg(feature = "onnx")]
mod onnx;

pub use self::manifest::{
  LABEL_FILES, MANIFEST_FILE, ModelFiles, ModelFormat, ModelManifest, load_labels,
};

pub const DEFAULT_INPUT_SIZE: u32 = 416;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;
pub const DEFAULT_MAX_DETECTIONS: usize = 256;

/// 单个检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  #[serde(skip)]
  pub class_id: usize,
  pub label: String,
  pub confidence: f32,
  pub bbox: [f32; 4], // [x, y, w, h]，归一化到 [0, 1]
}

/// 推理后端的统一入口
///
/// 输入为 `[1, 3, H, W]` 的 RGB 浮点张量（取值 0~1），输出为模型的原始张量。
pub trait InferenceBackend: Send + Sync {
  fn name(&self) -> &str;
  fn infer(&self, input: &Tensor) -> Result<Vec<Tensor>, InferenceError>;
}

/// 模型配置，由清单、标签文件与默认值合成
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
  pub name: String,
  pub format: Option<ModelFormat>,
  pub version: YoloVersion,
  pub input_width: u32,
  pub input_height: u32,
  pub confidence_threshold: f32,
  pub nms_threshold: f32,
  pub max_detections: usize,
  pub labels: Vec<String>,
}

impl ModelConfig {
  pub fn new(name: impl Into<String>, labels: Vec<String>) -> Self {
    Self {
      name: name.into(),
      format: None,
      version: YoloVersion::Auto,
      input_width: DEFAULT_INPUT_SIZE,
      input_height: DEFAULT_INPUT_SIZE,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      max_detections: DEFAULT_MAX_DETECTIONS,
      labels,
    }
  }

  /// 应用清单中的覆盖项，非正数的取值被忽略
  pub fn with_manifest(mut self, manifest: &ModelManifest) -> Self {
    if let Some(name) = manifest.name.as_ref().filter(|n| !n.is_empty()) {
      self.name = name.clone();
    }
    if let Some(format) = manifest.format {
      self.format = Some(format);
    }
    if let Some(version) = manifest.yolo_version {
      self.version = version;
    }
    if let Some(size) = manifest.input_size.filter(|s| *s > 0) {
      self.input_width = size;
      self.input_height = size;
    }
    if let Some(width) = manifest.input_width.filter(|w| *w > 0) {
      self.input_width = width;
    }
    if let Some(height) = manifest.input_height.filter(|h| *h > 0) {
      self.input_height = height;
    }
    if let Some(conf) = manifest.confidence_threshold.filter(|c| *c > 0.0) {
      self.confidence_threshold = conf;
    }
    if let Some(nms) = manifest.nms_threshold.filter(|n| *n > 0.0) {
      self.nms_threshold = nms;
    }
    self
  }

  pub fn decode_config(&self) -> DecodeConfig {
    DecodeConfig {
      version: self.version,
      input_width: self.input_width,
      input_height: self.input_height,
      num_classes: self.labels.len(),
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
      max_detections: self.max_detections,
    }
  }
}

/// 已加载的检测模型
pub struct Model {
  config: ModelConfig,
  backend: Box<dyn InferenceBackend>,
  source: Option<PathBuf>,
}

impl std::fmt::Debug for Model {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Model")
      .field("config", &self.config)
      .field("backend", &self.backend.name())
      .field("source", &self.source)
      .finish()
  }
}

impl Model {
  /// 从模型目录或模型文件加载
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
    let path = path.as_ref();
    info!("加载模型: {}", path.display());
    if !path.exists() {
      return Err(ModelLoadError::NotFound(path.to_path_buf()));
    }

    let root = if path.is_dir() {
      path.to_path_buf()
    } else {
      path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
    };

    let manifest = ModelManifest::read(&root)?.unwrap_or_default();
    let files = ModelFiles::discover(path, manifest.format)?;
    debug!("模型格式: {}, 文件: {:?}", files.format, files);

    let labels = load_labels(&root, &manifest)?;
    if let Some(declared) = manifest.num_classes.filter(|n| *n > 0 && *n != labels.len()) {
      warn!(
        "清单声明 {} 个类别，标签实际为 {} 个，以标签为准",
        declared,
        labels.len()
      );
    }

    let default_name = root
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "model".to_string());
    let mut config = ModelConfig::new(default_name, labels).with_manifest(&manifest);
    config.format = Some(files.format);

    let backend = backend::open(&files, &config)?;
    info!(
      "模型加载完成: {} ({}, {}, 输入 {}x{}, {} 个类别)",
      config.name,
      files.format,
      config.version,
      config.input_width,
      config.input_height,
      config.labels.len()
    );

    Ok(Self {
      config,
      backend,
      source: Some(path.to_path_buf()),
    })
  }

  /// 使用外部提供的后端构造模型
  pub fn from_backend(config: ModelConfig, backend: Box<dyn InferenceBackend>) -> Self {
    Self {
      config,
      backend,
      source: None,
    }
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  pub fn labels(&self) -> &[String] {
    &self.config.labels
  }

  pub fn source(&self) -> Option<&Path> {
    self.source.as_deref()
  }

  /// 对一帧图像执行检测，返回归一化坐标的结果
  pub fn predict(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
    let now = Instant::now();
    let input = self.preprocess(frame.image());
    let outputs = self.backend.infer(&input)?;
    let infer_elapsed = now.elapsed();

    let candidates = detector::decode(&outputs, &self.config.decode_config())
      .map_err(|e| InferenceError::Decode(e.to_string()))?;

    let (iw, ih) = (
      self.config.input_width as f32,
      self.config.input_height as f32,
    );
    let detections: Vec<Detection> = candidates
      .into_iter()
      .filter_map(|c| {
        let x1 = (c.bbox[0] / iw).clamp(0.0, 1.0);
        let y1 = (c.bbox[1] / ih).clamp(0.0, 1.0);
        let x2 = (c.bbox[2] / iw).clamp(0.0, 1.0);
        let y2 = (c.bbox[3] / ih).clamp(0.0, 1.0);
        if x2 <= x1 || y2 <= y1 {
          return None;
        }
        let label = self
          .config
          .labels
          .get(c.class_id)
          .cloned()
          .unwrap_or_else(|| format!("class_{}", c.class_id));
        Some(Detection {
          class_id: c.class_id,
          label,
          confidence: c.score,
          bbox: [x1, y1, x2 - x1, y2 - y1],
        })
      })
      .collect();

    debug!(
      "推理完成: {} 个目标, 推理耗时 {:.2?}, 总耗时 {:.2?}",
      detections.len(),
      infer_elapsed,
      now.elapsed()
    );
    Ok(detections)
  }

  /// 缩放到模型输入尺寸并转为 NCHW 浮点张量
  fn preprocess(&self, image: &RgbImage) -> Tensor {
    let (w, h) = (self.config.input_width, self.config.input_height);
    let resized = if image.dimensions() == (w, h) {
      image.clone()
    } else {
      image::imageops::resize(image, w, h, FilterType::Triangle)
    };

    let plane = (w * h) as usize;
    let mut data = vec![0f32; plane * 3];
    for (idx, pixel) in resized.pixels().enumerate() {
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }

    Tensor::new(vec![1, 3, h as usize, w as usize], data)
  }
}

/// 当前模型槽位
///
/// 读锁只用于克隆 `Arc`，推理与加载都在锁外进行：
/// 正在推理的帧继续使用旧模型，下一帧使用新模型。
#[derive(Debug, Default)]
pub struct ModelSlot {
  current: RwLock<Option<Arc<Model>>>,
}

impl ModelSlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn current(&self) -> Option<Arc<Model>> {
    self
      .current
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn is_loaded(&self) -> bool {
    self
      .current
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  pub fn name(&self) -> Option<String> {
    self.current().map(|m| m.name().to_string())
  }

  /// 加载并替换当前模型；失败时保留原模型
  pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<Model>, ModelLoadError> {
    let model = Model::load(path)?;
    Ok(self.install(model))
  }

  pub fn install(&self, model: Model) -> Arc<Model> {
    let model = Arc::new(model);
    let previous = self
      .current
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(model.clone());
    if let Some(previous) = previous {
      info!("模型已切换: {} -> {}", previous.name(), model.name());
    }
    model
  }

  pub fn unload(&self) -> Option<Arc<Model>> {
    let previous = self
      .current
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(model) = previous.as_ref() {
      info!("模型已卸载: {}", model.name());
    }
    previous
  }

  pub fn predict(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
    let model = self.current().ok_or(InferenceError::NoModel)?;
    model.predict(frame)
  }
}
