// 该文件是 Wangyue （望月） 项目的一部分。
// src/model.rs - 检测模型
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

use thiserror::Error;

use crate::frame::RgbFrame;

mod engine;
mod labels;
#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_yolo26")]
mod yolo26;

pub use self::engine::{BackendLoader, Engine, EngineCache, ModelLoader};
pub use self::labels::{COCO_CLASSES, label_for};
#[cfg(feature = "model_onnx")]
pub use self::onnx::OnnxYolo;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder};

/// 默认的 NMS IoU 阈值
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;

/// 已编译的后端能加载的模型扩展名
pub const LOADABLE_EXTENSIONS: &[&str] = &[
  #[cfg(feature = "model_onnx")]
  "onnx",
  #[cfg(feature = "model_yolo26")]
  "rknn",
];

/// 模型标识，通常为模型文件路径。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(String);

impl ModelId {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn as_path(&self) -> &Path {
    Path::new(&self.0)
  }

  /// 小写的文件扩展名
  pub fn extension(&self) -> Option<String> {
    self
      .as_path()
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| ext.to_ascii_lowercase())
  }
}

impl fmt::Display for ModelId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ModelId {
  fn from(value: &str) -> Self {
    ModelId(value.to_string())
  }
}

impl From<String> for ModelId {
  fn from(value: String) -> Self {
    ModelId(value)
  }
}

impl From<PathBuf> for ModelId {
  fn from(value: PathBuf) -> Self {
    ModelId(value.to_string_lossy().into_owned())
  }
}

impl From<&Path> for ModelId {
  fn from(value: &Path) -> Self {
    ModelId(value.to_string_lossy().into_owned())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_id: u32,
  pub label: String,
  pub confidence: f32,
  pub bbox: [f32; 4], // [x1, y1, x2, y2]，帧像素坐标
}

impl Detection {
  pub fn new(class_id: u32, confidence: f32, bbox: [f32; 4]) -> Self {
    Self {
      class_id,
      label: label_for(class_id),
      confidence,
      bbox,
    }
  }

  pub fn width(&self) -> f32 {
    (self.bbox[2] - self.bbox[0]).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.bbox[3] - self.bbox[1]).max(0.0)
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  /// 两个边界框的 IoU
  pub fn iou(&self, other: &Detection) -> f32 {
    let x1 = self.bbox[0].max(other.bbox[0]);
    let y1 = self.bbox[1].max(other.bbox[1]);
    let x2 = self.bbox[2].min(other.bbox[2]);
    let y2 = self.bbox[3].min(other.bbox[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 单帧的检测结果，空集合表示没有超过阈值的目标。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionSet {
  items: Box<[Detection]>,
}

impl DetectionSet {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }

  pub fn as_slice(&self) -> &[Detection] {
    &self.items
  }

  /// 只保留置信度不低于阈值的检测结果，顺序不变。
  pub fn above(self, threshold: f32) -> Self {
    let items = self
      .items
      .into_vec()
      .into_iter()
      .filter(|d| d.confidence >= threshold)
      .collect::<Vec<_>>();
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

impl From<Vec<Detection>> for DetectionSet {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

impl<'a> IntoIterator for &'a DetectionSet {
  type Item = &'a Detection;
  type IntoIter = std::slice::Iter<'a, Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("输入帧无效: {0}")]
  InvalidFrame(String),
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("模型输出格式错误: {0}")]
  MalformedOutput(String),
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("读取模型文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("不支持的模型格式: {0}")]
  UnsupportedFormat(String),
  #[error("模型格式 {format} 需要启用 `{feature}` 特性")]
  BackendDisabled {
    format: String,
    feature: &'static str,
  },
  #[error("模型无效: {0}")]
  Invalid(String),
}

/// 检测模型。
///
/// 模型加载后只读，可在线程间共享；`infer` 不得修改输入帧。
pub trait Model: Send + Sync {
  fn name(&self) -> &str;

  fn infer(&self, frame: &RgbFrame, threshold: f32) -> Result<DetectionSet, InferenceError>;
}

/// 将置信度阈值限制在 [0, 1]，NaN 视为 0。
pub fn clamp_threshold(threshold: f32) -> f32 {
  if threshold.is_nan() {
    0.0
  } else {
    threshold.clamp(0.0, 1.0)
  }
}

/// 按类别做非极大值抑制，结果按置信度降序排列。
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  // 稳定排序，保证同分时结果确定
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut result: Vec<Detection> = Vec::with_capacity(detections.len());
  for det in detections {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == det.class_id && kept.iou(&det) >= iou_threshold);
    if !suppressed {
      result.push(det);
    }
  }
  result
}
