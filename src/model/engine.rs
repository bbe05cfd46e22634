// 该文件是 Wangyue （望月） 项目的一部分。
// src/model/engine.rs - 推理引擎句柄与模型缓存
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

use std::{collections::HashMap, fmt, sync::Arc, time::Instant};

use tracing::{debug, info, warn};

use crate::frame::RgbFrame;

use super::{
  DEFAULT_NMS_THRESHOLD, DetectionSet, InferenceError, Model, ModelId, ModelLoadError,
  clamp_threshold,
};

/// 已加载模型的句柄。
///
/// 克隆只复制引用计数；底层模型在整个进程中保持不变。
#[derive(Clone)]
pub struct Engine {
  id: ModelId,
  model: Arc<dyn Model>,
}

impl fmt::Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Engine")
      .field("id", &self.id)
      .field("backend", &self.model.name())
      .finish()
  }
}

impl Engine {
  pub fn new(id: ModelId, model: Box<dyn Model>) -> Self {
    Self {
      id,
      model: Arc::from(model),
    }
  }

  pub fn id(&self) -> &ModelId {
    &self.id
  }

  pub fn backend(&self) -> &str {
    self.model.name()
  }

  /// 执行推理。阈值先限制到 [0, 1]，再对后端结果做一次过滤，
  /// 返回的每个检测结果置信度都不低于阈值。
  pub fn infer(&self, frame: &RgbFrame, threshold: f32) -> Result<DetectionSet, InferenceError> {
    let threshold = clamp_threshold(threshold);
    let now = Instant::now();
    let raw = self.model.infer(frame, threshold)?;
    let total = raw.len();
    let kept = raw.above(threshold);
    debug!(
      "第 {} 帧推理完成，耗时: {:.2?}，检测到 {} 个对象（过滤 {} 个）",
      frame.index(),
      now.elapsed(),
      kept.len(),
      total - kept.len()
    );
    Ok(kept)
  }
}

/// 按模型标识创建模型实例。
pub trait ModelLoader {
  fn load(&self, id: &ModelId) -> Result<Box<dyn Model>, ModelLoadError>;
}

impl<F> ModelLoader for F
where
  F: Fn(&ModelId) -> Result<Box<dyn Model>, ModelLoadError>,
{
  fn load(&self, id: &ModelId) -> Result<Box<dyn Model>, ModelLoadError> {
    self(id)
  }
}

/// 根据模型文件扩展名选择推理后端。
///
/// - `.onnx`：tract ONNX 推理（`model_onnx` 特性）
/// - `.rknn`：RKNPU 上的 YOLO26（`model_yolo26` 特性）
#[derive(Debug, Clone)]
pub struct BackendLoader {
  nms_threshold: f32,
}

impl Default for BackendLoader {
  fn default() -> Self {
    Self {
      nms_threshold: DEFAULT_NMS_THRESHOLD,
    }
  }
}

impl BackendLoader {
  pub fn with_nms_threshold(mut self, nms_threshold: f32) -> Self {
    self.nms_threshold = nms_threshold.clamp(0.0, 1.0);
    self
  }
}

impl ModelLoader for BackendLoader {
  fn load(&self, id: &ModelId) -> Result<Box<dyn Model>, ModelLoadError> {
    let path = id.as_path();
    let extension = id
      .extension()
      .ok_or_else(|| ModelLoadError::UnsupportedFormat(id.to_string()))?;

    match extension.as_str() {
      "onnx" => {
        #[cfg(feature = "model_onnx")]
        {
          if !path.is_file() {
            return Err(ModelLoadError::NotFound(path.to_path_buf()));
          }
          let model = super::OnnxYolo::load(path, self.nms_threshold)?;
          Ok(Box::new(model))
        }
        #[cfg(not(feature = "model_onnx"))]
        {
          let _ = path;
          Err(ModelLoadError::BackendDisabled {
            format: "onnx".to_string(),
            feature: "model_onnx",
          })
        }
      }
      "rknn" => {
        #[cfg(feature = "model_yolo26")]
        {
          if !path.is_file() {
            return Err(ModelLoadError::NotFound(path.to_path_buf()));
          }
          let model = super::Yolo26Builder::new(path)
            .nms_threshold(self.nms_threshold)
            .build()?;
          Ok(Box::new(model))
        }
        #[cfg(not(feature = "model_yolo26"))]
        {
          let _ = path;
          Err(ModelLoadError::BackendDisabled {
            format: "rknn".to_string(),
            feature: "model_yolo26",
          })
        }
      }
      other => Err(ModelLoadError::UnsupportedFormat(other.to_string())),
    }
  }
}

/// 以模型标识为键的引擎缓存，由程序入口持有。
///
/// 每个标识只加载一次；加载失败不会写入缓存。
pub struct EngineCache<L = BackendLoader> {
  loader: L,
  engines: HashMap<ModelId, Engine>,
}

impl Default for EngineCache<BackendLoader> {
  fn default() -> Self {
    Self::new(BackendLoader::default())
  }
}

impl<L: ModelLoader> EngineCache<L> {
  pub fn new(loader: L) -> Self {
    Self {
      loader,
      engines: HashMap::new(),
    }
  }

  pub fn load(&mut self, id: &ModelId) -> Result<Engine, ModelLoadError> {
    if let Some(engine) = self.engines.get(id) {
      debug!("复用已加载的模型: {}", id);
      return Ok(engine.clone());
    }

    info!("加载模型文件: {}", id);
    let now = Instant::now();
    let model = self.loader.load(id).inspect_err(|e| {
      warn!("模型 {} 加载失败: {}", id, e);
    })?;
    let engine = Engine::new(id.clone(), model);
    info!(
      "模型加载完成，后端: {}，耗时: {:.2?}",
      engine.backend(),
      now.elapsed()
    );

    self.engines.insert(id.clone(), engine.clone());
    Ok(engine)
  }

  pub fn contains(&self, id: &ModelId) -> bool {
    self.engines.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.engines.len()
  }

  pub fn is_empty(&self) -> bool {
    self.engines.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::model::Detection;

  struct Fixed(Vec<Detection>);

  impl Model for Fixed {
    fn name(&self) -> &str {
      "fixed"
    }

    fn infer(&self, _frame: &RgbFrame, _threshold: f32) -> Result<DetectionSet, InferenceError> {
      Ok(DetectionSet::from(self.0.clone()))
    }
  }

  fn scores() -> Vec<Detection> {
    [0.0, 0.05, 0.3, 0.4, 0.41, 0.75, 0.99, 1.0]
      .iter()
      .enumerate()
      .map(|(i, &s)| Detection::new(i as u32, s, [0.0, 0.0, 4.0, 4.0]))
      .collect()
  }

  #[test]
  fn every_result_meets_threshold() {
    let engine = Engine::new(ModelId::from("fixed"), Box::new(Fixed(scores())));
    let frame = RgbFrame::filled(8, 8, 0, [0, 0, 0]);
    for step in 0..=20 {
      let t = step as f32 / 20.0;
      let set = engine.infer(&frame, t).unwrap();
      assert!(set.iter().all(|d| d.confidence >= t), "threshold {t}");
    }
  }

  #[test]
  fn out_of_range_threshold_is_clamped() {
    let engine = Engine::new(ModelId::from("fixed"), Box::new(Fixed(scores())));
    let frame = RgbFrame::filled(8, 8, 0, [0, 0, 0]);
    assert_eq!(engine.infer(&frame, -1.0).unwrap().len(), 8);
    let top = engine.infer(&frame, 7.0).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top.as_slice()[0].confidence, 1.0);
  }

  #[test]
  fn cache_loads_each_id_once() {
    let calls = AtomicUsize::new(0);
    let loader = |_: &ModelId| -> Result<Box<dyn Model>, ModelLoadError> {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(Box::new(Fixed(Vec::new())))
    };
    let mut cache = EngineCache::new(loader);

    let a = ModelId::from("a.onnx");
    let b = ModelId::from("b.onnx");
    cache.load(&a).unwrap();
    cache.load(&a).unwrap();
    cache.load(&b).unwrap();
    cache.load(&a).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn failed_load_is_not_cached() {
    let mut cache =
      EngineCache::new(|id: &ModelId| -> Result<Box<dyn Model>, ModelLoadError> {
        Err(ModelLoadError::NotFound(id.as_path().to_path_buf()))
      });
    let id = ModelId::from("missing.onnx");
    assert!(matches!(cache.load(&id), Err(ModelLoadError::NotFound(_))));
    assert!(!cache.contains(&id));
  }

  #[test]
  fn unknown_extension_is_unsupported() {
    let loader = BackendLoader::default();
    let err = loader.load(&ModelId::from("weights.bin")).err().unwrap();
    assert!(matches!(err, ModelLoadError::UnsupportedFormat(ext) if ext == "bin"));
    let err = loader.load(&ModelId::from("yolov8n")).err().unwrap();
    assert!(matches!(err, ModelLoadError::UnsupportedFormat(_)));
  }
}
