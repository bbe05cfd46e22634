// 该文件是 Wangyue （望月） 项目的一部分。
// src/control.rs - 运行时控制
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

//! # 运行时控制
//!
//! 流水线在每次迭代开始时读取一次快照，外部修改最多延迟一帧生效。

use std::sync::{
  Mutex, MutexGuard,
  atomic::{AtomicBool, AtomicU32, Ordering},
};

use tracing::info;

use crate::{input::SourceSpec, model::ModelId, model::clamp_threshold};

/// 默认置信度阈值
pub const DEFAULT_CONFIDENCE: f32 = 0.4;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
  pub model: ModelId,
  pub confidence: f32,
  pub source: SourceSpec,
}

impl PipelineConfig {
  pub fn new(model: impl Into<ModelId>, source: SourceSpec) -> Self {
    Self {
      model: model.into(),
      confidence: DEFAULT_CONFIDENCE,
      source,
    }
  }

  pub fn with_confidence(mut self, confidence: f32) -> Self {
    self.confidence = clamp_threshold(confidence);
    self
  }
}

/// 一次迭代看到的配置
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub confidence: f32,
  pub source: SourceSpec,
  pub stop: bool,
}

/// 外部与流水线共享的控制面，通常放在 `Arc` 中。
#[derive(Debug)]
pub struct Control {
  confidence: AtomicU32,
  stop: AtomicBool,
  model: Mutex<ModelId>,
  source: Mutex<SourceSpec>,
}

impl Control {
  pub fn new(config: PipelineConfig) -> Self {
    Self {
      confidence: AtomicU32::new(clamp_threshold(config.confidence).to_bits()),
      stop: AtomicBool::new(false),
      model: Mutex::new(config.model),
      source: Mutex::new(config.source),
    }
  }

  pub fn confidence(&self) -> f32 {
    f32::from_bits(self.confidence.load(Ordering::Acquire))
  }

  /// 设置置信度阈值，超出 [0, 1] 的值被截断
  pub fn set_confidence(&self, confidence: f32) {
    let confidence = clamp_threshold(confidence);
    self.confidence.store(confidence.to_bits(), Ordering::Release);
  }

  pub fn request_stop(&self) {
    info!("收到停止请求");
    self.stop.store(true, Ordering::Release);
  }

  pub fn clear_stop(&self) {
    self.stop.store(false, Ordering::Release);
  }

  pub fn stop_requested(&self) -> bool {
    self.stop.load(Ordering::Acquire)
  }

  pub fn model(&self) -> ModelId {
    lock(&self.model).clone()
  }

  /// 新模型在下一次启动时生效
  pub fn set_model(&self, model: impl Into<ModelId>) {
    *lock(&self.model) = model.into();
  }

  pub fn source(&self) -> SourceSpec {
    lock(&self.source).clone()
  }

  /// 切换来源，流水线在下一次迭代边界关闭旧来源再打开新来源
  pub fn switch_source(&self, source: SourceSpec) {
    info!("请求切换来源: {}", source);
    *lock(&self.source) = source;
  }

  pub fn snapshot(&self) -> Snapshot {
    Snapshot {
      confidence: self.confidence(),
      source: self.source(),
      stop: self.stop_requested(),
    }
  }

  pub fn config(&self) -> PipelineConfig {
    PipelineConfig {
      model: self.model(),
      confidence: self.confidence(),
      source: self.source(),
    }
  }
}

// 持锁期间不会 panic，中毒时直接取回数据
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
