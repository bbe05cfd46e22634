// 该文件是 Wangyue （望月） 项目的一部分。
// src/task.rs - 检测流水线
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

//! # 检测流水线
//!
//! 状态机：`Idle → Running → (Stopped | Failed)`。
//!
//! 每次迭代：读取控制快照 → 检查停止 → 按需切换来源 → 取帧 → 推理 → 标注 →
//! 计算帧率 → 交给显示端。停止与切换只在迭代边界生效，正在处理的帧不会被打断。

use std::{fmt, sync::Arc, time::Instant};

use tracing::{debug, error, info, warn};

use crate::{
  control::Control,
  input::{DefaultOpener, FrameRead, FrameSource, SourceGuard, SourceOpenError, SourceOpener},
  model::{BackendLoader, EngineCache, ModelLoader},
  output::{Annotator, DisplaySink},
  throughput::ThroughputTracker,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
  /// 外部停止命令
  StopCommand,
  /// 视频文件读完
  EndOfStream,
  /// 来源读取出现终止性错误
  SourceFailure(String),
  /// 达到帧数上限
  FrameLimit,
  /// 切换来源时新来源打开失败
  SwitchFailed(String),
}

impl fmt::Display for StopReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StopReason::StopCommand => f.write_str("收到停止命令"),
      StopReason::EndOfStream => f.write_str("视频播放结束"),
      StopReason::SourceFailure(e) => write!(f, "来源读取失败: {}", e),
      StopReason::FrameLimit => f.write_str("达到指定帧数"),
      StopReason::SwitchFailed(e) => write!(f, "切换来源失败: {}", e),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
  Idle,
  Running,
  Stopped(StopReason),
  Failed(String),
}

impl PipelineState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, PipelineState::Stopped(_) | PipelineState::Failed(_))
  }
}

impl fmt::Display for PipelineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PipelineState::Idle => f.write_str("空闲"),
      PipelineState::Running => f.write_str("运行中"),
      PipelineState::Stopped(reason) => write!(f, "已停止（{}）", reason),
      PipelineState::Failed(e) => write!(f, "失败（{}）", e),
    }
  }
}

/// 一次运行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
  pub state: PipelineState,
  pub frames_delivered: u64,
  pub inference_failures: u64,
}

pub struct Pipeline<L = BackendLoader, O = DefaultOpener> {
  engines: EngineCache<L>,
  opener: O,
  control: Arc<Control>,
  annotator: Annotator,
  max_frames: Option<u64>,
  state: PipelineState,
}

impl<L: ModelLoader, O: SourceOpener> Pipeline<L, O> {
  pub fn new(engines: EngineCache<L>, opener: O, control: Arc<Control>) -> Self {
    Self {
      engines,
      opener,
      control,
      annotator: Annotator::default(),
      max_frames: None,
      state: PipelineState::Idle,
    }
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.annotator = annotator;
    self
  }

  pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
    self.max_frames = max_frames;
    self
  }

  pub fn state(&self) -> &PipelineState {
    &self.state
  }

  pub fn control(&self) -> &Arc<Control> {
    &self.control
  }

  pub fn engines(&self) -> &EngineCache<L> {
    &self.engines
  }

  /// 运行一次流水线，直到停止或失败。
  ///
  /// 模型加载失败时状态为 `Failed`，不读取任何帧；
  /// 来源打开失败时状态保持 `Idle` 并返回错误。
  /// 停止标志不会被自动清除，重新启动前由调用方调用 [`Control::clear_stop`]。
  pub fn run<S: DisplaySink + ?Sized>(
    &mut self,
    sink: &mut S,
  ) -> Result<RunReport, SourceOpenError> {
    self.state = PipelineState::Idle;

    let model_id = self.control.model();
    let engine = match self.engines.load(&model_id) {
      Ok(engine) => engine,
      Err(e) => {
        error!("模型加载失败: {}", e);
        self.state = PipelineState::Failed(e.to_string());
        sink.report(&self.state.to_string());
        return Ok(RunReport {
          state: self.state.clone(),
          frames_delivered: 0,
          inference_failures: 0,
        });
      }
    };

    let spec = self.control.source();
    let source = match self.opener.open(&spec) {
      Ok(source) => source,
      Err(e) => {
        error!("无法打开来源 {}: {}", spec, e);
        sink.report(&format!("无法打开来源 {}: {}", spec, e));
        return Err(e);
      }
    };

    info!("开始任务，模型: {}，{}来源: {}", model_id, source.kind(), spec);
    self.state = PipelineState::Running;

    let mut source = Some(SourceGuard::new(spec, source));
    let mut tracker = ThroughputTracker::new();
    let mut frames_delivered = 0u64;
    let mut inference_failures = 0u64;

    let reason = loop {
      let snapshot = self.control.snapshot();
      if snapshot.stop {
        warn!("停止命令生效，退出任务循环");
        break StopReason::StopCommand;
      }

      if source.as_ref().is_none_or(|s| *s.spec() != snapshot.source) {
        // 先关闭旧来源，再打开新来源
        if let Some(old) = source.take() {
          info!("切换来源: {} -> {}", old.spec(), snapshot.source);
        }
        match self.opener.open(&snapshot.source) {
          Ok(opened) => {
            info!("已打开{}来源: {}", opened.kind(), snapshot.source);
            tracker.reset();
            source = Some(SourceGuard::new(snapshot.source.clone(), opened));
          }
          Err(e) => {
            error!("无法打开新来源 {}: {}", snapshot.source, e);
            break StopReason::SwitchFailed(e.to_string());
          }
        }
      }
      let Some(current) = source.as_mut() else {
        break StopReason::SourceFailure("来源未打开".to_string());
      };

      let frame = match current.next_frame() {
        Ok(FrameRead::Frame(frame)) => frame,
        Ok(FrameRead::EndOfStream) => {
          info!("来源已读完");
          break StopReason::EndOfStream;
        }
        Err(e) => {
          error!("读取帧失败: {}", e);
          break StopReason::SourceFailure(e.to_string());
        }
      };

      let now = Instant::now();
      let (annotated, status) = match engine.infer(&frame, snapshot.confidence) {
        Ok(detections) => (self.annotator.annotate(&frame, &detections), None),
        Err(e) => {
          warn!("第 {} 帧推理失败: {}", frame.index(), e);
          inference_failures += 1;
          (frame, Some(format!("推理失败: {}", e)))
        }
      };
      let fps = tracker.tick();
      debug!("第 {} 帧处理完成，耗时: {:.2?}", annotated.index(), now.elapsed());

      sink.deliver(&annotated, fps, status.as_deref());
      frames_delivered += 1;

      if self.max_frames.is_some_and(|n| frames_delivered >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frames_delivered);
        break StopReason::FrameLimit;
      }
    };

    // 在通知显示端之前关闭来源
    drop(source);

    self.state = PipelineState::Stopped(reason);
    info!(
      "任务结束: {}，输出 {} 帧，推理失败 {} 次",
      self.state, frames_delivered, inference_failures
    );
    sink.report(&self.state.to_string());

    Ok(RunReport {
      state: self.state.clone(),
      frames_delivered,
      inference_failures,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    control::PipelineConfig,
    frame::RgbFrame,
    input::{SourceKind, SourceReadError, SourceSpec},
    model::{DetectionSet, InferenceError, Model, ModelId, ModelLoadError},
  };

  struct Empty;

  impl Model for Empty {
    fn name(&self) -> &str {
      "empty"
    }

    fn infer(&self, _frame: &RgbFrame, _threshold: f32) -> Result<DetectionSet, InferenceError> {
      Ok(DetectionSet::empty())
    }
  }

  struct Counting(u64);

  impl FrameSource for Counting {
    fn kind(&self) -> SourceKind {
      SourceKind::VideoFile
    }

    fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
      if self.0 == 0 {
        return Ok(FrameRead::EndOfStream);
      }
      self.0 -= 1;
      Ok(FrameRead::Frame(RgbFrame::filled(4, 4, self.0, [0, 0, 0])))
    }

    fn close(&mut self) {}
  }

  #[derive(Default)]
  struct Reports(Vec<String>);

  impl DisplaySink for Reports {
    fn deliver(&mut self, _frame: &RgbFrame, _fps: f64, _status: Option<&str>) {}

    fn report(&mut self, status: &str) {
      self.0.push(status.to_string());
    }
  }

  fn control() -> Arc<Control> {
    Arc::new(Control::new(PipelineConfig::new(
      "model.onnx",
      SourceSpec::video_file("clip.mp4"),
    )))
  }

  fn counting(_: &SourceSpec) -> Result<Box<dyn FrameSource>, SourceOpenError> {
    Ok(Box::new(Counting(3)))
  }

  #[test]
  fn reaches_end_of_stream() {
    let engines = EngineCache::new(|_: &ModelId| -> Result<Box<dyn Model>, ModelLoadError> {
      Ok(Box::new(Empty))
    });
    let mut pipeline = Pipeline::new(engines, counting, control());
    let mut sink = Reports::default();

    let report = pipeline.run(&mut sink).unwrap();
    assert_eq!(report.state, PipelineState::Stopped(StopReason::EndOfStream));
    assert_eq!(report.frames_delivered, 3);
    assert!(pipeline.state().is_terminal());
    assert_eq!(sink.0, vec![report.state.to_string()]);
  }

  #[test]
  fn engine_is_reused_across_runs() {
    let engines = EngineCache::new(|_: &ModelId| -> Result<Box<dyn Model>, ModelLoadError> {
      Ok(Box::new(Empty))
    });
    let mut pipeline = Pipeline::new(engines, counting, control());
    let mut sink = Reports::default();

    pipeline.run(&mut sink).unwrap();
    pipeline.run(&mut sink).unwrap();
    assert_eq!(pipeline.engines().len(), 1);
    assert_eq!(sink.0.len(), 2);
  }

  #[test]
  fn stop_reasons_are_readable() {
    assert_eq!(StopReason::FrameLimit.to_string(), "达到指定帧数");
    assert!(
      PipelineState::Failed("模型文件不存在".into())
        .to_string()
        .contains("模型文件不存在")
    );
    assert!(!PipelineState::Running.is_terminal());
  }
}
