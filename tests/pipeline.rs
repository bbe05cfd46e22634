// 该文件是 Wangyue （望月） 项目的一部分。
// tests/pipeline.rs - 流水线场景测试
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
  collections::HashMap,
  sync::{Arc, Mutex},
};

use wangyue::{
  control::{Control, PipelineConfig},
  frame::RgbFrame,
  input::{
    FrameRead, FrameSource, RetryingSource, SourceKind, SourceOpenError, SourceOpener,
    SourceReadError, SourceSpec,
  },
  model::{Detection, DetectionSet, EngineCache, InferenceError, Model, ModelId, ModelLoadError},
  output::DisplaySink,
  task::{Pipeline, PipelineState, StopReason},
};

const SIZE: u32 = 64;
const BLACK: [u8; 3] = [0, 0, 0];

type Events = Arc<Mutex<Vec<String>>>;

/// 预设的来源行为：`frames` 为 None 时无限输出，`fail_at` 为单次出错的读取序号，
/// `fail_from` 之后的每次读取都出错。
#[derive(Clone, Copy, Default)]
struct Script {
  frames: Option<u64>,
  fail_at: Option<u64>,
  fail_from: Option<u64>,
}

struct ScriptedSource {
  name: String,
  kind: SourceKind,
  script: Script,
  reads: u64,
  events: Events,
}

impl FrameSource for ScriptedSource {
  fn kind(&self) -> SourceKind {
    self.kind
  }

  fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
    let read = self.reads;
    self.reads += 1;
    if self.script.fail_at == Some(read) || self.script.fail_from.is_some_and(|n| read >= n) {
      return Err(SourceReadError::Device("cable unplugged".to_string()));
    }
    if self.script.frames.is_some_and(|n| read >= n) {
      return Ok(FrameRead::EndOfStream);
    }
    Ok(FrameRead::Frame(RgbFrame::filled(SIZE, SIZE, read, BLACK)))
  }

  fn close(&mut self) {
    self.events.lock().unwrap().push(format!("close {}", self.name));
  }
}

#[derive(Clone, Default)]
struct ScriptedOpener {
  scripts: Vec<(SourceSpec, Script)>,
  events: Events,
}

impl ScriptedOpener {
  fn with(mut self, spec: SourceSpec, script: Script) -> Self {
    self.scripts.push((spec, script));
    self
  }

  fn events(&self) -> Vec<String> {
    self.events.lock().unwrap().clone()
  }
}

impl SourceOpener for ScriptedOpener {
  fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, SourceOpenError> {
    let Some((_, script)) = self.scripts.iter().find(|(s, _)| s == spec) else {
      self.events.lock().unwrap().push(format!("missing {}", spec));
      return Err(SourceOpenError::NotFound(spec.to_string().into()));
    };
    self.events.lock().unwrap().push(format!("open {}", spec));
    let source = ScriptedSource {
      name: spec.to_string(),
      kind: spec.kind(),
      script: *script,
      reads: 0,
      events: self.events.clone(),
    };
    match spec.kind() {
      SourceKind::Webcam => Ok(Box::new(RetryingSource::new(source, WEBCAM_RETRIES))),
      SourceKind::VideoFile => Ok(Box::new(source)),
    }
  }
}

/// 摄像头来源与默认打开器一样包一层重试
const WEBCAM_RETRIES: u32 = 3;

/// 按帧序号返回预设检测结果，`fail_on` 中的帧推理失败。
#[derive(Default)]
struct ScriptedModel {
  hits: HashMap<u64, Vec<Detection>>,
  fail_on: Vec<u64>,
}

impl Model for ScriptedModel {
  fn name(&self) -> &str {
    "scripted"
  }

  fn infer(&self, frame: &RgbFrame, _threshold: f32) -> Result<DetectionSet, InferenceError> {
    if self.fail_on.contains(&frame.index()) {
      return Err(InferenceError::Backend("device lost".to_string()));
    }
    Ok(DetectionSet::from(
      self.hits.get(&frame.index()).cloned().unwrap_or_default(),
    ))
  }
}

fn engines(
  model: impl Fn() -> ScriptedModel,
) -> EngineCache<impl Fn(&ModelId) -> Result<Box<dyn Model>, ModelLoadError>> {
  EngineCache::new(move |_: &ModelId| -> Result<Box<dyn Model>, ModelLoadError> {
    Ok(Box::new(model()))
  })
}

struct Delivered {
  frame: RgbFrame,
  fps: f64,
  status: Option<String>,
}

type Action = Box<dyn FnMut(usize, &Control)>;

#[derive(Default)]
struct RecordingSink {
  delivered: Vec<Delivered>,
  reports: Vec<String>,
  control: Option<Arc<Control>>,
  on_deliver: Option<Action>,
}

impl RecordingSink {
  fn acting(control: &Arc<Control>, action: impl FnMut(usize, &Control) + 'static) -> Self {
    Self {
      control: Some(control.clone()),
      on_deliver: Some(Box::new(action)),
      ..Default::default()
    }
  }

  fn indices(&self) -> Vec<u64> {
    self.delivered.iter().map(|d| d.frame.index()).collect()
  }
}

impl DisplaySink for RecordingSink {
  fn deliver(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>) {
    self.delivered.push(Delivered {
      frame: frame.clone(),
      fps,
      status: status.map(str::to_string),
    });
    if let (Some(control), Some(action)) = (self.control.as_ref(), self.on_deliver.as_mut()) {
      action(self.delivered.len(), control.as_ref());
    }
  }

  fn report(&mut self, status: &str) {
    self.reports.push(status.to_string());
  }
}

fn clip(name: &str) -> SourceSpec {
  SourceSpec::video_file(name)
}

fn control_for(spec: SourceSpec) -> Arc<Control> {
  Arc::new(Control::new(
    PipelineConfig::new("weights/best.onnx", spec).with_confidence(0.4),
  ))
}

fn is_black(frame: &RgbFrame) -> bool {
  (0..frame.height()).all(|y| (0..frame.width()).all(|x| frame.pixel(x, y) == Some(BLACK)))
}

#[test]
fn annotates_only_frames_with_detections() {
  let opener = ScriptedOpener::default().with(
    clip("a.mp4"),
    Script {
      frames: Some(10),
      ..Default::default()
    },
  );
  let engines = engines(|| {
    let mut model = ScriptedModel::default();
    model.hits.insert(3, vec![Detection::new(0, 0.9, [8.0, 8.0, 40.0, 40.0])]);
    model.hits.insert(5, vec![Detection::new(2, 0.2, [8.0, 8.0, 40.0, 40.0])]);
    model.hits.insert(7, vec![Detection::new(16, 0.75, [20.0, 20.0, 56.0, 56.0])]);
    model
  });
  let control = control_for(clip("a.mp4"));
  let mut pipeline = Pipeline::new(engines, opener.clone(), control);
  let mut sink = RecordingSink::default();

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.state, PipelineState::Stopped(StopReason::EndOfStream));
  assert_eq!(report.frames_delivered, 10);
  assert_eq!(report.inference_failures, 0);
  assert_eq!(sink.indices(), (0..10).collect::<Vec<_>>());
  for delivered in &sink.delivered {
    let index = delivered.frame.index();
    let annotated = !is_black(&delivered.frame);
    assert_eq!(annotated, index == 3 || index == 7, "frame {index}");
    assert!(delivered.fps.is_finite() && delivered.fps >= 0.0);
    assert!(delivered.status.is_none());
  }
  assert_eq!(sink.delivered[0].fps, 0.0);
  assert_eq!(sink.reports.len(), 1);
  assert_eq!(opener.events(), vec!["open a.mp4", "close a.mp4"]);
}

#[test]
fn read_error_stops_after_delivered_frames() {
  let opener = ScriptedOpener::default().with(
    clip("a.mp4"),
    Script {
      fail_at: Some(4),
      ..Default::default()
    },
  );
  let mut pipeline = Pipeline::new(
    engines(ScriptedModel::default),
    opener.clone(),
    control_for(clip("a.mp4")),
  );
  let mut sink = RecordingSink::default();

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.frames_delivered, 4);
  assert_eq!(sink.indices(), vec![0, 1, 2, 3]);
  assert!(matches!(
    report.state,
    PipelineState::Stopped(StopReason::SourceFailure(_))
  ));
  let closes = opener
    .events()
    .iter()
    .filter(|e| e.starts_with("close"))
    .count();
  assert_eq!(closes, 1);
  assert_eq!(sink.reports.len(), 1);
}

#[test]
fn model_load_failure_processes_nothing() {
  let opener = ScriptedOpener::default().with(clip("a.mp4"), Script::default());
  let engines = EngineCache::new(|id: &ModelId| -> Result<Box<dyn Model>, ModelLoadError> {
    Err(ModelLoadError::NotFound(id.as_path().to_path_buf()))
  });
  let mut pipeline = Pipeline::new(engines, opener.clone(), control_for(clip("a.mp4")));
  let mut sink = RecordingSink::default();

  let report = pipeline.run(&mut sink).unwrap();

  assert!(matches!(report.state, PipelineState::Failed(_)));
  assert_eq!(report.frames_delivered, 0);
  assert!(sink.delivered.is_empty());
  assert!(opener.events().is_empty());
  assert_eq!(sink.reports.len(), 1);
}

#[test]
fn open_failure_leaves_pipeline_idle() {
  let opener = ScriptedOpener::default();
  let mut pipeline = Pipeline::new(
    engines(ScriptedModel::default),
    opener,
    control_for(clip("missing.mp4")),
  );
  let mut sink = RecordingSink::default();

  let err = pipeline.run(&mut sink).unwrap_err();

  assert!(matches!(err, SourceOpenError::NotFound(_)));
  assert_eq!(*pipeline.state(), PipelineState::Idle);
  assert!(sink.delivered.is_empty());
  assert_eq!(sink.reports.len(), 1);
}

#[test]
fn stop_command_ends_at_next_iteration() {
  let opener = ScriptedOpener::default().with(clip("live"), Script::default());
  let control = control_for(clip("live"));
  let mut pipeline = Pipeline::new(engines(ScriptedModel::default), opener.clone(), control.clone());
  let mut sink = RecordingSink::acting(&control, |delivered, control| {
    if delivered == 3 {
      control.request_stop();
    }
  });

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.state, PipelineState::Stopped(StopReason::StopCommand));
  assert_eq!(report.frames_delivered, 3);
  assert_eq!(opener.events(), vec!["open live", "close live"]);
}

#[test]
fn inference_failure_delivers_raw_frame() {
  let opener = ScriptedOpener::default().with(
    clip("a.mp4"),
    Script {
      frames: Some(4),
      ..Default::default()
    },
  );
  let engines = engines(|| ScriptedModel {
    hits: HashMap::from([(2, vec![Detection::new(0, 0.9, [8.0, 8.0, 40.0, 40.0])])]),
    fail_on: vec![2],
  });
  let mut pipeline = Pipeline::new(engines, opener, control_for(clip("a.mp4")));
  let mut sink = RecordingSink::default();

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.state, PipelineState::Stopped(StopReason::EndOfStream));
  assert_eq!(report.frames_delivered, 4);
  assert_eq!(report.inference_failures, 1);
  let failed = &sink.delivered[2];
  assert!(is_black(&failed.frame));
  assert!(failed.status.as_deref().is_some_and(|s| s.contains("device lost")));
  assert!(sink.delivered[3].status.is_none());
}

#[test]
fn switching_source_closes_old_before_opening_new() {
  let opener = ScriptedOpener::default()
    .with(clip("a.mp4"), Script::default())
    .with(
      clip("b.mp4"),
      Script {
        frames: Some(3),
        ..Default::default()
      },
    );
  let control = control_for(clip("a.mp4"));
  let mut pipeline = Pipeline::new(engines(ScriptedModel::default), opener.clone(), control.clone());
  let mut sink = RecordingSink::acting(&control, |delivered, control| {
    if delivered == 2 {
      control.switch_source(clip("b.mp4"));
    }
  });

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.state, PipelineState::Stopped(StopReason::EndOfStream));
  assert_eq!(sink.indices(), vec![0, 1, 0, 1, 2]);
  assert_eq!(
    opener.events(),
    vec!["open a.mp4", "close a.mp4", "open b.mp4", "close b.mp4"]
  );
  // 新来源的第一帧没有参照时刻
  assert_eq!(sink.delivered[2].fps, 0.0);
}

#[test]
fn failed_switch_stops_pipeline() {
  let opener = ScriptedOpener::default().with(clip("a.mp4"), Script::default());
  let control = control_for(clip("a.mp4"));
  let mut pipeline = Pipeline::new(engines(ScriptedModel::default), opener.clone(), control.clone());
  let mut sink = RecordingSink::acting(&control, |delivered, control| {
    if delivered == 1 {
      control.switch_source(clip("gone.mp4"));
    }
  });

  let report = pipeline.run(&mut sink).unwrap();

  assert!(matches!(
    report.state,
    PipelineState::Stopped(StopReason::SwitchFailed(_))
  ));
  assert_eq!(report.frames_delivered, 1);
  assert_eq!(
    opener.events(),
    vec!["open a.mp4", "close a.mp4", "missing gone.mp4"]
  );
}

#[test]
fn frame_limit_is_honoured() {
  let opener = ScriptedOpener::default().with(clip("live"), Script::default());
  let mut pipeline = Pipeline::new(
    engines(ScriptedModel::default),
    opener,
    control_for(clip("live")),
  )
  .with_max_frames(Some(4));
  let mut sink = RecordingSink::default();

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.state, PipelineState::Stopped(StopReason::FrameLimit));
  assert_eq!(report.frames_delivered, 4);
}

#[test]
fn threshold_changes_apply_to_next_frame() {
  let opener = ScriptedOpener::default().with(
    clip("a.mp4"),
    Script {
      frames: Some(4),
      ..Default::default()
    },
  );
  let engines = engines(|| ScriptedModel {
    hits: (0..4)
      .map(|i| (i, vec![Detection::new(0, 0.6, [8.0, 8.0, 40.0, 40.0])]))
      .collect(),
    fail_on: Vec::new(),
  });
  let control = control_for(clip("a.mp4"));
  let mut pipeline = Pipeline::new(engines, opener, control.clone());
  let mut sink = RecordingSink::acting(&control, |delivered, control| {
    if delivered == 2 {
      control.set_confidence(0.8);
    }
  });

  pipeline.run(&mut sink).unwrap();

  let annotated: Vec<bool> = sink.delivered.iter().map(|d| !is_black(&d.frame)).collect();
  assert_eq!(annotated, vec![true, true, false, false]);
}

#[test]
fn webcam_stops_after_consecutive_read_failures() {
  let camera = SourceSpec::webcam(0);
  let opener = ScriptedOpener::default().with(
    camera.clone(),
    Script {
      fail_from: Some(4),
      ..Default::default()
    },
  );
  let mut pipeline = Pipeline::new(
    engines(ScriptedModel::default),
    opener.clone(),
    control_for(camera),
  );
  let mut sink = RecordingSink::default();

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.frames_delivered, 4);
  assert_eq!(sink.indices(), vec![0, 1, 2, 3]);
  match &report.state {
    PipelineState::Stopped(StopReason::SourceFailure(reason)) => {
      assert!(reason.contains("cable unplugged"), "{reason}");
    }
    other => panic!("unexpected state: {other:?}"),
  }
  assert_eq!(opener.events(), vec!["open camera://0", "close camera://0"]);
}

#[test]
fn webcam_absorbs_a_transient_read_failure() {
  let camera = SourceSpec::webcam(1);
  let opener = ScriptedOpener::default().with(
    camera.clone(),
    Script {
      fail_at: Some(2),
      ..Default::default()
    },
  );
  let mut pipeline = Pipeline::new(
    engines(ScriptedModel::default),
    opener,
    control_for(camera),
  )
  .with_max_frames(Some(5));
  let mut sink = RecordingSink::default();

  let report = pipeline.run(&mut sink).unwrap();

  assert_eq!(report.state, PipelineState::Stopped(StopReason::FrameLimit));
  // 失败的那次读取不产生帧
  assert_eq!(sink.indices(), vec![0, 1, 3, 4, 5]);
}
