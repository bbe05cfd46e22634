// 该文件是 Wangyue （望月） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入
//!
//! 视频容器文件（mp4/avi/mov/mkv 等）经 `decodebin` 解码，摄像头经 `v4l2src` 采集，
//! 统一转换为 RGB 后由 appsink 拉取。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! appsink 到达 EOS 时返回 [`FrameRead::EndOfStream`]，管道报错时返回读取错误。

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{FrameRead, FrameSource, SourceKind, SourceOpenError, SourceReadError};
use crate::frame::{RGB_CHANNELS, RgbFrame, bgr_to_rgb};

#[derive(Error, Debug)]
pub enum GStreamerSourceError {
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format")]
  UnsupportedFormat,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

impl From<GStreamerSourceError> for SourceOpenError {
  fn from(err: GStreamerSourceError) -> Self {
    SourceOpenError::Backend(err.to_string())
  }
}

enum PipelineItem {
  FileSource(String),
  CameraSource { device: u32 },
  TargetFormat { format: &'static str },
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path.replace('"', "\\\""))
      }
      PipelineItem::CameraSource { device } => {
        format!("v4l2src device=/dev/video{}", device)
      }
      PipelineItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

pub struct GStreamerSource {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  kind: SourceKind,
  index: u64,
  closed: bool,
}

impl GStreamerSource {
  pub fn file(path: &Path) -> Result<Self, GStreamerSourceError> {
    let items = [
      PipelineItem::FileSource(path.display().to_string()),
      PipelineItem::TargetFormat { format: "RGB" },
    ];
    // 文件来源不丢帧，按解码速度拉取
    Self::launch(&items, "appsink name=sink sync=false", SourceKind::VideoFile)
  }

  pub fn camera(device: u32) -> Result<Self, GStreamerSourceError> {
    let items = [
      PipelineItem::CameraSource { device },
      PipelineItem::TargetFormat { format: "RGB" },
    ];
    Self::launch(
      &items,
      "appsink max-buffers=2 drop=true name=sink",
      SourceKind::Webcam,
    )
  }

  fn launch(
    items: &[PipelineItem],
    sink: &str,
    kind: SourceKind,
  ) -> Result<Self, GStreamerSourceError> {
    gst::init()?;

    let basic_pipeline = items
      .iter()
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    let full_pipeline = format!("{} ! {}", basic_pipeline, sink);

    info!("GStreamer 输入管道: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerSourceError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerSourceError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerSourceError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(Self {
      pipeline,
      appsink,
      kind,
      index: 0,
      closed: false,
    })
  }

  /// 取出总线上的第一条错误消息
  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
      if let gst::MessageView::Error(err) = msg.view() {
        return Some(format!("{} ({:?})", err.error(), err.debug()));
      }
    }
    None
  }
}

impl FrameSource for GStreamerSource {
  fn kind(&self) -> SourceKind {
    self.kind
  }

  fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
    if self.closed {
      return Err(SourceReadError::Closed);
    }

    match self.appsink.pull_sample() {
      Ok(sample) => {
        let frame = convert_sample(&sample, self.index)
          .map_err(|e| SourceReadError::Decode(e.to_string()))?;
        self.index += 1;
        Ok(FrameRead::Frame(frame))
      }
      Err(e) => {
        if self.appsink.is_eos() {
          debug!("GStreamer 输入到达流末尾");
          return Ok(FrameRead::EndOfStream);
        }
        let reason = self.bus_error().unwrap_or_else(|| e.to_string());
        Err(SourceReadError::Device(reason))
      }
    }
  }

  fn close(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl Drop for GStreamerSource {
  fn drop(&mut self) {
    self.close();
  }
}

fn convert_sample(sample: &gst::Sample, index: u64) -> Result<RgbFrame, GStreamerSourceError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerSourceError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerSourceError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerSourceError::VideoInfoError)?;

  let width = video_info.width();
  let height = video_info.height();
  let stride = video_info.stride()[0] as usize;
  let row = width as usize * RGB_CHANNELS;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerSourceError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  let expected_size = stride * (height as usize).saturating_sub(1) + row;
  if data.len() < expected_size {
    return Err(GStreamerSourceError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  // 去掉每行末尾的对齐填充
  let packed = data
    .chunks(stride)
    .take(height as usize)
    .flat_map(|line| &line[..row])
    .copied()
    .collect::<Vec<u8>>();

  let frame = match video_info.format() {
    gst_video::VideoFormat::Rgb => RgbFrame::from_raw(width, height, index, packed),
    gst_video::VideoFormat::Bgr => bgr_to_rgb(width, height, index, &packed),
    _ => return Err(GStreamerSourceError::UnsupportedFormat),
  };
  frame.map_err(|e| GStreamerSourceError::PipelineError(e.to_string()))
}
