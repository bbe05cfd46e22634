// 该文件是 Wangyue （望月） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频输出
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

//! # GStreamer 视频输出
//!
//! - `gst://display`：实时窗口（`autovideosink`）
//! - `gst:///output.mp4?fps=30`：编码保存为文件，支持 mp4/mkv/avi/webm
//!
//! 管道在收到第一帧时按帧尺寸创建；尺寸变化（例如切换来源）时重建管道。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{AsNhwcFrame, RgbFrame},
  output::{DisplaySink, draw::Annotator, hud_text},
};

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Buffer creation error")]
  BufferCreationError,
}

const DISPLAY_HOST: &str = "display";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
  Display,
  File(String),
}

impl Target {
  fn sink_pipeline(&self) -> String {
    match self {
      Target::Display => "videoconvert ! autovideosink sync=false".to_string(),
      Target::File(path) => {
        let location = path.replace('"', "\\\"");
        if path.ends_with(".mkv") {
          format!(
            "videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux ! filesink location=\"{}\"",
            location
          )
        } else if path.ends_with(".avi") {
          format!(
            "videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux ! filesink location=\"{}\"",
            location
          )
        } else if path.ends_with(".webm") {
          format!(
            "videoconvert ! vp8enc ! webmmux ! filesink location=\"{}\"",
            location
          )
        } else {
          format!(
            "videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux ! filesink location=\"{}\"",
            location
          )
        }
      }
    }
  }
}

struct Running {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  width: u32,
  height: u32,
}

impl Running {
  fn finish(self) {
    // 发送 EOS 让复用器写完文件尾
    let _ = self.appsrc.end_of_stream();
    if let Some(bus) = self.pipeline.bus() {
      let _ = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(2),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
    }
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }
  }
}

pub struct GStreamerVideoOutput {
  target: Target,
  fps: i32,
  hud: bool,
  overlay: Annotator,
  running: Option<Running>,
  frame_count: u64,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    gst::init()?;

    let query: HashMap<_, _> = url.query_pairs().collect();
    let fps: i32 = query
      .get("fps")
      .and_then(|v| v.parse().ok())
      .unwrap_or(30)
      .max(1);
    let target = match url.host_str() {
      Some(DISPLAY_HOST) => Target::Display,
      _ if !url.path().is_empty() && url.path() != "/" => Target::File(url.path().to_string()),
      _ => return Err(GStreamerVideoOutputError::SchemeMismatch),
    };
    // 显示窗口默认叠加帧率
    let hud = query
      .get("hud")
      .map(|v| v != "false")
      .unwrap_or(target == Target::Display);

    info!("GStreamer 输出: {:?} @ {} fps", target, fps);

    Ok(Self {
      target,
      fps,
      hud,
      overlay: Annotator::default(),
      running: None,
      frame_count: 0,
    })
  }
}

impl GStreamerVideoOutput {
  fn start(&self, width: u32, height: u32) -> Result<Running, GStreamerVideoOutputError> {
    let pipeline_desc = format!("appsrc name=src ! {}", self.target.sink_pipeline());
    info!("Creating video output pipeline: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(self.fps, 1))
      .build();

    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;

    info!("Video output initialized: {}x{} @ {} fps", width, height, self.fps);
    Ok(Running {
      pipeline,
      appsrc,
      width,
      height,
    })
  }

  fn push_frame(&mut self, frame: &RgbFrame) -> Result<(), GStreamerVideoOutputError> {
    let (width, height) = (frame.width(), frame.height());
    let resized = self
      .running
      .as_ref()
      .is_some_and(|r| r.width != width || r.height != height);
    if resized {
      if let Some(running) = self.running.take() {
        info!("帧尺寸变为 {}x{}，重建输出管道", width, height);
        running.finish();
      }
    }
    if self.running.is_none() {
      self.running = Some(self.start(width, height)?);
    }
    let Some(running) = self.running.as_ref() else {
      return Err(GStreamerVideoOutputError::PipelineError("管道未启动".to_string()));
    };

    let data = frame.as_nhwc();
    let mut buffer = gst::Buffer::from_slice(data.to_vec());

    let timestamp = (self.frame_count * 1_000_000_000) / (self.fps as u64);
    self.frame_count += 1;

    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerVideoOutputError::BufferCreationError)?;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(timestamp));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(
        1_000_000_000 / self.fps as u64,
      ));
    }

    running.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;

    Ok(())
  }
}

impl DisplaySink for GStreamerVideoOutput {
  fn deliver(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>) {
    let result = if self.hud {
      let frame = self.overlay.overlay(frame, &hud_text(fps, status));
      self.push_frame(&frame)
    } else {
      self.push_frame(frame)
    };
    if let Err(e) = result {
      warn!("输出第 {} 帧失败: {}", frame.index(), e);
    }
  }

  fn report(&mut self, status: &str) {
    info!("{}，GStreamer 输出共写入 {} 帧", status, self.frame_count);
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    if let Some(running) = self.running.take() {
      running.finish();
    }
    info!(
      "Video output closed. Total frames written: {}",
      self.frame_count
    );
  }
}
