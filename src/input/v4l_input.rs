// 该文件是 Wangyue （望月） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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

use std::pin::Pin;

use thiserror::Error;
use tracing::{debug, info};
use v4l::{
  FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  prelude::*,
  video::Capture,
};

use super::{FrameRead, FrameSource, SourceKind, SourceOpenError, SourceReadError};
use crate::frame::RgbFrame;

const V4L_BUFFER_COUNT: u32 = 4;
const V4L_DEFAULT_WIDTH: u32 = 640;
const V4L_DEFAULT_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum V4lSourceError {
  #[error("无法打开设备 /dev/video{device}: {source}")]
  Open {
    device: u32,
    #[source]
    source: std::io::Error,
  },
  #[error("设置视频格式失败: {0}")]
  Format(std::io::Error),
  #[error("无法创建捕获流: {0}")]
  Stream(std::io::Error),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
}

impl From<V4lSourceError> for SourceOpenError {
  fn from(err: V4lSourceError) -> Self {
    match err {
      V4lSourceError::Open { device, source } => SourceOpenError::Device {
        device,
        reason: source.to_string(),
      },
      other => SourceOpenError::Backend(other.to_string()),
    }
  }
}

/// 像素格式：优先 YUYV，驱动不支持时接受 RGB3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Yuyv,
  Rgb3,
}

/// V4L2 摄像头。
///
/// Stream 引用 Device，Device 用 `Pin<Box>` 固定在堆上，
/// 关闭时先释放 Stream 再释放 Device。
pub struct V4lSource {
  stream: Option<Stream<'static>>,
  device: Option<Pin<Box<Device>>>,
  pixel_format: PixelFormat,
  width: u32,
  height: u32,
  index: u64,
}

impl V4lSource {
  pub fn open(device_index: u32) -> Result<Self, V4lSourceError> {
    let device = Box::pin(Device::new(device_index as usize).map_err(|source| {
      V4lSourceError::Open {
        device: device_index,
        source,
      }
    })?);

    let mut format = device.format().map_err(V4lSourceError::Format)?;
    format.width = V4L_DEFAULT_WIDTH;
    format.height = V4L_DEFAULT_HEIGHT;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format).map_err(V4lSourceError::Format)?;

    let pixel_format = match &format.fourcc.repr {
      b"YUYV" => PixelFormat::Yuyv,
      b"RGB3" => PixelFormat::Rgb3,
      other => {
        return Err(V4lSourceError::UnsupportedPixelFormat(
          String::from_utf8_lossy(other).into_owned(),
        ));
      }
    };
    info!(
      "摄像头 /dev/video{}: {}x{} {:?}",
      device_index, format.width, format.height, pixel_format
    );

    // SAFETY: device 被 Pin<Box> 固定在堆上，不会移动；
    // stream 与 device 存放在同一结构体中，close 与 drop 都先释放 stream。
    let device_ref: &Device = &device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, V4L_BUFFER_COUNT)
        .map_err(V4lSourceError::Stream)?
    };

    Ok(Self {
      stream: Some(stream),
      device: Some(device),
      pixel_format,
      width: format.width,
      height: format.height,
      index: 0,
    })
  }
}

impl FrameSource for V4lSource {
  fn kind(&self) -> SourceKind {
    SourceKind::Webcam
  }

  fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
    let stream = self.stream.as_mut().ok_or(SourceReadError::Closed)?;
    let (buffer, meta) = stream
      .next()
      .map_err(|e| SourceReadError::Device(e.to_string()))?;
    let used = (meta.bytesused as usize).min(buffer.len());
    let buffer = if used > 0 { &buffer[..used] } else { buffer };

    let rgb = match self.pixel_format {
      PixelFormat::Yuyv => yuyv_to_rgb(buffer),
      PixelFormat::Rgb3 => buffer.to_vec(),
    };
    let frame = RgbFrame::from_raw(self.width, self.height, self.index, rgb)
      .map_err(|e| SourceReadError::Decode(e.to_string()))?;
    self.index += 1;
    Ok(FrameRead::Frame(frame))
  }

  fn close(&mut self) {
    if self.stream.take().is_some() {
      debug!("释放 V4L2 捕获流");
    }
    self.device.take();
  }
}

impl Drop for V4lSource {
  fn drop(&mut self) {
    self.close();
  }
}

/// YUYV（YUV 4:2:2）转 RGB，BT.601
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
  let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;

    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}
