// 该文件是 Wangyue （望月） 项目的一部分。
// src/input.rs - 帧来源
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

//! # 帧来源
//!
//! 摄像头与视频文件两类来源共用 [`FrameSource`] 接口，流水线不关心具体后端。
//!
//! 来源定位符：
//! - `camera://<序号>` 或纯整数：摄像头
//! - `file:///路径` 或普通路径：视频文件或图片目录

use std::{
  fmt,
  ops::{Deref, DerefMut},
  path::{Path, PathBuf},
  str::FromStr,
};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, frame::RgbFrame, parse_locator};

mod image_sequence;
mod retry;
#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "v4l_input")]
mod v4l_input;

pub use self::image_sequence::ImageSequence;
pub use self::retry::RetryingSource;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerSource, GStreamerSourceError};
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lSource, V4lSourceError};

pub const CAMERA_SCHEME: &str = "camera";
pub const FILE_SCHEME: &str = "file";

/// 摄像头连续读取失败的默认重试次数
pub const DEFAULT_WEBCAM_RETRIES: u32 = 3;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];
pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
  Webcam,
  VideoFile,
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceKind::Webcam => f.write_str("摄像头"),
      SourceKind::VideoFile => f.write_str("视频文件"),
    }
  }
}

/// 来源选择
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceSpec {
  Webcam { device: u32 },
  VideoFile { path: PathBuf },
}

impl SourceSpec {
  pub fn webcam(device: u32) -> Self {
    SourceSpec::Webcam { device }
  }

  pub fn video_file(path: impl Into<PathBuf>) -> Self {
    SourceSpec::VideoFile { path: path.into() }
  }

  pub fn kind(&self) -> SourceKind {
    match self {
      SourceSpec::Webcam { .. } => SourceKind::Webcam,
      SourceSpec::VideoFile { .. } => SourceKind::VideoFile,
    }
  }
}

impl Default for SourceSpec {
  fn default() -> Self {
    SourceSpec::Webcam { device: 0 }
  }
}

impl fmt::Display for SourceSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceSpec::Webcam { device } => write!(f, "{}://{}", CAMERA_SCHEME, device),
      SourceSpec::VideoFile { path } => write!(f, "{}", path.display()),
    }
  }
}

impl FromUrl for SourceSpec {
  type Error = SourceOpenError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      CAMERA_SCHEME => {
        let device = match url.host_str() {
          None | Some("") => 0,
          Some(host) => host
            .parse::<u32>()
            .map_err(|_| SourceOpenError::InvalidLocator(url.to_string()))?,
        };
        Ok(SourceSpec::Webcam { device })
      }
      FILE_SCHEME => {
        let path = url
          .to_file_path()
          .map_err(|_| SourceOpenError::InvalidLocator(url.to_string()))?;
        Ok(SourceSpec::VideoFile { path })
      }
      _ => Err(SourceOpenError::InvalidLocator(url.to_string())),
    }
  }
}

impl FromStr for SourceSpec {
  type Err = SourceOpenError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if let Ok(device) = s.parse::<u32>() {
      return Ok(SourceSpec::Webcam { device });
    }
    let url = parse_locator(s).map_err(|e| SourceOpenError::InvalidLocator(format!("{}: {}", s, e)))?;
    Self::from_url(&url)
  }
}

/// 一次读取的结果
#[derive(Debug)]
pub enum FrameRead {
  Frame(RgbFrame),
  /// 视频文件读完，属于正常结束
  EndOfStream,
}

#[derive(Error, Debug)]
pub enum SourceOpenError {
  #[error("无法识别的来源: {0}")]
  InvalidLocator(String),
  #[error("来源不存在: {0}")]
  NotFound(PathBuf),
  #[error("不支持的来源格式: {0}")]
  Unsupported(String),
  #[error("{kind}来源需要启用 `{feature}` 特性")]
  BackendDisabled {
    kind: SourceKind,
    feature: &'static str,
  },
  #[error("无法打开摄像头 {device}: {reason}")]
  Device { device: u32, reason: String },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("后端错误: {0}")]
  Backend(String),
}

#[derive(Error, Debug)]
pub enum SourceReadError {
  #[error("设备读取失败: {0}")]
  Device(String),
  #[error("解码失败: {0}")]
  Decode(String),
  #[error("连续 {attempts} 次读取失败，最后一次错误: {last}")]
  RetriesExhausted { attempts: u32, last: String },
  #[error("来源已关闭")]
  Closed,
}

/// 帧来源。
///
/// `close` 必须是幂等的；关闭后再读取返回 [`SourceReadError::Closed`]。
pub trait FrameSource {
  fn kind(&self) -> SourceKind;

  fn next_frame(&mut self) -> Result<FrameRead, SourceReadError>;

  fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn kind(&self) -> SourceKind {
    (**self).kind()
  }

  fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
    (**self).next_frame()
  }

  fn close(&mut self) {
    (**self).close()
  }
}

/// 根据来源选择打开具体的来源。
pub trait SourceOpener {
  fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, SourceOpenError>;
}

impl<F> SourceOpener for F
where
  F: Fn(&SourceSpec) -> Result<Box<dyn FrameSource>, SourceOpenError>,
{
  fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, SourceOpenError> {
    self(spec)
  }
}

/// 持有一个打开的来源，离开作用域时关闭它。
pub struct SourceGuard {
  source: Box<dyn FrameSource>,
  spec: SourceSpec,
}

impl SourceGuard {
  pub fn new(spec: SourceSpec, source: Box<dyn FrameSource>) -> Self {
    Self { source, spec }
  }

  pub fn spec(&self) -> &SourceSpec {
    &self.spec
  }
}

impl Deref for SourceGuard {
  type Target = dyn FrameSource;

  fn deref(&self) -> &Self::Target {
    self.source.as_ref()
  }
}

impl DerefMut for SourceGuard {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.source.as_mut()
  }
}

impl Drop for SourceGuard {
  fn drop(&mut self) {
    debug!("关闭来源: {}", self.spec);
    self.source.close();
  }
}

/// 按编译特性选择后端的默认打开器。
#[derive(Debug, Clone)]
pub struct DefaultOpener {
  webcam_retries: u32,
}

impl Default for DefaultOpener {
  fn default() -> Self {
    Self {
      webcam_retries: DEFAULT_WEBCAM_RETRIES,
    }
  }
}

impl DefaultOpener {
  pub fn with_webcam_retries(mut self, retries: u32) -> Self {
    self.webcam_retries = retries.max(1);
    self
  }

  fn open_webcam(&self, device: u32) -> Result<Box<dyn FrameSource>, SourceOpenError> {
    #[cfg(feature = "v4l_input")]
    let source = V4lSource::open(device)
      .map(|s| Box::new(RetryingSource::new(s, self.webcam_retries)) as Box<dyn FrameSource>)
      .map_err(SourceOpenError::from);
    #[cfg(all(feature = "gstreamer_input", not(feature = "v4l_input")))]
    let source = GStreamerSource::camera(device)
      .map(|s| Box::new(RetryingSource::new(s, self.webcam_retries)) as Box<dyn FrameSource>)
      .map_err(SourceOpenError::from);
    #[cfg(not(any(feature = "v4l_input", feature = "gstreamer_input")))]
    let source = {
      let _ = (device, self.webcam_retries);
      Err(SourceOpenError::BackendDisabled {
        kind: SourceKind::Webcam,
        feature: "v4l_input",
      })
    };
    source
  }

  fn open_video_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, SourceOpenError> {
    if !path.exists() {
      return Err(SourceOpenError::NotFound(path.to_path_buf()));
    }

    if path.is_dir() || has_extension(path, &IMAGE_EXTENSIONS) {
      return Ok(Box::new(ImageSequence::open(path)?));
    }

    #[cfg(feature = "gstreamer_input")]
    let source = GStreamerSource::file(path)
      .map(|s| Box::new(s) as Box<dyn FrameSource>)
      .map_err(SourceOpenError::from);
    #[cfg(not(feature = "gstreamer_input"))]
    let source = if has_extension(path, &VIDEO_EXTENSIONS) {
      Err(SourceOpenError::BackendDisabled {
        kind: SourceKind::VideoFile,
        feature: "gstreamer_input",
      })
    } else {
      Err(SourceOpenError::Unsupported(path.display().to_string()))
    };
    source
  }
}

impl SourceOpener for DefaultOpener {
  fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, SourceOpenError> {
    info!("打开来源: {}", spec);
    match spec {
      SourceSpec::Webcam { device } => self.open_webcam(*device),
      SourceSpec::VideoFile { path } => self.open_video_file(path),
    }
  }
}

pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
    .unwrap_or(false)
}
