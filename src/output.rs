// 该文件是 Wangyue （望月） 项目的一部分。
// src/output.rs - 显示输出
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbFrame};

pub mod draw;
pub mod glyph;

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerVideoOutput, GStreamerVideoOutputError};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

pub use self::draw::Annotator;

/// 显示端：接收标注后的帧、瞬时帧率与状态。
///
/// 两个方法都不能长时间阻塞，也不向流水线返回错误；
/// 输出端自身的故障只记录日志。
pub trait DisplaySink {
  fn deliver(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>);

  /// 流水线停止或出错时的状态通知
  fn report(&mut self, status: &str) {
    let _ = status;
  }
}

impl<S: DisplaySink + ?Sized> DisplaySink for Box<S> {
  fn deliver(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>) {
    (**self).deliver(frame, fps, status)
  }

  fn report(&mut self, status: &str) {
    (**self).report(status)
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerVideoOutputError(#[from] GStreamerVideoOutputError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("读取字体文件 {path} 失败: {source}")]
  FontIo {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("无效的字体文件: {0}")]
  InvalidFont(PathBuf),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 只写日志的输出端，无界面环境下使用。
///
/// `log:` 或 `log:?every=30`（每 30 帧输出一次 info 日志）。
#[derive(Debug, Clone)]
pub struct LogSink {
  every: u64,
  delivered: u64,
}

impl Default for LogSink {
  fn default() -> Self {
    Self {
      every: 30,
      delivered: 0,
    }
  }
}

impl LogSink {
  pub fn delivered(&self) -> u64 {
    self.delivered
  }
}

impl FromUrlWithScheme for LogSink {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogSink {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }

    let every = url
      .query_pairs()
      .find(|(k, _)| k == "every")
      .and_then(|(_, v)| v.parse::<u64>().ok())
      .unwrap_or(30)
      .max(1);

    Ok(Self { every, delivered: 0 })
  }
}

impl DisplaySink for LogSink {
  fn deliver(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>) {
    self.delivered += 1;
    if let Some(status) = status {
      warn!("第 {} 帧: {}", frame.index(), status);
    }
    if self.delivered % self.every == 0 {
      info!(
        "已输出 {} 帧，当前第 {} 帧 {}x{}，{:.1} FPS",
        self.delivered,
        frame.index(),
        frame.width(),
        frame.height(),
        fps
      );
    } else {
      debug!("第 {} 帧，{:.1} FPS", frame.index(), fps);
    }
  }

  fn report(&mut self, status: &str) {
    info!("流水线状态: {}（共输出 {} 帧）", status, self.delivered);
  }
}

pub enum OutputWrapper {
  Log(LogSink),
  #[cfg(feature = "gstreamer_output")]
  GStreamerVideoOutput(GStreamerVideoOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogSink::SCHEME => Ok(OutputWrapper::Log(LogSink::from_url(url)?)),
      #[cfg(feature = "gstreamer_output")]
      GStreamerVideoOutput::SCHEME => {
        let output = GStreamerVideoOutput::from_url(url)?;
        Ok(OutputWrapper::GStreamerVideoOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl DisplaySink for OutputWrapper {
  fn deliver(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>) {
    match self {
      OutputWrapper::Log(output) => output.deliver(frame, fps, status),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.deliver(frame, fps, status),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.deliver(frame, fps, status),
    }
  }

  fn report(&mut self, status: &str) {
    match self {
      OutputWrapper::Log(output) => output.report(status),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.report(status),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.report(status),
    }
  }
}

/// 帧率与状态组成的叠加文字
pub fn hud_text(fps: f64, status: Option<&str>) -> String {
  match status {
    Some(status) => format!("fps {:.1} - {}", fps, status),
    None => format!("fps {:.1}", fps),
  }
}
