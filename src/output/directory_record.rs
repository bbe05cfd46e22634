// 该文件是 Wangyue （望月） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbFrame,
  output::{DisplaySink, draw::Annotator, hud_text},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 把标注后的帧保存为 PNG，按 `目录/年/月/日/` 分层。
///
/// `folder:///dir`，可选参数：
/// - `every=N`：每 N 帧保存一次，默认每帧保存
/// - `hud`：在图像左上角叠加帧率与状态
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  every: u64,
  hud: bool,
  overlay: Annotator,
  frame_counter: u64,
  saved: u64,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let every = uri
      .query_pairs()
      .find(|(k, _)| k == "every")
      .and_then(|(_, v)| v.parse::<u64>().ok())
      .unwrap_or(1)
      .max(1);
    let hud = uri.query_pairs().any(|(k, _)| k == "hud");

    Ok(Self::new(Path::new(uri.path()), every, hud))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: &Path, every: u64, hud: bool) -> Self {
    info!("记录目录: {}", directory.display());
    Self {
      directory: directory.to_path_buf(),
      every: every.max(1),
      hud,
      overlay: Annotator::default(),
      frame_counter: 0,
      saved: 0,
    }
  }

  pub fn saved(&self) -> u64 {
    self.saved
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:06}.png",
      now.format("%H-%M-%S"),
      self.frame_counter
    )))
  }

  fn save(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>) -> Result<(), DirectoryRecordOutputError> {
    let path = self.frame_path()?;
    let image = if self.hud {
      self.overlay.overlay(frame, &hud_text(fps, status)).to_rgb_image()
    } else {
      frame.to_rgb_image()
    };
    image.save(&path)?;
    debug!("保存帧 {} 到 {}", frame.index(), path.display());
    self.saved += 1;
    Ok(())
  }
}

impl DisplaySink for DirectoryRecordOutput {
  fn deliver(&mut self, frame: &RgbFrame, fps: f64, status: Option<&str>) {
    self.frame_counter += 1;
    if (self.frame_counter - 1) % self.every != 0 {
      return;
    }
    if let Err(e) = self.save(frame, fps, status) {
      warn!("保存帧 {} 失败: {}", frame.index(), e);
    }
  }

  fn report(&mut self, status: &str) {
    info!(
      "{}，共保存 {} 帧到 {}",
      status,
      self.saved,
      self.directory.display()
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn count_png(dir: &Path) -> usize {
    let mut count = 0;
    for entry in std::fs::read_dir(dir).unwrap() {
      let path = entry.unwrap().path();
      if path.is_dir() {
        count += count_png(&path);
      } else if path.extension().is_some_and(|e| e == "png") {
        count += 1;
      }
    }
    count
  }

  #[test]
  fn saves_every_nth_frame() {
    let dir = tempfile::tempdir().unwrap();
    let mut output = DirectoryRecordOutput::new(dir.path(), 2, true);
    for i in 0..5 {
      output.deliver(&RgbFrame::filled(8, 8, i, [1, 2, 3]), 10.0, None);
    }
    assert_eq!(output.saved(), 3);
    assert_eq!(count_png(dir.path()), 3);
  }

  #[test]
  fn parses_query() {
    let url = url::Url::parse("folder:///tmp/records?every=10&hud").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.every, 10);
    assert!(output.hud);
    assert_eq!(output.directory, PathBuf::from("/tmp/records"));
  }
}
