// 该文件是 Wangyue （望月） 项目的一部分。
// src/input/image_sequence.rs - 图片序列视频来源
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
  fs,
  path::{Path, PathBuf},
};

use image::ImageReader;
use tracing::{debug, info};

use super::{
  FrameRead, FrameSource, IMAGE_EXTENSIONS, SourceKind, SourceOpenError, SourceReadError,
  has_extension,
};
use crate::frame::RgbFrame;

/// 把一个图片目录（按文件名排序）或单张图片当作视频文件读取。
pub struct ImageSequence {
  files: Vec<PathBuf>,
  cursor: usize,
  closed: bool,
}

impl ImageSequence {
  pub fn open(path: &Path) -> Result<Self, SourceOpenError> {
    let files = if path.is_dir() {
      let mut files = fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_extension(p, &IMAGE_EXTENSIONS))
        .collect::<Vec<_>>();
      files.sort();
      files
    } else if path.is_file() && has_extension(path, &IMAGE_EXTENSIONS) {
      vec![path.to_path_buf()]
    } else {
      return Err(SourceOpenError::Unsupported(path.display().to_string()));
    };

    info!("图片序列 {} 共 {} 帧", path.display(), files.len());
    Ok(Self {
      files,
      cursor: 0,
      closed: false,
    })
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

impl FrameSource for ImageSequence {
  fn kind(&self) -> SourceKind {
    SourceKind::VideoFile
  }

  fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
    if self.closed {
      return Err(SourceReadError::Closed);
    }

    let Some(path) = self.files.get(self.cursor) else {
      return Ok(FrameRead::EndOfStream);
    };

    debug!("读取图片: {}", path.display());
    let image = ImageReader::open(path)
      .map_err(|e| SourceReadError::Decode(format!("{}: {}", path.display(), e)))?
      .decode()
      .map_err(|e| SourceReadError::Decode(format!("{}: {}", path.display(), e)))?;

    let frame = RgbFrame::from_rgb_image(image.to_rgb8(), self.cursor as u64);
    self.cursor += 1;
    Ok(FrameRead::Frame(frame))
  }

  fn close(&mut self) {
    self.closed = true;
  }
}
