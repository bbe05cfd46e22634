// 该文件是 Wangyue （望月） 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use image::RgbImage;
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: u32, height: u32 },
}

/// 一帧 RGB 图像，按 HWC（NHWC, N=1）排布。
///
/// 帧一旦构造便不可修改；标注器总是生成新的帧。
/// `index` 为帧在其来源中的到达序号。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  index: u64,
}

impl RgbFrame {
  pub fn from_raw(width: u32, height: u32, index: u64, data: Vec<u8>) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }

    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      index,
    })
  }

  /// 以单一颜色填充的帧，测试与占位画面使用。
  pub fn filled(width: u32, height: u32, index: u64, color: [u8; 3]) -> Self {
    let size = width as usize * height as usize;
    let data = color
      .iter()
      .copied()
      .cycle()
      .take(size * RGB_CHANNELS)
      .collect::<Vec<u8>>();
    Self {
      data: data.into_boxed_slice(),
      width,
      height,
      index,
    }
  }

  pub fn from_rgb_image(image: RgbImage, index: u64) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      index,
    }
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    // 长度在构造时已校验
    RgbImage::from_raw(self.width, self.height, self.data.to_vec())
      .unwrap_or_else(|| RgbImage::new(self.width, self.height))
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
    Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
  }
}

impl AsNhwcFrame for RgbFrame {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

/// BGR 打包数据转为 RGB 帧。
pub fn bgr_to_rgb(
  width: u32,
  height: u32,
  index: u64,
  data: &[u8],
) -> Result<RgbFrame, FrameError> {
  let expected = RGB_CHANNELS * width as usize * height as usize;
  if data.len() < expected {
    return Err(FrameError::LengthMismatch {
      expected,
      actual: data.len(),
    });
  }

  let rgb = data[..expected]
    .chunks_exact(RGB_CHANNELS)
    .flat_map(|px| [px[2], px[1], px[0]])
    .collect::<Vec<u8>>();
  RgbFrame::from_raw(width, height, index, rgb)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_wrong_length() {
    let err = RgbFrame::from_raw(2, 2, 0, vec![0; 11]).unwrap_err();
    assert_eq!(
      err,
      FrameError::LengthMismatch {
        expected: 12,
        actual: 11
      }
    );
  }

  #[test]
  fn bgr_is_swapped() {
    let frame = bgr_to_rgb(1, 1, 3, &[1, 2, 3]).unwrap();
    assert_eq!(frame.pixel(0, 0), Some([3, 2, 1]));
    assert_eq!(frame.index(), 3);
  }

  #[test]
  fn image_conversion_keeps_pixels() {
    let frame = RgbFrame::filled(4, 3, 7, [10, 20, 30]);
    let back = RgbFrame::from_rgb_image(frame.to_rgb_image(), 7);
    assert_eq!(frame, back);
  }

  #[test]
  fn nhwc_view_is_packed_rgb() {
    let frame = RgbFrame::from_raw(2, 1, 0, vec![1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(frame.as_nhwc(), &[1, 2, 3, 4, 5, 6]);
    assert_eq!(frame.pixel(1, 0), Some([4, 5, 6]));
  }
}
