// 该文件是 Wangyue （望月） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::info;

use super::{OutputError, glyph};
use crate::{
  frame::RgbFrame,
  model::{COCO_CLASSES, Detection, DetectionSet},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_HORIZONTAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const TEXT_COLOR: [u8; 3] = [255, 255, 255];
const HUD_BACKGROUND: [u8; 3] = [0, 0, 0];

/// 标注器：在帧的副本上绘制边框与标签，输入帧保持不变。
pub struct Annotator {
  font: Option<FontArc>,
  font_size: f32,
  colors: Vec<[u8; 3]>,
}

impl Default for Annotator {
  fn default() -> Self {
    // 每个 COCO 类别一种颜色
    let colors = (0..COCO_CLASSES.len())
      .map(|i| {
        let hue = (i as f32 / COCO_CLASSES.len() as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      colors,
    }
  }
}

impl Annotator {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_size(mut self, font_size: f32) -> Self {
    self.font_size = font_size.max(1.0);
    self
  }

  /// 从 TTF/OTF 文件加载标签字体
  pub fn with_font_file(self, path: &Path) -> Result<Self, OutputError> {
    let data = std::fs::read(path).map_err(|source| OutputError::FontIo {
      path: path.to_path_buf(),
      source,
    })?;
    let font = FontArc::try_from_vec(data)
      .map_err(|_| OutputError::InvalidFont(path.to_path_buf()))?;
    info!("加载标签字体: {}", path.display());
    Ok(self.with_font(font))
  }

  /// 类别颜色，同一类别总是同一颜色
  pub fn color_for(&self, class_id: u32) -> [u8; 3] {
    self.colors[class_id as usize % self.colors.len()]
  }

  pub fn annotate(&self, frame: &RgbFrame, detections: &DetectionSet) -> RgbFrame {
    if detections.is_empty() {
      return frame.clone();
    }

    let mut image = frame.to_rgb_image();
    for detection in detections {
      self.draw_bbox_with_label(&mut image, detection);
    }
    RgbFrame::from_rgb_image(image, frame.index())
  }

  /// 在左上角叠加一行状态文字（帧率、错误提示等）
  pub fn overlay(&self, frame: &RgbFrame, text: &str) -> RgbFrame {
    if text.is_empty() {
      return frame.clone();
    }
    let mut image = frame.to_rgb_image();
    self.draw_label(&mut image, 0, 0, text, HUD_BACKGROUND);
    RgbFrame::from_rgb_image(image, frame.index())
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, detection: &Detection) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }
    let bbox = &detection.bbox;

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color_for(detection.class_id);

    // 边框加粗为 2 像素，向内收
    for thickness in 0..BOX_THICKNESS {
      let left = x_min + thickness;
      let top = y_min + thickness;
      let right = x_max - thickness;
      let bottom = y_max - thickness;
      if left > right || top > bottom {
        break;
      }

      for x in left..=right {
        image.put_pixel(x as u32, top as u32, Rgb(color));
        image.put_pixel(x as u32, bottom as u32, Rgb(color));
      }
      for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, Rgb(color));
        image.put_pixel(right as u32, y as u32, Rgb(color));
      }
    }

    let label = format!("{} {:.2}", detection.label, detection.confidence);
    let (_, text_height) = self.text_extent(&label);

    // 标签放在边框上方，放不下时放进边框内
    let label_y = if y_min - text_height >= 0 {
      y_min - text_height
    } else {
      y_min
    };
    self.draw_label(image, x_min, label_y, &label, color);
  }

  fn text_extent(&self, text: &str) -> (i32, i32) {
    let (width, height) = match &self.font {
      Some(font) => {
        let (width, _) = text_size(PxScale::from(self.font_size), font, text);
        (width as i32, self.font_size.ceil() as i32)
      }
      None => (glyph::text_width(text) as i32, glyph::GLYPH_HEIGHT as i32),
    };
    (
      width + 2 * LABEL_HORIZONTAL_PADDING,
      height + 2 * LABEL_TEXT_VERTICAL_PADDING,
    )
  }

  fn draw_label(&self, image: &mut RgbImage, x: i32, y: i32, text: &str, background: [u8; 3]) {
    let (text_width, text_height) = self.text_extent(text);
    let max_width = (image.width() as i32 - x).max(0);
    let max_height = (image.height() as i32 - y).max(0);
    let label_width = text_width.min(max_width);
    let label_height = text_height.min(max_height);

    // 仅在标签有空间时绘制
    if label_width <= 0 || label_height <= 0 {
      return;
    }

    let rect = Rect::at(x, y).of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, rect, Rgb(background));

    let text_x = x + LABEL_HORIZONTAL_PADDING;
    let text_y = y + LABEL_TEXT_VERTICAL_PADDING;
    match &self.font {
      Some(font) => draw_text_mut(
        image,
        Rgb(TEXT_COLOR),
        text_x,
        text_y,
        PxScale::from(self.font_size),
        font,
        text,
      ),
      None => glyph::draw_text(image, text_x, text_y, text, TEXT_COLOR),
    }
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  [
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame() -> RgbFrame {
    RgbFrame::filled(64, 48, 5, [12, 34, 56])
  }

  #[test]
  fn empty_set_is_identity() {
    let annotator = Annotator::default();
    let input = frame();
    let output = annotator.annotate(&input, &DetectionSet::empty());
    assert_eq!(output, input);
  }

  #[test]
  fn input_frame_is_untouched() {
    let annotator = Annotator::default();
    let input = frame();
    let copy = input.clone();
    let dets = DetectionSet::from(vec![Detection::new(0, 0.87, [10.0, 20.0, 40.0, 44.0])]);

    let output = annotator.annotate(&input, &dets);
    assert_eq!(input, copy);
    assert_ne!(output, input);
    assert_eq!(output.index(), 5);
    assert_eq!((output.width(), output.height()), (64, 48));
  }

  #[test]
  fn box_outline_uses_class_color() {
    let annotator = Annotator::default();
    let dets = DetectionSet::from(vec![Detection::new(3, 0.5, [10.0, 20.0, 40.0, 44.0])]);
    let output = annotator.annotate(&frame(), &dets);

    let color = annotator.color_for(3);
    // 下边框两像素，内部保持原色
    assert_eq!(output.pixel(25, 44), Some(color));
    assert_eq!(output.pixel(25, 43), Some(color));
    assert_eq!(output.pixel(25, 35), Some([12, 34, 56]));
  }

  #[test]
  fn colors_are_deterministic_per_class() {
    let a = Annotator::default();
    let b = Annotator::default();
    for class_id in [0, 1, 41, 79, 80, 1000] {
      assert_eq!(a.color_for(class_id), b.color_for(class_id));
    }
    assert_eq!(a.color_for(80), a.color_for(0));
    assert_ne!(a.color_for(0), a.color_for(1));
  }

  #[test]
  fn degenerate_boxes_are_skipped() {
    let annotator = Annotator::default();
    let dets = DetectionSet::from(vec![Detection::new(0, 0.9, [30.0, 30.0, 30.0, 30.0])]);
    assert_eq!(annotator.annotate(&frame(), &dets), frame());
  }

  #[test]
  fn overlay_draws_in_corner() {
    let annotator = Annotator::default();
    let output = annotator.overlay(&frame(), "fps 29.97");
    assert_eq!(output.pixel(0, 0), Some(HUD_BACKGROUND));
    assert_eq!(output.pixel(63, 47), Some([12, 34, 56]));
  }

  #[test]
  fn empty_frames_are_passed_through() {
    let annotator = Annotator::default();
    let dets = DetectionSet::from(vec![Detection::new(0, 0.9, [0.0, 0.0, 8.0, 8.0])]);
    for (width, height) in [(0, 16), (16, 0), (0, 0)] {
      let input = RgbFrame::filled(width, height, 1, [0, 0, 0]);
      assert_eq!(annotator.annotate(&input, &dets), input);
      assert_eq!(annotator.overlay(&input, "fps 0.0"), input);
    }
  }
}
