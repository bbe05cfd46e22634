// 该文件是 Wangyue （望月） 项目的一部分。
// src/model/onnx.rs - 基于 tract 的 YOLOv8 ONNX 推理
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

//! # ONNX 检测后端
//!
//! 加载 Ultralytics 导出的 YOLOv8 ONNX 模型，纯 Rust 推理，不依赖 NPU。
//!
//! - 输入：`[1, 3, 640, 640]`，RGB，归一化到 `[0, 1]`
//! - 输出：`[1, 4 + 类别数, 锚点数]`，前四个通道为中心点格式的边界框
//!
//! 部分导出工具会把输出转置为 `[1, 锚点数, 4 + 类别数]`，两种排布都能识别。

use std::path::Path;

use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;
use tracing::debug;

use crate::{
  frame::RgbFrame,
  model::{
    Detection, DetectionSet, InferenceError, Model, ModelLoadError, non_max_suppression,
  },
};

const YOLOV8_INPUT_W: u32 = 640;
const YOLOV8_INPUT_H: u32 = 640;
const YOLOV8_BOX_CHANNELS: usize = 4;

pub struct OnnxYolo {
  plan: TypedRunnableModel<TypedModel>,
  nms_threshold: f32,
}

impl OnnxYolo {
  pub fn load(path: &Path, nms_threshold: f32) -> Result<Self, ModelLoadError> {
    let invalid = |stage: &str, e: TractError| {
      ModelLoadError::Invalid(format!("{} ({}): {:#}", stage, path.display(), e))
    };

    let plan = tract_onnx::onnx()
      .model_for_path(path)
      .map_err(|e| invalid("解析 ONNX 模型失败", e))?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(
          f32::datum_type(),
          tvec!(1, 3, YOLOV8_INPUT_H as usize, YOLOV8_INPUT_W as usize),
        ),
      )
      .map_err(|e| invalid("设置模型输入失败", e))?
      .into_optimized()
      .map_err(|e| invalid("优化模型失败", e))?
      .into_runnable()
      .map_err(|e| invalid("构建推理计划失败", e))?;

    Ok(Self {
      plan,
      nms_threshold,
    })
  }

  fn preprocess(&self, frame: &RgbFrame) -> Tensor {
    let image = frame.to_rgb_image();
    let resized = imageops::resize(&image, YOLOV8_INPUT_W, YOLOV8_INPUT_H, FilterType::Triangle);

    tract_ndarray::Array4::from_shape_fn(
      (1, 3, YOLOV8_INPUT_H as usize, YOLOV8_INPUT_W as usize),
      |(_, c, y, x)| resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0,
    )
    .into_tensor()
  }
}

impl Model for OnnxYolo {
  fn name(&self) -> &str {
    "onnx-yolov8"
  }

  fn infer(&self, frame: &RgbFrame, threshold: f32) -> Result<DetectionSet, InferenceError> {
    let input = self.preprocess(frame);
    let outputs = self
      .plan
      .run(tvec!(input.into()))
      .map_err(|e| InferenceError::Backend(format!("{:#}", e)))?;

    let output = outputs
      .first()
      .ok_or_else(|| InferenceError::MalformedOutput("模型没有输出".to_string()))?;
    let layout = OutputLayout::from_shape(output.shape())?;
    let data = output
      .as_slice::<f32>()
      .map_err(|e| InferenceError::MalformedOutput(format!("输出不是 f32 张量: {}", e)))?;

    let scale = (
      frame.width() as f32 / YOLOV8_INPUT_W as f32,
      frame.height() as f32 / YOLOV8_INPUT_H as f32,
    );
    let candidates = decode(data, layout, threshold, scale, (frame.width(), frame.height()));
    debug!("候选框 {} 个", candidates.len());

    Ok(DetectionSet::from(non_max_suppression(
      candidates,
      self.nms_threshold,
    )))
  }
}

/// 输出张量的排布
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
  channels: usize,
  anchors: usize,
  channel_major: bool,
}

impl OutputLayout {
  fn from_shape(shape: &[usize]) -> Result<Self, InferenceError> {
    let (a, b) = match shape {
      [1, a, b] => (*a, *b),
      [a, b] => (*a, *b),
      _ => {
        return Err(InferenceError::MalformedOutput(format!(
          "无法识别的输出形状: {:?}",
          shape
        )));
      }
    };

    // 锚点数（如 8400）总是远大于通道数（如 84）
    let (channels, anchors, channel_major) = if a <= b { (a, b, true) } else { (b, a, false) };
    if channels <= YOLOV8_BOX_CHANNELS {
      return Err(InferenceError::MalformedOutput(format!(
        "输出通道数 {} 过少",
        channels
      )));
    }

    Ok(Self {
      channels,
      anchors,
      channel_major,
    })
  }

  fn at(&self, data: &[f32], channel: usize, anchor: usize) -> f32 {
    if self.channel_major {
      data[channel * self.anchors + anchor]
    } else {
      data[anchor * self.channels + channel]
    }
  }
}

/// 解码输出张量为帧像素坐标下的候选框，低于阈值的直接丢弃。
fn decode(
  data: &[f32],
  layout: OutputLayout,
  threshold: f32,
  scale: (f32, f32),
  frame_size: (u32, u32),
) -> Vec<Detection> {
  if data.len() < layout.channels * layout.anchors {
    return Vec::new();
  }

  let (frame_w, frame_h) = (frame_size.0 as f32, frame_size.1 as f32);
  let mut detections = Vec::new();

  for anchor in 0..layout.anchors {
    let (class_id, score) = (YOLOV8_BOX_CHANNELS..layout.channels)
      .map(|c| (c - YOLOV8_BOX_CHANNELS, layout.at(data, c, anchor)))
      .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if !(score >= threshold) {
      continue;
    }

    let cx = layout.at(data, 0, anchor);
    let cy = layout.at(data, 1, anchor);
    let w = layout.at(data, 2, anchor);
    let h = layout.at(data, 3, anchor);

    let x1 = ((cx - w / 2.0) * scale.0).clamp(0.0, frame_w);
    let y1 = ((cy - h / 2.0) * scale.1).clamp(0.0, frame_h);
    let x2 = ((cx + w / 2.0) * scale.0).clamp(0.0, frame_w);
    let y2 = ((cy + h / 2.0) * scale.1).clamp(0.0, frame_h);

    if x2 <= x1 || y2 <= y1 {
      continue;
    }

    detections.push(Detection::new(
      class_id as u32,
      score.min(1.0),
      [x1, y1, x2, y2],
    ));
  }

  detections
}
