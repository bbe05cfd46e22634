// 该文件是 Wangyue （望月） 项目的一部分。
// src/model/yolo26.rs - RKNPU 上的 YOLO26 推理
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
  path::{Path, PathBuf},
  sync::Mutex,
};

use image::imageops::{self, FilterType};
use rknpu::{Context, InitFlags, TensorType};
use tracing::{debug, error, info};

use crate::{
  frame::RgbFrame,
  model::{
    DEFAULT_NMS_THRESHOLD, Detection, DetectionSet, InferenceError, Model, ModelLoadError,
    non_max_suppression,
  },
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: u32 = 640;
const YOLO26_INPUT_H: u32 = 640;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

pub struct Yolo26 {
  // RKNN 上下文不保证可跨线程共享
  context: Mutex<Context>,
  nms_threshold: f32,
}

pub struct Yolo26Builder {
  model_path: PathBuf,
  flags: InitFlags,
  nms_threshold: f32,
}

impl Yolo26Builder {
  pub fn new(model_path: &Path) -> Self {
    Self {
      model_path: model_path.to_path_buf(),
      flags: InitFlags::default(),
      nms_threshold: DEFAULT_NMS_THRESHOLD,
    }
  }

  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn nms_threshold(mut self, nms_threshold: f32) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  pub fn build(self) -> Result<Yolo26, ModelLoadError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path).map_err(|source| ModelLoadError::Io {
      path: self.model_path.clone(),
      source,
    })?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, self.flags)
      .map_err(|e| ModelLoadError::Invalid(format!("创建 RKNN 上下文失败: {}", e)))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(ModelLoadError::Invalid(format!("无法查询 SDK 版本: {}", e)));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| ModelLoadError::Invalid(format!("无法获取输入数量: {}", e)))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| ModelLoadError::Invalid(format!("无法获取输出数量: {}", e)))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(ModelLoadError::Invalid(msg));
    }

    info!("模型加载完成");
    Ok(Yolo26 {
      context: Mutex::new(context),
      nms_threshold: self.nms_threshold,
    })
  }
}

impl Model for Yolo26 {
  fn name(&self) -> &str {
    "rknpu-yolo26"
  }

  fn infer(&self, frame: &RgbFrame, threshold: f32) -> Result<DetectionSet, InferenceError> {
    let image = frame.to_rgb_image();
    let resized = imageops::resize(&image, YOLO26_INPUT_W, YOLO26_INPUT_H, FilterType::Triangle);

    let context = self
      .context
      .lock()
      .map_err(|_| InferenceError::Backend("RKNN 上下文锁已中毒".to_string()))?;

    debug!("设置模型输入");
    context
      .set_input(
        0,
        resized.as_raw(),
        rknpu::TensorFormat::NHWC,
        TensorType::UInt8,
      )
      .map_err(|e| InferenceError::Backend(e.to_string()))?;

    debug!("执行模型推理");
    context
      .run()
      .map_err(|e| InferenceError::Backend(e.to_string()))?;

    let output = context
      .get_outputs()
      .map_err(|e| InferenceError::Backend(e.to_string()))?;

    let mut heads = Vec::with_capacity(YOLO26_HEAD_SIZES.len());
    for head_idx in 0..YOLO26_HEAD_SIZES.len() {
      let first = output
        .get_f32(head_idx * 2)
        .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;
      let second = output
        .get_f32(head_idx * 2 + 1)
        .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;
      heads.push((first, second));
    }

    let candidates = decode_heads(&heads, threshold, (frame.width(), frame.height()))?;
    Ok(DetectionSet::from(non_max_suppression(
      candidates,
      self.nms_threshold,
    )))
  }
}

/// 根据张量大小区分回归与分类输出，RKNN 的输出顺序并不固定。
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

/// 解码三个检测头，坐标映射到帧像素。
fn decode_heads(
  heads: &[(&[f32], &[f32])],
  threshold: f32,
  frame_size: (u32, u32),
) -> Result<Vec<Detection>, InferenceError> {
  let (frame_w, frame_h) = (frame_size.0 as f32, frame_size.1 as f32);
  let input_w = YOLO26_INPUT_W as f32;
  let input_h = YOLO26_INPUT_H as f32;
  let mut items = Vec::new();

  for (head_idx, ((&(map_h, map_w), stride), &(tensor1, tensor2))) in YOLO26_HEAD_SIZES
    .iter()
    .zip(YOLO26_STRIDES)
    .zip(heads)
    .enumerate()
  {
    let spatial = map_h * map_w;
    let (reg, cls) =
      match_reg_cls_tensors(tensor1, tensor2, 4 * spatial, YOLO26_CLASS_NUM * spatial)
        .ok_or_else(|| {
          InferenceError::MalformedOutput(format!(
            "检测头 {}: 输出大小不匹配 ({}, {})",
            head_idx,
            tensor1.len(),
            tensor2.len()
          ))
        })?;

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;

        let (max_logit, class_id) = (0..YOLO26_CLASS_NUM)
          .map(|c| (cls[c * spatial + idx], c))
          .fold((f32::MIN, 0usize), |best, cur| if cur.0 > best.0 { cur } else { best });
        let score = sigmoid(max_logit);
        if score < threshold {
          continue;
        }

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;

        let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, input_w);
        let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_h);
        let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_w);
        let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_h);

        if xmax <= xmin || ymax <= ymin {
          continue;
        }

        items.push(Detection::new(
          class_id as u32,
          score,
          [
            xmin / input_w * frame_w,
            ymin / input_h * frame_h,
            xmax / input_w * frame_w,
            ymax / input_h * frame_h,
          ],
        ));
      }
    }
  }

  debug!("检测到 {} 个候选框", items.len());
  Ok(items)
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
