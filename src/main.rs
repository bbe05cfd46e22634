// 该文件是 Wangyue （望月） 项目的一部分。
// src/main.rs - 实时检测主程序
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

use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wangyue::{
  FromUrl,
  control::{Control, DEFAULT_CONFIDENCE, PipelineConfig},
  input::{DEFAULT_WEBCAM_RETRIES, DefaultOpener, SourceSpec},
  locate::ModelLocator,
  model::{BackendLoader, DEFAULT_NMS_THRESHOLD, EngineCache, ModelId},
  output::{Annotator, OutputWrapper},
  parse_locator,
  task::{Pipeline, PipelineState},
};

/// Wangyue 实时目标检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 训练产物所在目录，在 `<ROOT>/detect/*/weights/` 下查找最新模型
  #[arg(long, value_name = "ROOT", default_value = "runs")]
  pub search_root: PathBuf,
  /// 直接指定模型文件，跳过查找
  #[arg(long, value_name = "MODEL")]
  pub model: Option<PathBuf>,
  /// 置信度阈值
  #[arg(long, value_name = "CONFIDENCE", default_value_t = DEFAULT_CONFIDENCE)]
  pub confidence: f32,
  /// NMS IoU 阈值
  #[arg(long, value_name = "IOU", default_value_t = DEFAULT_NMS_THRESHOLD)]
  pub nms_threshold: f32,
  /// 输入来源：摄像头编号、`camera://N` 或视频文件路径
  #[arg(long, value_name = "SOURCE", default_value = "0")]
  pub source: SourceSpec,
  /// 输出：`log:`、`folder:///dir` 或 `gst://display`
  #[arg(long, value_name = "OUTPUT", default_value = "log:")]
  pub output: String,
  /// 标签字体（TTF/OTF），未指定时使用内置点阵字体
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 处理的最大帧数
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub max_frames: Option<u64>,
  /// 摄像头读取失败时的重试次数
  #[arg(long, value_name = "RETRIES", default_value_t = DEFAULT_WEBCAM_RETRIES)]
  pub webcam_retries: u32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  let model = match &args.model {
    Some(path) => ModelId::from(path.as_path()),
    None => ModelLocator::default().locate(&args.search_root),
  };

  info!("模型文件路径: {}", model);
  info!("输入来源: {}", args.source);
  info!("输出: {}", args.output);
  info!("置信度阈值: {}", args.confidence);

  let output_url = parse_locator(&args.output)
    .with_context(|| format!("无法解析输出位置: {}", args.output))?;
  let mut output = OutputWrapper::from_url(&output_url)?;

  let annotator = match &args.font {
    Some(font) => Annotator::default().with_font_file(font)?,
    None => Annotator::default(),
  };

  let control = Arc::new(Control::new(
    PipelineConfig::new(model, args.source.clone()).with_confidence(args.confidence),
  ));

  let handle = control.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    handle.request_stop();
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let engines = EngineCache::new(BackendLoader::default().with_nms_threshold(args.nms_threshold));
  let opener = DefaultOpener::default().with_webcam_retries(args.webcam_retries);
  let mut pipeline = Pipeline::new(engines, opener, control)
    .with_annotator(annotator)
    .with_max_frames(args.max_frames);

  let report = pipeline.run(&mut output)?;
  info!(
    "处理完成! 状态: {}，总帧数: {}，推理失败: {}",
    report.state, report.frames_delivered, report.inference_failures
  );

  if let PipelineState::Failed(reason) = report.state {
    anyhow::bail!("流水线失败: {}", reason);
  }

  Ok(())
}
