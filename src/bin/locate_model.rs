// 该文件是 Wangyue （望月） 项目的一部分。
// src/bin/locate_model.rs - 打印最新训练产物
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

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wangyue::locate::{DEFAULT_ARTIFACTS, DEFAULT_MODEL, ModelLocator};

#[derive(Parser, Debug)]
#[command(author, version, about = "打印最新的训练产物路径", long_about = None)]
pub struct Args {
  /// 训练产物所在目录
  #[arg(value_name = "ROOT", default_value = "runs")]
  pub search_root: PathBuf,
  /// 候选文件名，可重复指定
  #[arg(long = "artifact", value_name = "NAME")]
  pub artifacts: Vec<String>,
  /// 找不到产物时使用的模型
  #[arg(long, value_name = "MODEL", default_value = DEFAULT_MODEL)]
  pub fallback: String,
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  let artifacts = if args.artifacts.is_empty() {
    DEFAULT_ARTIFACTS.iter().map(|s| s.to_string()).collect()
  } else {
    args.artifacts
  };

  let model = ModelLocator::default()
    .with_artifacts(artifacts)
    .with_default(args.fallback)
    .locate(&args.search_root);
  println!("{}", model);
}
