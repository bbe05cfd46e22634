// 该文件是 Wangyue （望月） 项目的一部分。
// src/locate.rs - 训练产物查找
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

//! # 模型查找
//!
//! 训练输出的目录结构固定为 `<root>/detect/<run>/weights/<artifact>`。
//! 查找器在所有候选产物中选出修改时间最新的一个；修改时间相同时取路径字典序最大者。
//! 任何失败（根目录不存在、无候选、文件系统错误）都退回默认模型标识，不向调用方报错。

use std::{
  fs,
  io,
  path::{Path, PathBuf},
  time::SystemTime,
};

use tracing::{debug, info, warn};

use crate::model::{LOADABLE_EXTENSIONS, ModelId};

pub const DEFAULT_MODEL: &str = "yolov8n.onnx";
/// 训练输出中会被选用的产物，只包含已编译后端能加载的格式
pub const DEFAULT_ARTIFACTS: &[&str] = &[
  #[cfg(feature = "model_onnx")]
  "best.onnx",
  #[cfg(feature = "model_yolo26")]
  "best.rknn",
];

const DETECT_DIR: &str = "detect";
const WEIGHTS_DIR: &str = "weights";

/// 查找过程中的候选产物，选出结果后即丢弃。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
  pub path: PathBuf,
  pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ModelLocator {
  artifacts: Vec<String>,
  default: ModelId,
}

impl Default for ModelLocator {
  fn default() -> Self {
    Self {
      artifacts: DEFAULT_ARTIFACTS.iter().map(|s| s.to_string()).collect(),
      default: ModelId::from(DEFAULT_MODEL),
    }
  }
}

impl ModelLocator {
  pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.artifacts = artifacts.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_default(mut self, default: impl Into<ModelId>) -> Self {
    self.default = default.into();
    self
  }

  pub fn default_model(&self) -> &ModelId {
    &self.default
  }

  /// 查找最新的训练产物，失败时返回默认模型。
  pub fn locate(&self, search_root: &Path) -> ModelId {
    match self.candidates(search_root) {
      Ok(candidates) => match select_latest(candidates) {
        Some(winner) => {
          info!("找到最新模型: {}", winner.path.display());
          ModelId::from(winner.path)
        }
        None => {
          info!(
            "{} 下没有训练产物，使用默认模型 {}",
            search_root.display(),
            self.default
          );
          self.default.clone()
        }
      },
      Err(e) => {
        warn!(
          "查找模型失败 ({}): {}，使用默认模型 {}",
          search_root.display(),
          e,
          self.default
        );
        self.default.clone()
      }
    }
  }

  /// 枚举 `<root>/detect/*/weights/` 下所有符合命名的产物。
  pub fn candidates(&self, search_root: &Path) -> io::Result<Vec<Candidate>> {
    let detect = search_root.join(DETECT_DIR);
    let mut found = Vec::new();

    for run in fs::read_dir(&detect)? {
      let run = run?;
      if !run.file_type()?.is_dir() {
        continue;
      }

      let weights = run.path().join(WEIGHTS_DIR);
      if !weights.is_dir() {
        continue;
      }

      for artifact in fs::read_dir(&weights)? {
        let artifact = artifact?;
        let name = artifact.file_name();
        let Some(name) = name.to_str() else {
          continue;
        };
        if !self.artifacts.iter().any(|a| a == name) {
          continue;
        }
        if !is_loadable(Path::new(name)) {
          debug!("跳过无法加载的产物: {}", artifact.path().display());
          continue;
        }

        let path = artifact.path();
        let metadata = fs::metadata(&path)?;
        if !metadata.is_file() {
          continue;
        }

        let candidate = Candidate {
          path,
          modified: metadata.modified()?,
        };
        debug!("候选模型: {:?}", candidate);
        found.push(candidate);
      }
    }

    Ok(found)
  }
}

/// 修改时间最新者胜出；时间相同则取路径字典序最大者。
pub fn select_latest(candidates: Vec<Candidate>) -> Option<Candidate> {
  candidates.into_iter().max_by(|a, b| {
    a.modified
      .cmp(&b.modified)
      .then_with(|| a.path.cmp(&b.path))
  })
}

fn is_loadable(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| LOADABLE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// 使用默认配置查找模型。
pub fn locate(search_root: &Path) -> ModelId {
  ModelLocator::default().locate(search_root)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn candidate(path: &str, secs: u64) -> Candidate {
    Candidate {
      path: PathBuf::from(path),
      modified: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
    }
  }

  #[test]
  fn newest_candidate_wins() {
    let winner = select_latest(vec![
      candidate("runs/detect/a/weights/best.onnx", 10),
      candidate("runs/detect/c/weights/best.onnx", 30),
      candidate("runs/detect/b/weights/best.onnx", 20),
    ])
    .unwrap();
    assert_eq!(winner.path, PathBuf::from("runs/detect/c/weights/best.onnx"));
  }

  #[test]
  fn ties_break_on_greatest_path() {
    let winner = select_latest(vec![
      candidate("runs/detect/train2/weights/best.onnx", 10),
      candidate("runs/detect/train3/weights/best.onnx", 10),
      candidate("runs/detect/train1/weights/best.onnx", 10),
    ])
    .unwrap();
    assert_eq!(
      winner.path,
      PathBuf::from("runs/detect/train3/weights/best.onnx")
    );

    // 与输入顺序无关
    let reversed = select_latest(vec![
      candidate("runs/detect/train3/weights/best.onnx", 10),
      candidate("runs/detect/train1/weights/best.onnx", 10),
    ])
    .unwrap();
    assert_eq!(reversed.path, winner.path);
  }

  #[test]
  fn empty_selects_nothing() {
    assert_eq!(select_latest(Vec::new()), None);
  }

  #[test]
  fn only_loadable_formats_are_candidates() {
    assert!(!is_loadable(Path::new("best.pt")));
    assert!(!is_loadable(Path::new("best")));
    assert_eq!(
      is_loadable(Path::new("best.onnx")),
      cfg!(feature = "model_onnx")
    );
    assert_eq!(
      is_loadable(Path::new("best.RKNN")),
      cfg!(feature = "model_yolo26")
    );
    assert!(DEFAULT_ARTIFACTS.iter().all(|a| is_loadable(Path::new(a))));
  }

  #[test]
  fn missing_root_falls_back() {
    let locator = ModelLocator::default().with_default("fallback.onnx");
    let id = locator.locate(Path::new("/definitely/not/here"));
    assert_eq!(id, ModelId::from("fallback.onnx"));
  }
}
