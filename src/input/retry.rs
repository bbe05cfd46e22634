// 该文件是 Wangyue （望月） 项目的一部分。
// src/input/retry.rs - 摄像头读取重试
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

use tracing::warn;

use super::{FrameRead, FrameSource, SourceKind, SourceReadError};

/// 在来源内部吸收短暂的抓帧失败；连续失败 `attempts` 次后返回终止性错误。
pub struct RetryingSource<S> {
  inner: S,
  attempts: u32,
}

impl<S: FrameSource> RetryingSource<S> {
  pub fn new(inner: S, attempts: u32) -> Self {
    Self {
      inner,
      attempts: attempts.max(1),
    }
  }

  pub fn into_inner(self) -> S {
    self.inner
  }
}

impl<S: FrameSource> FrameSource for RetryingSource<S> {
  fn kind(&self) -> SourceKind {
    self.inner.kind()
  }

  fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
    let mut last = String::new();
    for attempt in 1..=self.attempts {
      match self.inner.next_frame() {
        Ok(read) => return Ok(read),
        Err(SourceReadError::Closed) => return Err(SourceReadError::Closed),
        Err(e) => {
          warn!("抓帧失败（第 {}/{} 次）: {}", attempt, self.attempts, e);
          last = e.to_string();
        }
      }
    }

    Err(SourceReadError::RetriesExhausted {
      attempts: self.attempts,
      last,
    })
  }

  fn close(&mut self) {
    self.inner.close();
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;

  use super::*;
  use crate::frame::RgbFrame;

  struct Flaky {
    script: VecDeque<bool>,
  }

  impl FrameSource for Flaky {
    fn kind(&self) -> SourceKind {
      SourceKind::Webcam
    }

    fn next_frame(&mut self) -> Result<FrameRead, SourceReadError> {
      match self.script.pop_front() {
        Some(true) => Ok(FrameRead::Frame(RgbFrame::filled(2, 2, 0, [0, 0, 0]))),
        _ => Err(SourceReadError::Device("busy".to_string())),
      }
    }

    fn close(&mut self) {}
  }

  #[test]
  fn transient_failures_are_absorbed() {
    let flaky = Flaky {
      script: VecDeque::from(vec![false, false, true]),
    };
    let mut source = RetryingSource::new(flaky, 3);
    assert!(matches!(source.next_frame(), Ok(FrameRead::Frame(_))));
  }

  #[test]
  fn consecutive_failures_are_terminal() {
    let flaky = Flaky {
      script: VecDeque::from(vec![false, false, false, true]),
    };
    let mut source = RetryingSource::new(flaky, 3);
    match source.next_frame() {
      Err(SourceReadError::RetriesExhausted { attempts, last }) => {
        assert_eq!(attempts, 3);
        assert!(last.contains("busy"));
      }
      other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
    // 第四次脚本仍在，说明没有多读
    assert_eq!(source.into_inner().script.len(), 1);
  }
}
