// 该文件是 Wangyue （望月） 项目的一部分。
// src/throughput.rs - 瞬时帧率统计
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

use std::time::Instant;

/// 由相邻两帧的时间戳（秒）计算瞬时帧率。
///
/// 间隔不为正（首帧、时钟回拨、同一时刻）时返回 0，不会产生除零错误。
pub fn sample(current: f64, previous: f64) -> f64 {
  let delta = current - previous;
  if !(delta > 0.0) {
    return 0.0;
  }
  let rate = 1.0 / delta;
  if rate.is_finite() { rate } else { 0.0 }
}

/// 只保留上一帧时间戳的帧率统计器。
#[derive(Debug)]
pub struct ThroughputTracker {
  origin: Instant,
  previous: Option<f64>,
}

impl Default for ThroughputTracker {
  fn default() -> Self {
    Self::new()
  }
}

impl ThroughputTracker {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
      previous: None,
    }
  }

  /// 记录当前时刻并返回相对上一帧的帧率。
  pub fn tick(&mut self) -> f64 {
    let now = self.origin.elapsed().as_secs_f64();
    self.record(now)
  }

  /// 以给定时间戳（秒）记录一帧。首帧没有参照，返回 0。
  pub fn record(&mut self, timestamp: f64) -> f64 {
    let rate = match self.previous {
      Some(previous) => sample(timestamp, previous),
      None => 0.0,
    };
    self.previous = Some(timestamp);
    rate
  }

  pub fn reset(&mut self) {
    self.previous = None;
  }
}
