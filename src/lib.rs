// 该文件是 Wangyue （望月） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod control;
pub mod frame;
pub mod input;
pub mod locate;
pub mod model;
pub mod output;
pub mod task;
pub mod throughput;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 解析命令行中的位置参数：合法 URL 原样解析，否则视为本地文件路径。
pub fn parse_locator(value: &str) -> Result<url::Url, url::ParseError> {
  match url::Url::parse(value) {
    // Windows 盘符会被解析为单字母 scheme
    Ok(url) if url.scheme().len() > 1 => Ok(url),
    _ => {
      let path = std::path::absolute(value).unwrap_or_else(|_| value.into());
      url::Url::from_file_path(&path).map_err(|_| url::ParseError::RelativeUrlWithoutBase)
    }
  }
}
