// 该文件是 Shoushi （手势） 项目的一部分。
// src/input.rs - 原始 YUV 帧输入
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
  fs::File,
  io::{BufReader, ErrorKind, Read},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::{Frame, FrameError, FrameLayout, Rotation},
};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("缺少参数: {0}")]
  MissingParameter(&'static str),
  #[error("参数 {name} 无效: {value}")]
  InvalidParameter { name: &'static str, value: String },
  #[error("帧错误: {0}")]
  FrameError(#[from] FrameError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 从 `i420:`、`nv12:`、`nv21:` 方案推断帧布局
pub fn layout_for_scheme(scheme: &str) -> Option<FrameLayout> {
  match scheme {
    "i420" => Some(FrameLayout::I420),
    "nv12" => Some(FrameLayout::Nv12),
    "nv21" => Some(FrameLayout::Nv21),
    _ => None,
  }
}

/// 逐帧读取无头 YUV 4:2:0 文件
///
/// `nv21:///path/to/capture.yuv?width=640&height=480&rotation=90`
pub struct YuvFileInput {
  reader: BufReader<File>,
  layout: FrameLayout,
  width: u32,
  height: u32,
  rotation: Rotation,
  sequence: u64,
}

fn parse_param<T: std::str::FromStr>(url: &Url, name: &'static str) -> Result<Option<T>, InputError> {
  match url.query_pairs().find(|(k, _)| k == name) {
    Some((_, value)) => value
      .parse()
      .map(Some)
      .map_err(|_| InputError::InvalidParameter {
        name,
        value: value.to_string(),
      }),
    None => Ok(None),
  }
}

impl FromUrl for YuvFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let Some(layout) = layout_for_scheme(url.scheme()) else {
      error!("URI 方案不匹配: {}", url.scheme());
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    };

    let width: u32 = parse_param(url, "width")?.ok_or(InputError::MissingParameter("width"))?;
    let height: u32 = parse_param(url, "height")?.ok_or(InputError::MissingParameter("height"))?;
    let rotation = Rotation::try_from(parse_param::<u32>(url, "rotation")?.unwrap_or(0))?;

    Self::open(url.path(), layout, width, height, rotation)
  }
}

impl YuvFileInput {
  pub fn open(
    path: &str,
    layout: FrameLayout,
    width: u32,
    height: u32,
    rotation: Rotation,
  ) -> Result<Self, InputError> {
    let file = File::open(path)?;
    info!(
      "打开 YUV 输入: {} ({:?}, {}x{}, 旋转 {}°)",
      path,
      layout,
      width,
      height,
      rotation.degrees()
    );

    Ok(Self {
      reader: BufReader::new(file),
      layout,
      width,
      height,
      rotation,
      sequence: 0,
    })
  }

  pub fn frame_len(&self) -> usize {
    self.layout.frame_len(self.width, self.height)
  }
}

impl Iterator for YuvFileInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    let mut data = vec![0u8; self.frame_len()];
    match self.reader.read_exact(&mut data) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
        debug!("YUV 输入结束，共 {} 帧", self.sequence);
        return None;
      }
      Err(e) => {
        warn!("读取 YUV 帧失败: {}", e);
        return None;
      }
    }

    let sequence = self.sequence;
    self.sequence += 1;
    match Frame::from_packed(
      self.layout,
      self.width,
      self.height,
      self.rotation,
      data,
      sequence,
    ) {
      Ok(frame) => Some(frame),
      Err(e) => {
        warn!("构造帧失败: {}", e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;

  fn write_temp(name: &str, data: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("shoushi-input-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
  }

  #[test]
  fn reads_whole_frames_with_increasing_sequence() {
    // 2x2 I420 每帧 6 字节，末尾不足一帧的数据被忽略
    let path = write_temp("frames.yuv", &[0u8; 6 * 3 + 2]);
    let url = Url::parse(&format!(
      "i420://{}?width=2&height=2&rotation=90",
      path.display()
    ))
    .unwrap();
    let input = YuvFileInput::from_url(&url).unwrap();
    let frames: Vec<_> = input.collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(
      frames.iter().map(Frame::sequence).collect::<Vec<_>>(),
      vec![0, 1, 2]
    );
    assert_eq!(frames[0].rotation(), Rotation::Deg90);
  }

  #[test]
  fn parameters_are_validated() {
    let path = write_temp("params.yuv", &[0u8; 6]);
    let missing = Url::parse(&format!("nv21://{}?width=2", path.display())).unwrap();
    assert!(matches!(
      YuvFileInput::from_url(&missing),
      Err(InputError::MissingParameter("height"))
    ));

    let bad = Url::parse(&format!("nv12://{}?width=2&height=x", path.display())).unwrap();
    assert!(matches!(
      YuvFileInput::from_url(&bad),
      Err(InputError::InvalidParameter { name: "height", .. })
    ));

    let rotation = Url::parse(&format!(
      "nv12://{}?width=2&height=2&rotation=45",
      path.display()
    ))
    .unwrap();
    assert!(matches!(
      YuvFileInput::from_url(&rotation),
      Err(InputError::FrameError(FrameError::InvalidRotation(45)))
    ));

    let scheme = Url::parse(&format!("image://{}", path.display())).unwrap();
    assert!(matches!(
      YuvFileInput::from_url(&scheme),
      Err(InputError::SchemeMismatch(_))
    ));
  }
}
