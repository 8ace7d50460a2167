// 该文件是 Shoushi （手势） 项目的一部分。
// src/output/snapshot.rs - 最新叠加层 JSON 快照
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
  io::{BufWriter, Write},
  path::{Path, PathBuf},
  sync::{Mutex, PoisonError},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{OverlayState, Render},
  transform::TransformedDetection,
};

#[derive(Error, Debug)]
pub enum OverlaySnapshotError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Snapshot<'a> {
  generation: u64,
  sequence: Option<u64>,
  status: String,
  detections: &'a [TransformedDetection],
}

/// 只保存最新一次发布的叠加层
///
/// `json:///path/to/overlay.json`，每次发布先写临时文件再整体替换目标文件，
/// 读者永远看不到半个快照，也不保留历史。
pub struct OverlaySnapshot {
  path: PathBuf,
  staging: PathBuf,
  lock: Mutex<()>,
}

impl FromUrlWithScheme for OverlaySnapshot {
  const SCHEME: &'static str = "json";
}

impl FromUrl for OverlaySnapshot {
  type Error = OverlaySnapshotError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(OverlaySnapshotError::SchemeMismatch);
    }
    Self::create(uri.path())
  }
}

impl OverlaySnapshot {
  pub fn create(path: impl AsRef<Path>) -> Result<Self, OverlaySnapshotError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    let mut staging = path.clone().into_os_string();
    staging.push(".tmp");
    info!("叠加层快照写入: {}", path.display());

    Ok(Self {
      path,
      staging: staging.into(),
      lock: Mutex::new(()),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Render for OverlaySnapshot {
  type Error = OverlaySnapshotError;

  fn render_overlay(&self, state: &OverlayState) -> Result<(), Self::Error> {
    let snapshot = Snapshot {
      generation: state.generation,
      sequence: state.sequence,
      status: state.status_text(),
      detections: &state.detections,
    };

    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut writer = BufWriter::new(File::create(&self.staging)?);
    serde_json::to_writer_pretty(&mut writer, &snapshot)?;
    writer.flush()?;
    drop(writer);
    std::fs::rename(&self.staging, &self.path)?;
    debug!("已写入第 {} 代叠加层快照", state.generation);
    Ok(())
  }
}
