// 该文件是 Shoushi （手势） 项目的一部分。
// src/output.rs - 叠加层发布与输出
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
  sync::{Arc, Condvar, Mutex, PoisonError},
  time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, transform::TransformedDetection};

mod snapshot;
mod status_log;
pub use self::snapshot::{OverlaySnapshot, OverlaySnapshotError};
pub use self::status_log::StatusLog;

pub const NO_GESTURE_TEXT: &str = "no gesture detected";

/// 渲染端看到的唯一产物，每帧整体替换
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverlayState {
  pub generation: u64,
  /// 产生该结果的帧序号
  pub sequence: Option<u64>,
  pub detections: Vec<TransformedDetection>,
}

/// 状态栏显示内容
#[derive(Debug, Clone, PartialEq)]
pub enum GestureStatus<'a> {
  Detected { label: &'a str, confidence: f32 },
  NoGesture,
}

impl OverlayState {
  pub fn new(generation: u64, sequence: u64, detections: Vec<TransformedDetection>) -> Self {
    Self {
      generation,
      sequence: Some(sequence),
      detections,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }

  pub fn status(&self) -> GestureStatus<'_> {
    match self.detections.first() {
      Some(detection) => GestureStatus::Detected {
        label: &detection.label,
        confidence: detection.confidence,
      },
      None => GestureStatus::NoGesture,
    }
  }

  pub fn status_text(&self) -> String {
    match self.status() {
      GestureStatus::Detected { label, confidence } => {
        format!("{} ({:.0}%)", label, confidence * 100.0)
      }
      GestureStatus::NoGesture => NO_GESTURE_TEXT.to_string(),
    }
  }
}

/// 发布叠加层，实现不得阻塞调用线程
pub trait OverlaySink: Send + Sync {
  fn publish(&self, state: Arc<OverlayState>);
}

/// 渲染器
pub trait Render: Sized {
  type Error;
  fn render_overlay(&self, state: &OverlayState) -> Result<(), Self::Error>;
}

struct Latest {
  state: Mutex<Arc<OverlayState>>,
  updated: Condvar,
}

/// 只保存最新一份叠加层的发布点
///
/// 代数较旧的发布会被忽略，读端观察到的代数单调不减。
#[derive(Clone)]
pub struct OverlayChannel {
  latest: Arc<Latest>,
}

impl Default for OverlayChannel {
  fn default() -> Self {
    Self::new()
  }
}

impl OverlayChannel {
  pub fn new() -> Self {
    Self {
      latest: Arc::new(Latest {
        state: Mutex::new(Arc::new(OverlayState::default())),
        updated: Condvar::new(),
      }),
    }
  }

  pub fn reader(&self) -> OverlayReader {
    OverlayReader {
      latest: self.latest.clone(),
    }
  }
}

impl OverlaySink for OverlayChannel {
  fn publish(&self, state: Arc<OverlayState>) {
    let mut current = self
      .latest
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if state.generation > current.generation {
      *current = state;
      self.latest.updated.notify_all();
    }
  }
}

#[derive(Clone)]
pub struct OverlayReader {
  latest: Arc<Latest>,
}

impl OverlayReader {
  pub fn latest(&self) -> Arc<OverlayState> {
    self
      .latest
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// 等待代数大于 `generation` 的发布，超时返回 None
  pub fn wait_newer(&self, generation: u64, timeout: Duration) -> Option<Arc<OverlayState>> {
    let guard = self
      .latest
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let (guard, _) = self
      .latest
      .updated
      .wait_timeout_while(guard, timeout, |state| state.generation <= generation)
      .unwrap_or_else(PoisonError::into_inner);
    (guard.generation > generation).then(|| guard.clone())
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("快照输出错误: {0}")]
  OverlaySnapshotError(#[from] OverlaySnapshotError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  OverlaySnapshot(OverlaySnapshot),
  StatusLog(StatusLog),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      OverlaySnapshot::SCHEME => Ok(OutputWrapper::OverlaySnapshot(OverlaySnapshot::from_url(url)?)),
      StatusLog::SCHEME => Ok(OutputWrapper::StatusLog(StatusLog::from_url(url)?)),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Render for OutputWrapper {
  type Error = OutputError;

  fn render_overlay(&self, state: &OverlayState) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::OverlaySnapshot(output) => output
        .render_overlay(state)
        .map_err(OutputError::from),
      OutputWrapper::StatusLog(output) => {
        let Ok(()) = output.render_overlay(state);
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::thread;

  use super::*;
  use crate::transform::Rect;

  fn detection(label: &str, confidence: f32) -> TransformedDetection {
    TransformedDetection {
      label: label.to_string(),
      confidence,
      rect: Rect {
        left: 0.0,
        top: 192.0,
        right: 540.0,
        bottom: 960.0,
      },
    }
  }

  #[test]
  fn status_text_reflects_first_detection() {
    let state = OverlayState::new(1, 5, vec![detection("palm", 0.91)]);
    assert_eq!(state.status_text(), "palm (91%)");
    assert_eq!(OverlayState::default().status_text(), NO_GESTURE_TEXT);
  }

  #[test]
  fn channel_keeps_generation_monotonic() {
    let channel = OverlayChannel::new();
    let reader = channel.reader();
    channel.publish(Arc::new(OverlayState::new(2, 2, vec![detection("fist", 0.8)])));
    channel.publish(Arc::new(OverlayState::new(1, 1, vec![])));
    let latest = reader.latest();
    assert_eq!(latest.generation, 2);
    assert_eq!(latest.detections.len(), 1);
  }

  #[test]
  fn wait_newer_wakes_on_publish() {
    let channel = OverlayChannel::new();
    let reader = channel.reader();
    let publisher = channel.clone();
    let handle = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      publisher.publish(Arc::new(OverlayState::new(1, 0, vec![])));
    });
    let state = reader.wait_newer(0, Duration::from_secs(5)).unwrap();
    assert_eq!(state.generation, 1);
    handle.join().unwrap();
    assert!(reader.wait_newer(1, Duration::from_millis(10)).is_none());
  }

  #[test]
  fn unknown_output_scheme_is_rejected() {
    let url = Url::parse("rtsp://localhost/stream").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch(_))
    ));
  }
}
