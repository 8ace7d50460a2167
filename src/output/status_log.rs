// 该文件是 Shoushi （手势） 项目的一部分。
// src/output/status_log.rs - 以日志形式输出手势状态
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

use std::convert::Infallible;

use tracing::info;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{OutputError, OverlayState, Render},
};

/// `log:` 只打印状态栏文本与检测框
pub struct StatusLog;

impl FromUrlWithScheme for StatusLog {
  const SCHEME: &'static str = "log";
}

impl FromUrl for StatusLog {
  type Error = OutputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(StatusLog)
  }
}

impl Render for StatusLog {
  type Error = Infallible;

  fn render_overlay(&self, state: &OverlayState) -> Result<(), Self::Error> {
    info!("[{}] {}", state.generation, state.status_text());
    for detection in &state.detections {
      info!(
        "  {} {:.2} [{:.1}, {:.1}, {:.1}, {:.1}]",
        detection.label,
        detection.confidence,
        detection.rect.left,
        detection.rect.top,
        detection.rect.right,
        detection.rect.bottom
      );
    }
    Ok(())
  }
}
