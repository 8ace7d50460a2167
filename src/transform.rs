// 该文件是 Shoushi （手势） 项目的一部分。
// src/transform.rs - 推理结果到显示坐标的变换
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

use std::fmt;

use serde::Serialize;

use crate::{
  config::{FillPolicy, LensFacing, PipelineConfig},
  model::Detection,
};

/// 显示坐标系中的矩形，单位为像素
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl Rect {
  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.left, self.top, self.right, self.bottom]
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedDetection {
  pub label: String,
  pub confidence: f32,
  pub rect: Rect,
}

/// 当前显示表面与镜头朝向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
  pub width: u32,
  pub height: u32,
  pub lens_facing: LensFacing,
}

impl Viewport {
  pub fn new(width: u32, height: u32, lens_facing: LensFacing) -> Self {
    Self {
      width,
      height,
      lens_facing,
    }
  }
}

/// 检测被丢弃的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
  /// 无类别或置信度低于阈值
  BelowThreshold,
  /// 类别下标超出标签表
  UnknownClass,
  /// 模型给出的边框越界或左右颠倒
  DegenerateGeometry,
  /// 显示尺寸为零
  InvalidDisplay,
  /// 裁剪后宽或高小于最小检测尺寸
  TooSmall,
}

impl fmt::Display for Rejection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      Rejection::BelowThreshold => "置信度低于阈值",
      Rejection::UnknownClass => "类别不在标签表中",
      Rejection::DegenerateGeometry => "边框几何无效",
      Rejection::InvalidDisplay => "显示尺寸无效",
      Rejection::TooSmall => "检测框过小",
    };
    write!(f, "{}", text)
  }
}

fn is_normalized(bbox: &[f32; 4]) -> bool {
  let [left, top, right, bottom] = *bbox;
  bbox.iter().all(|v| v.is_finite())
    && 0.0 <= left
    && left <= right
    && right <= 1.0
    && 0.0 <= top
    && top <= bottom
    && bottom <= 1.0
}

/// 与 `transform` 相同，但给出拒绝原因
pub fn evaluate(
  detection: &Detection,
  config: &PipelineConfig,
  display_width: u32,
  display_height: u32,
  mirrored: bool,
) -> Result<TransformedDetection, Rejection> {
  let Some(class) = detection.class else {
    return Err(Rejection::BelowThreshold);
  };
  if detection.confidence.is_nan() || detection.confidence < config.confidence_threshold() {
    return Err(Rejection::BelowThreshold);
  }
  let label = config.labels().get(class).ok_or(Rejection::UnknownClass)?;
  if !is_normalized(&detection.bbox) {
    return Err(Rejection::DegenerateGeometry);
  }
  if display_width == 0 || display_height == 0 {
    return Err(Rejection::InvalidDisplay);
  }

  let size = config.input_size() as f32;
  let (width, height) = (display_width as f32, display_height as f32);
  let (scale_x, scale_y) = (width / size, height / size);
  let scale = match config.fill_policy() {
    FillPolicy::Cover => scale_x.max(scale_y),
    FillPolicy::Contain => scale_x.min(scale_y),
  };
  let extent = size * scale;
  let offset_x = (width - extent) / 2.0;
  let offset_y = (height - extent) / 2.0;

  let [left, top, right, bottom] = detection.bbox;
  let mut left = left * size * scale + offset_x;
  let mut right = right * size * scale + offset_x;
  let top = top * size * scale + offset_y;
  let bottom = bottom * size * scale + offset_y;

  // 前置镜头画面水平翻转
  if mirrored {
    (left, right) = (width - right, width - left);
  }

  let rect = Rect {
    left: left.clamp(0.0, width),
    top: top.clamp(0.0, height),
    right: right.clamp(0.0, width),
    bottom: bottom.clamp(0.0, height),
  };

  let min_size = config.min_detection_size();
  if rect.width() < min_size || rect.height() < min_size {
    return Err(Rejection::TooSmall);
  }

  Ok(TransformedDetection {
    label: label.to_string(),
    confidence: detection.confidence,
    rect,
  })
}

pub fn transform(
  detection: &Detection,
  config: &PipelineConfig,
  display_width: u32,
  display_height: u32,
  mirrored: bool,
) -> Option<TransformedDetection> {
  evaluate(detection, config, display_width, display_height, mirrored).ok()
}

/// 按视口（显示尺寸 + 镜头朝向）变换
pub fn transform_for(
  detection: &Detection,
  config: &PipelineConfig,
  viewport: &Viewport,
) -> Result<TransformedDetection, Rejection> {
  evaluate(
    detection,
    config,
    viewport.width,
    viewport.height,
    viewport.lens_facing.is_mirrored(),
  )
}
