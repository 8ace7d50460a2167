// 该文件是 Shoushi （手势） 项目的一部分。
// src/convert.rs - YUV 4:2:0 帧转 RGB
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

use image::{RgbImage, imageops};
use thiserror::Error;
use tracing::debug;

use crate::frame::{Frame, Plane, PlaneKind, Rotation};

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
  #[error("空帧: {width}x{height}")]
  EmptyFrame { width: u32, height: u32 },
  #[error("不支持的帧格式: {0}")]
  UnsupportedFormat(String),
  #[error("{plane:?} 平面越界: 需要 {required} 字节, 实际 {actual} 字节")]
  PlaneOutOfBounds {
    plane: PlaneKind,
    required: usize,
    actual: usize,
  },
}

/// 把相机 4:2:0 帧转换为交错 RGB 图像，并按帧的旋转角度摆正
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameConverter;

impl FrameConverter {
  pub fn new() -> Self {
    Self
  }

  pub fn convert(&self, frame: &Frame) -> Result<RgbImage, ConvertError> {
    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
      return Err(ConvertError::EmptyFrame { width, height });
    }

    let luma = find_plane(frame, PlaneKind::Luma)?;
    let chroma_u = find_plane(frame, PlaneKind::ChromaU)?;
    let chroma_v = find_plane(frame, PlaneKind::ChromaV)?;

    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    check_plane(luma, w, h)?;
    check_plane(chroma_u, cw, ch)?;
    check_plane(chroma_v, cw, ch)?;

    let chroma = interleave_chroma(chroma_u, chroma_v, cw, ch)?;

    let mut rgb = vec![0u8; w * h * RGB_CHANNELS];
    for y in 0..h {
      let chroma_row = (y / 2) * cw;
      for x in 0..w {
        let luma_value = luma.sample(x, y).ok_or_else(|| out_of_bounds(luma, w, h))?;
        let (u, v) = chroma[chroma_row + x / 2];
        let index = (y * w + x) * RGB_CHANNELS;
        rgb[index..index + RGB_CHANNELS].copy_from_slice(&yuv_to_rgb(luma_value, u, v));
      }
    }

    let image = RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
      ConvertError::UnsupportedFormat(format!("无法创建 {}x{} RGB 图像", width, height))
    })?;

    debug!(
      "帧 {} 转换完成: {}x{}, 旋转 {}°",
      frame.sequence(),
      width,
      height,
      frame.rotation().degrees()
    );

    Ok(rotate(image, frame.rotation()))
  }
}

/// BT.601 全范围 YUV → RGB
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let y = y as f32;
  let u = u as f32 - 128.0;
  let v = v as f32 - 128.0;

  let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
  let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
  let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
  [r, g, b]
}

fn find_plane(frame: &Frame, kind: PlaneKind) -> Result<&Plane, ConvertError> {
  let mut matches = frame.planes().iter().filter(|p| p.kind() == kind);
  match (matches.next(), matches.next()) {
    (Some(plane), None) => Ok(plane),
    (None, _) => Err(ConvertError::UnsupportedFormat(format!(
      "缺少 {:?} 平面",
      kind
    ))),
    (Some(_), Some(_)) => Err(ConvertError::UnsupportedFormat(format!(
      "重复的 {:?} 平面",
      kind
    ))),
  }
}

fn check_plane(plane: &Plane, cols: usize, rows: usize) -> Result<(), ConvertError> {
  if plane.is_empty() {
    return Err(ConvertError::EmptyFrame {
      width: cols as u32,
      height: rows as u32,
    });
  }
  let invalid_stride = || {
    ConvertError::UnsupportedFormat(format!(
      "{:?} 平面步长无效: row_stride={}, pixel_stride={}",
      plane.kind(),
      plane.row_stride(),
      plane.pixel_stride()
    ))
  };
  let row_span = plane.required_len(cols, 1).ok_or_else(invalid_stride)?;
  if plane.pixel_stride() == 0 || plane.row_stride() < row_span {
    return Err(invalid_stride());
  }
  let required = plane.required_len(cols, rows).ok_or_else(invalid_stride)?;
  if required > plane.len() {
    return Err(out_of_bounds(plane, cols, rows));
  }
  Ok(())
}

fn out_of_bounds(plane: &Plane, cols: usize, rows: usize) -> ConvertError {
  ConvertError::PlaneOutOfBounds {
    plane: plane.kind(),
    required: plane.required_len(cols, rows).unwrap_or(usize::MAX),
    actual: plane.len(),
  }
}

/// 将两个下采样色度平面重组为 (U, V) 交错序列，丢弃行尾填充
fn interleave_chroma(
  u_plane: &Plane,
  v_plane: &Plane,
  cols: usize,
  rows: usize,
) -> Result<Vec<(u8, u8)>, ConvertError> {
  let mut chroma = Vec::with_capacity(cols * rows);
  for y in 0..rows {
    for x in 0..cols {
      let u = u_plane
        .sample(x, y)
        .ok_or_else(|| out_of_bounds(u_plane, cols, rows))?;
      let v = v_plane
        .sample(x, y)
        .ok_or_else(|| out_of_bounds(v_plane, cols, rows))?;
      chroma.push((u, v));
    }
  }
  Ok(chroma)
}

fn rotate(image: RgbImage, rotation: Rotation) -> RgbImage {
  match rotation {
    Rotation::Deg0 => image,
    Rotation::Deg90 => imageops::rotate90(&image),
    Rotation::Deg180 => imageops::rotate180(&image),
    Rotation::Deg270 => imageops::rotate270(&image),
  }
}
