// 该文件是 Shoushi （手势） 项目的一部分。
// src/frame.rs - 相机帧定义
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

use std::{fmt, sync::Arc};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("不支持的旋转角度: {0}")]
  InvalidRotation(u32),
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 平面所承载的分量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
  Luma,
  ChromaU,
  ChromaV,
}

/// 单个像素平面
///
/// 多个平面可以共享同一块内存（例如 NV21 的 VU 交错平面），
/// 通过 `offset` 与 `pixel_stride` 描述各自的取样位置。
#[derive(Clone)]
pub struct Plane {
  kind: PlaneKind,
  data: Arc<[u8]>,
  offset: usize,
  row_stride: usize,
  pixel_stride: usize,
}

impl Plane {
  pub fn new(
    kind: PlaneKind,
    data: impl Into<Arc<[u8]>>,
    row_stride: usize,
    pixel_stride: usize,
  ) -> Self {
    Self {
      kind,
      data: data.into(),
      offset: 0,
      row_stride,
      pixel_stride,
    }
  }

  pub fn with_offset(mut self, offset: usize) -> Self {
    self.offset = offset;
    self
  }

  pub fn kind(&self) -> PlaneKind {
    self.kind
  }

  pub fn row_stride(&self) -> usize {
    self.row_stride
  }

  pub fn pixel_stride(&self) -> usize {
    self.pixel_stride
  }

  /// 可寻址的字节数（扣除偏移）
  pub fn len(&self) -> usize {
    self.data.len().saturating_sub(self.offset)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 覆盖 `cols × rows` 个样本所需的最小字节数，步长溢出时为 None
  pub fn required_len(&self, cols: usize, rows: usize) -> Option<usize> {
    if cols == 0 || rows == 0 {
      return Some(0);
    }
    (rows - 1)
      .checked_mul(self.row_stride)?
      .checked_add((cols - 1).checked_mul(self.pixel_stride)?)?
      .checked_add(1)
  }

  #[inline]
  pub fn sample(&self, x: usize, y: usize) -> Option<u8> {
    self
      .data
      .get(self.index_of(x, y)?)
      .copied()
  }

  fn index_of(&self, x: usize, y: usize) -> Option<usize> {
    self
      .offset
      .checked_add(y.checked_mul(self.row_stride)?)?
      .checked_add(x.checked_mul(self.pixel_stride)?)
  }
}

impl fmt::Debug for Plane {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Plane")
      .field("kind", &self.kind)
      .field("len", &self.len())
      .field("offset", &self.offset)
      .field("row_stride", &self.row_stride)
      .field("pixel_stride", &self.pixel_stride)
      .finish()
  }
}

/// 顺时针旋转角度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub fn degrees(&self) -> u32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }
}

impl TryFrom<u32> for Rotation {
  type Error = FrameError;

  fn try_from(degrees: u32) -> Result<Self, Self::Error> {
    match degrees {
      0 => Ok(Rotation::Deg0),
      90 => Ok(Rotation::Deg90),
      180 => Ok(Rotation::Deg180),
      270 => Ok(Rotation::Deg270),
      other => Err(FrameError::InvalidRotation(other)),
    }
  }
}

/// 连续内存中的 4:2:0 帧布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
  /// Y 平面 + U 平面 + V 平面
  I420,
  /// Y 平面 + UV 交错平面
  Nv12,
  /// Y 平面 + VU 交错平面
  Nv21,
}

impl FrameLayout {
  pub fn frame_len(&self, width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    w * h + 2 * cw * ch
  }
}

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// 相机原始帧
///
/// 帧被丢弃时（包括被准入控制直接丢弃）会调用一次释放回调，
/// 用于把缓冲区归还给帧来源。
pub struct Frame {
  width: u32,
  height: u32,
  rotation: Rotation,
  planes: [Plane; 3],
  sequence: u64,
  release: Option<ReleaseHook>,
}

impl Frame {
  pub fn new(
    width: u32,
    height: u32,
    rotation: Rotation,
    planes: [Plane; 3],
    sequence: u64,
  ) -> Self {
    Self {
      width,
      height,
      rotation,
      planes,
      sequence,
      release: None,
    }
  }

  /// 从一块连续的 4:2:0 数据构造帧，平面行间无填充
  pub fn from_packed(
    layout: FrameLayout,
    width: u32,
    height: u32,
    rotation: Rotation,
    data: Vec<u8>,
    sequence: u64,
  ) -> Result<Self, FrameError> {
    let expected = layout.frame_len(width, height);
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let luma_len = w * h;
    let data: Arc<[u8]> = data.into();

    let luma = Plane::new(PlaneKind::Luma, data.clone(), w, 1);
    let planes = match layout {
      FrameLayout::I420 => [
        luma,
        Plane::new(PlaneKind::ChromaU, data.clone(), cw, 1).with_offset(luma_len),
        Plane::new(PlaneKind::ChromaV, data, cw, 1).with_offset(luma_len + cw * ch),
      ],
      FrameLayout::Nv12 => [
        luma,
        Plane::new(PlaneKind::ChromaU, data.clone(), 2 * cw, 2).with_offset(luma_len),
        Plane::new(PlaneKind::ChromaV, data, 2 * cw, 2).with_offset(luma_len + 1),
      ],
      FrameLayout::Nv21 => [
        luma,
        Plane::new(PlaneKind::ChromaV, data.clone(), 2 * cw, 2).with_offset(luma_len),
        Plane::new(PlaneKind::ChromaU, data, 2 * cw, 2).with_offset(luma_len + 1),
      ],
    };

    Ok(Self::new(width, height, rotation, planes, sequence))
  }

  pub fn with_release_hook<F>(mut self, hook: F) -> Self
  where
    F: FnOnce(u64) + Send + 'static,
  {
    self.release = Some(Box::new(hook));
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  pub fn planes(&self) -> &[Plane; 3] {
    &self.planes
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }
}

impl fmt::Debug for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Frame")
      .field("width", &self.width)
      .field("height", &self.height)
      .field("rotation", &self.rotation)
      .field("sequence", &self.sequence)
      .field("planes", &self.planes)
      .finish()
  }
}

impl Drop for Frame {
  fn drop(&mut self) {
    if let Some(release) = self.release.take() {
      release(self.sequence);
    }
  }
}
