// 该文件是 Shoushi （手势） 项目的一部分。
// src/preprocess.rs - 张量预处理
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

use crate::config::{NormalizationMode, PipelineConfig};

const RGB_CHANNELS: usize = 3;

/// NHWC 浮点输入张量，形状 [1, S, S, 3]，本机字节序
///
/// 每次推理独占一个张量，不在并发推理之间共享。
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  data: Box<[f32]>,
  input_size: u32,
}

impl Tensor {
  /// 全零张量，用于预热推理
  pub fn zeros(input_size: u32) -> Self {
    let s = input_size as usize;
    Self {
      data: vec![0.0; s * s * RGB_CHANNELS].into_boxed_slice(),
      input_size,
    }
  }

  pub fn input_size(&self) -> u32 {
    self.input_size
  }

  pub fn shape(&self) -> [usize; 4] {
    let s = self.input_size as usize;
    [1, s, s, RGB_CHANNELS]
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_vec(self) -> Vec<f32> {
    self.data.into_vec()
  }

  /// 按本机字节序展开，供需要原始缓冲区的后端使用
  pub fn to_ne_bytes(&self) -> Vec<u8> {
    self.data.iter().flat_map(|v| v.to_ne_bytes()).collect()
  }
}

/// 缩放 + 归一化
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
  input_size: u32,
  normalization: NormalizationMode,
}

impl Preprocessor {
  pub fn new(config: &PipelineConfig) -> Self {
    Self {
      input_size: config.input_size(),
      normalization: config.normalization(),
    }
  }

  pub fn preprocess(&self, image: &RgbImage) -> Tensor {
    let size = self.input_size;
    let resized;
    let source = if image.dimensions() == (size, size) {
      image
    } else {
      // Triangle 即双线性插值
      resized = imageops::resize(image, size, size, imageops::FilterType::Triangle);
      &resized
    };

    // 行优先，通道交错
    let data: Box<[f32]> = source
      .as_raw()
      .iter()
      .enumerate()
      .map(|(i, &value)| self.normalization.apply(i % RGB_CHANNELS, value))
      .collect();

    Tensor {
      data,
      input_size: size,
    }
  }
}

pub fn preprocess(image: &RgbImage, config: &PipelineConfig) -> Tensor {
  Preprocessor::new(config).preprocess(image)
}
