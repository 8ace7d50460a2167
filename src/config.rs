// 该文件是 Shoushi （手势） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

pub const DEFAULT_INPUT_SIZE: u32 = 224;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MIN_DETECTION_SIZE: f32 = 24.0;
pub const DEFAULT_MAX_INFERENCE_THREADS: usize = 4;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2000;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("输入尺寸必须大于 0")]
  ZeroInputSize,
  #[error("置信度阈值无效: {0}, 应位于 [0, 1]")]
  InvalidThreshold(f32),
  #[error("最小检测尺寸无效: {0}")]
  InvalidMinDetectionSize(f32),
  #[error("归一化参数无效: {0}")]
  InvalidNormalization(String),
  #[error("推理线程上限必须大于 0")]
  InvalidThreadCount,
  #[error("标签表为空")]
  EmptyLabels,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 模型输入画面映射到显示区域的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
  /// 等比放大铺满显示区域，超出部分裁掉（fill-center）
  #[default]
  Cover,
  /// 等比缩放完整显示，空余部分留黑边（fit-center）
  Contain,
}

/// 像素值归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
  /// value / 255
  #[default]
  ZeroToOne,
  /// 不做缩放，直接输入 0-255 浮点值
  Raw,
  /// (value - mean[c]) / std[c]，mean/std 以 0-255 像素值为单位
  MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl NormalizationMode {
  /// ImageNet 均值/标准差（按 0-255 像素值换算）
  pub const IMAGENET: NormalizationMode = NormalizationMode::MeanStd {
    mean: [123.675, 116.28, 103.53],
    std: [58.395, 57.12, 57.375],
  };

  #[inline]
  pub fn apply(&self, channel: usize, value: u8) -> f32 {
    let value = value as f32;
    match self {
      NormalizationMode::ZeroToOne => value / 255.0,
      NormalizationMode::Raw => value,
      NormalizationMode::MeanStd { mean, std } => (value - mean[channel]) / std[channel],
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if let NormalizationMode::MeanStd { mean, std } = self {
      if mean.iter().any(|m| !m.is_finite()) {
        return Err(ConfigError::InvalidNormalization(format!(
          "均值必须为有限数: {:?}",
          mean
        )));
      }
      if std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(ConfigError::InvalidNormalization(format!(
          "标准差必须为正的有限数: {:?}",
          std
        )));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorPreference {
  #[default]
  PreferHardware,
  CpuOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensFacing {
  Front,
  #[default]
  Back,
}

impl LensFacing {
  /// 前置摄像头的预览画面是镜像的
  pub fn is_mirrored(&self) -> bool {
    matches!(self, LensFacing::Front)
  }

  pub fn toggled(&self) -> Self {
    match self {
      LensFacing::Front => LensFacing::Back,
      LensFacing::Back => LensFacing::Front,
    }
  }
}

/// 模型边框输出的坐标顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxOrder {
  #[default]
  LeftTopRightBottom,
  TopLeftBottomRight,
}

impl BoxOrder {
  /// 转换为 [left, top, right, bottom]
  pub fn to_ltrb(&self, raw: [f32; 4]) -> [f32; 4] {
    match self {
      BoxOrder::LeftTopRightBottom => raw,
      BoxOrder::TopLeftBottomRight => [raw[1], raw[0], raw[3], raw[2]],
    }
  }
}

/// 单帧处理失败时对已发布叠加层的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameErrorPolicy {
  /// 保留上一次发布的结果
  #[default]
  KeepPrevious,
  /// 发布空结果
  Clear,
}

/// 标签表，下标与模型分类输出一一对应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  labels: Arc<[String]>,
}

impl LabelTable {
  pub fn new<I, S>(labels: I) -> Result<Self, ConfigError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
    if labels.is_empty() {
      return Err(ConfigError::EmptyLabels);
    }
    Ok(LabelTable {
      labels: labels.into(),
    })
  }

  /// 每行一个标签，忽略空行与首尾空白
  pub fn parse(text: &str) -> Result<Self, ConfigError> {
    Self::new(
      text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty()),
    )
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.labels.get(index).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.labels.iter().map(String::as_str)
  }
}

impl FromStr for LabelTable {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl FromUrlWithScheme for LabelTable {
  const SCHEME: &'static str = "file";
}

impl FromUrl for LabelTable {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    info!("加载标签文件: {}", url.path());
    let text = std::fs::read_to_string(url.path())?;
    let labels = Self::parse(&text)?;
    debug!("标签数量: {}", labels.len());
    Ok(labels)
  }
}

/// 不可变的流水线配置，构建后传入每个组件
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  input_size: u32,
  normalization: NormalizationMode,
  confidence_threshold: f32,
  min_detection_size: f32,
  fill_policy: FillPolicy,
  accelerator: AcceleratorPreference,
  lens_facing: LensFacing,
  box_order: BoxOrder,
  frame_error_policy: FrameErrorPolicy,
  max_inference_threads: usize,
  shutdown_timeout: Duration,
  labels: LabelTable,
}

impl PipelineConfig {
  pub fn builder() -> PipelineConfigBuilder {
    PipelineConfigBuilder::default()
  }

  pub fn input_size(&self) -> u32 {
    self.input_size
  }

  /// 张量元素个数 3 × S × S
  pub fn tensor_len(&self) -> usize {
    3 * self.input_size as usize * self.input_size as usize
  }

  pub fn normalization(&self) -> NormalizationMode {
    self.normalization
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  pub fn min_detection_size(&self) -> f32 {
    self.min_detection_size
  }

  pub fn fill_policy(&self) -> FillPolicy {
    self.fill_policy
  }

  pub fn accelerator(&self) -> AcceleratorPreference {
    self.accelerator
  }

  pub fn lens_facing(&self) -> LensFacing {
    self.lens_facing
  }

  pub fn box_order(&self) -> BoxOrder {
    self.box_order
  }

  pub fn frame_error_policy(&self) -> FrameErrorPolicy {
    self.frame_error_policy
  }

  pub fn max_inference_threads(&self) -> usize {
    self.max_inference_threads
  }

  pub fn shutdown_timeout(&self) -> Duration {
    self.shutdown_timeout
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }
}

/// 配置构建器，所有字段均可从 JSON 读入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfigBuilder {
  input_size: u32,
  normalization: NormalizationMode,
  confidence_threshold: f32,
  min_detection_size: f32,
  fill_policy: FillPolicy,
  accelerator: AcceleratorPreference,
  lens_facing: LensFacing,
  box_order: BoxOrder,
  frame_error_policy: FrameErrorPolicy,
  max_inference_threads: usize,
  shutdown_timeout_ms: u64,
  #[serde(skip)]
  labels: Option<LabelTable>,
}

impl Default for PipelineConfigBuilder {
  fn default() -> Self {
    Self {
      input_size: DEFAULT_INPUT_SIZE,
      normalization: NormalizationMode::default(),
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      min_detection_size: DEFAULT_MIN_DETECTION_SIZE,
      fill_policy: FillPolicy::default(),
      accelerator: AcceleratorPreference::default(),
      lens_facing: LensFacing::default(),
      box_order: BoxOrder::default(),
      frame_error_policy: FrameErrorPolicy::default(),
      max_inference_threads: DEFAULT_MAX_INFERENCE_THREADS,
      shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
      labels: None,
    }
  }
}

impl PipelineConfigBuilder {
  pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Self::from_json_str(&text)
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn normalization(mut self, normalization: NormalizationMode) -> Self {
    self.normalization = normalization;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn min_detection_size(mut self, size: f32) -> Self {
    self.min_detection_size = size;
    self
  }

  pub fn fill_policy(mut self, policy: FillPolicy) -> Self {
    self.fill_policy = policy;
    self
  }

  pub fn accelerator(mut self, accelerator: AcceleratorPreference) -> Self {
    self.accelerator = accelerator;
    self
  }

  pub fn lens_facing(mut self, lens_facing: LensFacing) -> Self {
    self.lens_facing = lens_facing;
    self
  }

  pub fn box_order(mut self, box_order: BoxOrder) -> Self {
    self.box_order = box_order;
    self
  }

  pub fn frame_error_policy(mut self, policy: FrameErrorPolicy) -> Self {
    self.frame_error_policy = policy;
    self
  }

  pub fn max_inference_threads(mut self, threads: usize) -> Self {
    self.max_inference_threads = threads;
    self
  }

  pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn labels(mut self, labels: LabelTable) -> Self {
    self.labels = Some(labels);
    self
  }

  pub fn build(self) -> Result<PipelineConfig, ConfigError> {
    if self.input_size == 0 {
      return Err(ConfigError::ZeroInputSize);
    }
    if !(0.0..=1.0).contains(&self.confidence_threshold) {
      return Err(ConfigError::InvalidThreshold(self.confidence_threshold));
    }
    if !self.min_detection_size.is_finite() || self.min_detection_size < 0.0 {
      return Err(ConfigError::InvalidMinDetectionSize(
        self.min_detection_size,
      ));
    }
    if self.max_inference_threads == 0 {
      return Err(ConfigError::InvalidThreadCount);
    }
    self.normalization.validate()?;
    let labels = self.labels.ok_or(ConfigError::EmptyLabels)?;

    Ok(PipelineConfig {
      input_size: self.input_size,
      normalization: self.normalization,
      confidence_threshold: self.confidence_threshold,
      min_detection_size: self.min_detection_size,
      fill_policy: self.fill_policy,
      accelerator: self.accelerator,
      lens_facing: self.lens_facing,
      box_order: self.box_order,
      frame_error_policy: self.frame_error_policy,
      max_inference_threads: self.max_inference_threads,
      shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
      labels,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels() -> LabelTable {
    LabelTable::parse("fist\npalm\nthumbs_up\n").unwrap()
  }

  #[test]
  fn defaults_follow_the_documented_surface() {
    let config = PipelineConfig::builder().labels(labels()).build().unwrap();
    assert_eq!(config.input_size(), 224);
    assert_eq!(config.confidence_threshold(), 0.5);
    assert_eq!(config.min_detection_size(), DEFAULT_MIN_DETECTION_SIZE);
    assert_eq!(config.fill_policy(), FillPolicy::Cover);
    assert_eq!(config.normalization(), NormalizationMode::ZeroToOne);
    assert_eq!(config.accelerator(), AcceleratorPreference::PreferHardware);
    assert_eq!(config.lens_facing(), LensFacing::Back);
    assert_eq!(config.box_order(), BoxOrder::LeftTopRightBottom);
    assert_eq!(config.frame_error_policy(), FrameErrorPolicy::KeepPrevious);
    assert_eq!(config.tensor_len(), 3 * 224 * 224);
    assert_eq!(config.shutdown_timeout(), Duration::from_millis(2000));
  }

  #[test]
  fn label_table_trims_and_skips_blank_lines() {
    let table = LabelTable::parse("  fist \r\n\npalm\n\n").unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(0), Some("fist"));
    assert_eq!(table.get(1), Some("palm"));
    assert_eq!(table.get(2), None);
  }

  #[test]
  fn empty_label_table_is_rejected() {
    assert!(matches!(
      LabelTable::parse("\n  \n"),
      Err(ConfigError::EmptyLabels)
    ));
    assert!(matches!(
      PipelineConfig::builder().build(),
      Err(ConfigError::EmptyLabels)
    ));
  }

  #[test]
  fn invalid_values_fail_to_build() {
    let base = || PipelineConfig::builder().labels(labels());
    assert!(matches!(
      base().input_size(0).build(),
      Err(ConfigError::ZeroInputSize)
    ));
    assert!(matches!(
      base().confidence_threshold(1.5).build(),
      Err(ConfigError::InvalidThreshold(_))
    ));
    assert!(matches!(
      base().confidence_threshold(f32::NAN).build(),
      Err(ConfigError::InvalidThreshold(_))
    ));
    assert!(matches!(
      base().min_detection_size(-1.0).build(),
      Err(ConfigError::InvalidMinDetectionSize(_))
    ));
    assert!(matches!(
      base()
        .normalization(NormalizationMode::MeanStd {
          mean: [0.0; 3],
          std: [1.0, 0.0, 1.0],
        })
        .build(),
      Err(ConfigError::InvalidNormalization(_))
    ));
    assert!(matches!(
      base().max_inference_threads(0).build(),
      Err(ConfigError::InvalidThreadCount)
    ));
  }

  #[test]
  fn json_overrides_only_given_keys() {
    let builder = PipelineConfigBuilder::from_json_str(
      r#"{
        "input_size": 320,
        "fill_policy": "contain",
        "normalization": { "mean_std": { "mean": [127.5, 127.5, 127.5], "std": [127.5, 127.5, 127.5] } },
        "lens_facing": "front",
        "box_order": "top_left_bottom_right",
        "frame_error_policy": "clear"
      }"#,
    )
    .unwrap();
    let config = builder.labels(labels()).build().unwrap();
    assert_eq!(config.input_size(), 320);
    assert_eq!(config.fill_policy(), FillPolicy::Contain);
    assert_eq!(config.lens_facing(), LensFacing::Front);
    assert_eq!(config.box_order(), BoxOrder::TopLeftBottomRight);
    assert_eq!(config.frame_error_policy(), FrameErrorPolicy::Clear);
    assert_eq!(config.confidence_threshold(), 0.5);
    assert_eq!(
      config.normalization(),
      NormalizationMode::MeanStd {
        mean: [127.5; 3],
        std: [127.5; 3]
      }
    );
  }

  #[test]
  fn normalization_modes() {
    assert_eq!(NormalizationMode::ZeroToOne.apply(0, 255), 1.0);
    assert_eq!(NormalizationMode::Raw.apply(1, 128), 128.0);
    let mode = NormalizationMode::MeanStd {
      mean: [100.0, 0.0, 0.0],
      std: [2.0, 1.0, 1.0],
    };
    assert_eq!(mode.apply(0, 110), 5.0);
  }

  #[test]
  fn box_order_reorders_to_ltrb() {
    let raw = [0.1, 0.2, 0.3, 0.4];
    assert_eq!(BoxOrder::LeftTopRightBottom.to_ltrb(raw), raw);
    assert_eq!(
      BoxOrder::TopLeftBottomRight.to_ltrb(raw),
      [0.2, 0.1, 0.4, 0.3]
    );
  }

  #[test]
  fn lens_mirroring() {
    assert!(LensFacing::Front.is_mirrored());
    assert!(!LensFacing::Back.is_mirrored());
    assert_eq!(LensFacing::Back.toggled(), LensFacing::Front);
  }
}
