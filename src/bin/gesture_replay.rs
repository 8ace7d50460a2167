// 该文件是 Shoushi （手势） 项目的一部分。
// src/bin/gesture_replay.rs - 回放 YUV 录像并输出手势识别结果
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use url::Url;

use shoushi::{
  FromUrl,
  config::{LabelTable, LensFacing, PipelineConfigBuilder},
  input::YuvFileInput,
  model::{ModelBuffer, OrtLoader},
  output::OutputWrapper,
  task::ReplayTask,
};
use tracing::info;

fn parse_display(value: &str) -> Result<(u32, u32), String> {
  let (width, height) = value
    .split_once(['x', 'X'])
    .ok_or_else(|| format!("显示尺寸格式应为 WxH: {}", value))?;
  let width = width.trim().parse().map_err(|e| format!("宽度无效: {}", e))?;
  let height = height.trim().parse().map_err(|e| format!("高度无效: {}", e))?;
  Ok((width, height))
}

/// Shoushi 手势识别回放参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型文件，例如 file:///models/gesture.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 标签文件，每行一个标签
  #[arg(long, value_name = "LABELS")]
  pub labels: Url,
  /// 输入来源，例如 nv21:///data/capture.yuv?width=640&height=480&rotation=90
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，json:///path/overlay.json 或 log:
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// JSON 配置文件
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 显示尺寸
  #[arg(long, value_name = "WxH", default_value = "1080x1920", value_parser = parse_display)]
  pub display: (u32, u32),
  /// 使用前置镜头（画面镜像）
  #[arg(long)]
  pub front: bool,
  /// 送帧帧率，不指定则尽快送帧
  #[arg(long, value_name = "FPS")]
  pub fps: Option<f64>,
  /// 逐帧等待处理完成，不丢帧
  #[arg(long)]
  pub lockstep: bool,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("标签文件路径: {}", args.labels);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let builder = match &args.config {
    Some(path) => PipelineConfigBuilder::from_json_file(path)?,
    None => PipelineConfigBuilder::default(),
  };
  let builder = if args.front {
    builder.lens_facing(LensFacing::Front)
  } else {
    builder
  };
  let config = builder.labels(LabelTable::from_url(&args.labels)?).build()?;
  info!("标签数量: {}", config.labels().len());

  let model = ModelBuffer::from_url(&args.model)?;
  let input = YuvFileInput::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let (width, height) = args.display;
  ReplayTask::default()
    .with_frame_number(args.frame_number)
    .with_fps(args.fps)
    .with_lockstep(args.lockstep)
    .with_display(width, height)
    .run_task(&OrtLoader::new(), model.as_bytes(), config, input, output)?;

  Ok(())
}
