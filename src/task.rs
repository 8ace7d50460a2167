// 该文件是 Shoushi （手势） 项目的一部分。
// src/task.rs - 帧回放任务
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::{
  config::PipelineConfig,
  frame::Frame,
  model::BackendLoader,
  output::{OverlayChannel, OverlayReader, Render},
  pipeline::{Admission, FrameAdmission, PipelineController, StatsSnapshot},
};

const RENDER_POLL: Duration = Duration::from_millis(100);

/// 把帧序列按相机节奏送入流水线，并把发布的叠加层交给渲染器
#[derive(Debug, Clone)]
pub struct ReplayTask {
  frame_number: Option<usize>,
  fps: Option<f64>,
  lockstep: bool,
  display: (u32, u32),
}

impl Default for ReplayTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      fps: None,
      lockstep: false,
      display: (1080, 1920),
    }
  }
}

impl ReplayTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 按给定帧率送帧，None 表示不限速
  pub fn with_fps(mut self, fps: Option<f64>) -> Self {
    self.fps = fps.filter(|fps| *fps > 0.0);
    self
  }

  /// 每帧都等工作线程空闲后再送，不丢帧
  pub fn with_lockstep(mut self, lockstep: bool) -> Self {
    self.lockstep = lockstep;
    self
  }

  pub fn with_display(mut self, width: u32, height: u32) -> Self {
    self.display = (width, height);
    self
  }

  pub fn run_task<L, I, O>(
    self,
    loader: &L,
    model: &[u8],
    config: PipelineConfig,
    input: I,
    output: O,
  ) -> anyhow::Result<StatsSnapshot>
  where
    L: BackendLoader,
    L::Backend: 'static,
    I: Iterator<Item = Frame>,
    O: Render + Send,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    info!("开始任务...");
    let idle_timeout = config.shutdown_timeout();
    let channel = OverlayChannel::new();
    let reader = channel.reader();
    let pipeline = PipelineController::launch(loader, model, config, self.display, Arc::new(channel))
      .context("流水线启动失败")?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = stop_tx.try_send(());
    }) {
      warn!("无法设置中断处理: {}", e);
    }

    let done = AtomicBool::new(false);
    let stats = thread::scope(|scope| -> anyhow::Result<StatsSnapshot> {
      let (reader, done) = (&reader, &done);
      let renderer = scope.spawn(move || render_loop(reader, &output, done));

      let admission = pipeline.admission();
      let interval = self.fps.map(|fps| Duration::from_secs_f64(1.0 / fps));
      let mut next_tick = Instant::now();
      let mut frame_index = 0;
      for frame in input {
        frame_index += 1;
        if self.lockstep {
          wait_idle(&admission, idle_timeout);
        }
        match admission.submit(frame) {
          Admission::Accepted => debug!("第 {} 帧进入流水线", frame_index),
          Admission::Dropped(reason) => debug!("第 {} 帧被丢弃: {:?}", frame_index, reason),
        }

        if self.frame_number.is_some_and(|n| frame_index >= n) {
          info!("达到指定帧数 {}, 退出任务循环", frame_index);
          break;
        }
        if stop_rx.try_recv().is_ok() {
          warn!("中断信号接收，退出任务循环");
          break;
        }
        if let Some(interval) = interval {
          next_tick += interval;
          if let Some(delay) = next_tick.checked_duration_since(Instant::now()) {
            thread::sleep(delay);
          }
        }
      }

      // 最后一帧处理完再关闭，否则会在推理前被取消
      wait_idle(&admission, idle_timeout);
      let stats = pipeline.shutdown();
      done.store(true, Ordering::SeqCst);

      let rendered = renderer
        .join()
        .map_err(|_| anyhow::anyhow!("渲染线程异常退出"))?;
      let stats = stats?;
      rendered?;
      Ok(stats)
    })?;

    info!(
      "任务完成: 接收 {} 帧, 丢弃 {} 帧, 检测 {} 次, 发布 {} 次",
      stats.accepted,
      stats.dropped_busy + stats.dropped_shutdown,
      stats.detected,
      stats.published
    );
    Ok(stats)
  }
}

fn wait_idle(admission: &FrameAdmission, timeout: Duration) {
  let deadline = Instant::now() + timeout;
  while admission.is_busy() {
    if Instant::now() >= deadline {
      warn!("等待工作线程空闲超时");
      return;
    }
    thread::sleep(Duration::from_millis(1));
  }
}

fn render_loop<O>(reader: &OverlayReader, output: &O, done: &AtomicBool) -> anyhow::Result<()>
where
  O: Render,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  let mut seen = 0;
  loop {
    if let Some(state) = reader.wait_newer(seen, RENDER_POLL) {
      seen = state.generation;
      output.render_overlay(&state)?;
      continue;
    }
    if done.load(Ordering::SeqCst) {
      let state = reader.latest();
      if state.generation > seen {
        output.render_overlay(&state)?;
      }
      return Ok(());
    }
  }
}
