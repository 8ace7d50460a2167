// 该文件是 Shoushi （手势） 项目的一部分。
// src/pipeline.rs - 流水线控制器
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

//! 单槽位、丢弃最新帧的处理流水线
//!
//! 取帧线程调用 [`FrameAdmission::submit`]，若工作线程空闲则帧进入容量为 1 的信箱，
//! 否则立即丢弃（释放回调随之触发）。工作线程独占推理引擎，依次执行
//! 转换、预处理、推理、变换、发布，之后回到空闲。

use std::{
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::{FrameErrorPolicy, LensFacing, PipelineConfig},
  convert::{ConvertError, FrameConverter},
  frame::Frame,
  model::{BackendLoader, EngineError, InferenceBackend, InferenceEngine},
  output::{OverlaySink, OverlayState},
  preprocess::Preprocessor,
  transform::{Rejection, TransformedDetection, Viewport, transform_for},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("推理引擎初始化失败: {0}")]
  Init(#[from] EngineError),
  #[error("无法创建工作线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("等待工作线程空闲超时 ({0:?})")]
  ShutdownTimeout(Duration),
  #[error("工作线程异常退出")]
  WorkerPanicked,
}

/// 帧被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
  /// 上一帧仍在处理
  Busy,
  /// 流水线正在关闭或已关闭
  ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Accepted,
  Dropped(DropReason),
}

/// 单帧处理中失败的阶段
#[derive(Error, Debug)]
pub enum StageError {
  #[error("帧转换失败: {0}")]
  Convert(#[from] ConvertError),
  #[error("推理失败: {0}")]
  Inference(#[from] EngineError),
  #[error("检测结果无效: {0}")]
  Geometry(Rejection),
}

/// 单帧处理结果
#[derive(Debug)]
pub enum FrameOutcome {
  Detected(TransformedDetection),
  /// 低置信度、未知类别或检测框过小，发布空叠加层
  Rejected(Rejection),
  /// 按 `FrameErrorPolicy` 处理
  Failed(StageError),
  /// 进入推理前发现正在关闭
  Cancelled,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
  accepted: AtomicU64,
  dropped_busy: AtomicU64,
  dropped_shutdown: AtomicU64,
  detected: AtomicU64,
  rejected: AtomicU64,
  failed: AtomicU64,
  published: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  pub accepted: u64,
  pub dropped_busy: u64,
  pub dropped_shutdown: u64,
  pub detected: u64,
  pub rejected: u64,
  pub failed: u64,
  pub published: u64,
}

impl PipelineStats {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      accepted: self.accepted.load(Ordering::Relaxed),
      dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
      dropped_shutdown: self.dropped_shutdown.load(Ordering::Relaxed),
      detected: self.detected.load(Ordering::Relaxed),
      rejected: self.rejected.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      published: self.published.load(Ordering::Relaxed),
    }
  }
}

struct Shared {
  /// 关闭时取走，之后不可能再有帧进入信箱
  mailbox: Mutex<Option<Sender<Frame>>>,
  busy: AtomicBool,
  stopping: AtomicBool,
  viewport: Mutex<Viewport>,
  stats: PipelineStats,
}

impl Shared {
  fn viewport(&self) -> Viewport {
    *self.viewport.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn update_viewport(&self, update: impl FnOnce(&mut Viewport)) -> Viewport {
    let mut viewport = self.viewport.lock().unwrap_or_else(PoisonError::into_inner);
    update(&mut viewport);
    *viewport
  }
}

/// 取帧线程持有的准入句柄
#[derive(Clone)]
pub struct FrameAdmission {
  shared: Arc<Shared>,
}

impl FrameAdmission {
  /// 提交一帧，从不阻塞；被丢弃的帧在返回前释放
  pub fn submit(&self, frame: Frame) -> Admission {
    let (admission, rejected) = self.try_admit(frame);
    // 释放回调在信箱锁之外执行
    drop(rejected);
    admission
  }

  fn try_admit(&self, frame: Frame) -> (Admission, Option<Frame>) {
    let mailbox = self
      .shared
      .mailbox
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let Some(sender) = mailbox.as_ref() else {
      PipelineStats::bump(&self.shared.stats.dropped_shutdown);
      return (Admission::Dropped(DropReason::ShuttingDown), Some(frame));
    };

    if self
      .shared
      .busy
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      PipelineStats::bump(&self.shared.stats.dropped_busy);
      debug!("工作线程忙，丢弃第 {} 帧", frame.sequence());
      return (Admission::Dropped(DropReason::Busy), Some(frame));
    }

    match sender.try_send(frame) {
      Ok(()) => {
        PipelineStats::bump(&self.shared.stats.accepted);
        (Admission::Accepted, None)
      }
      Err(TrySendError::Full(frame)) => {
        // 信箱中的帧仍会被处理并清除忙标志
        PipelineStats::bump(&self.shared.stats.dropped_busy);
        debug!("信箱已满，丢弃第 {} 帧", frame.sequence());
        (Admission::Dropped(DropReason::Busy), Some(frame))
      }
      Err(TrySendError::Disconnected(frame)) => {
        self.shared.busy.store(false, Ordering::Release);
        PipelineStats::bump(&self.shared.stats.dropped_shutdown);
        warn!("工作线程已退出，丢弃第 {} 帧", frame.sequence());
        (Admission::Dropped(DropReason::ShuttingDown), Some(frame))
      }
    }
  }

  pub fn is_accepting(&self) -> bool {
    self
      .shared
      .mailbox
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  pub fn is_busy(&self) -> bool {
    self.shared.busy.load(Ordering::Acquire)
  }
}

/// 流水线控制器
///
/// 初始化与关闭期间独占推理引擎，运行期间引擎归工作线程所有。
pub struct PipelineController<B: InferenceBackend + 'static> {
  admission: FrameAdmission,
  worker: Option<JoinHandle<InferenceEngine<B>>>,
  exited: Receiver<()>,
  shutdown_timeout: Duration,
}

impl<B: InferenceBackend + 'static> PipelineController<B> {
  /// 初始化推理引擎并启动流水线，初始化失败时流水线不启动
  pub fn launch<L>(
    loader: &L,
    model: &[u8],
    config: PipelineConfig,
    display: (u32, u32),
    sink: Arc<dyn OverlaySink>,
  ) -> Result<Self, PipelineError>
  where
    L: BackendLoader<Backend = B>,
  {
    let engine = InferenceEngine::initialize(loader, model, &config)?;
    Self::start(engine, config, display, sink)
  }

  pub fn start(
    engine: InferenceEngine<B>,
    config: PipelineConfig,
    display: (u32, u32),
    sink: Arc<dyn OverlaySink>,
  ) -> Result<Self, PipelineError> {
    let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Frame>(1);
    let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);

    let shared = Arc::new(Shared {
      mailbox: Mutex::new(Some(frame_tx)),
      busy: AtomicBool::new(false),
      stopping: AtomicBool::new(false),
      viewport: Mutex::new(Viewport::new(display.0, display.1, config.lens_facing())),
      stats: PipelineStats::default(),
    });

    let shutdown_timeout = config.shutdown_timeout();
    let worker = Worker {
      converter: FrameConverter::new(),
      preprocessor: Preprocessor::new(&config),
      engine,
      config,
      shared: shared.clone(),
      sink,
      generation: 0,
    };

    let handle = thread::Builder::new()
      .name("gesture-worker".to_string())
      .spawn(move || {
        // 线程结束（包括 panic）时断开，通知关闭流程
        let _exit = exit_tx;
        worker.run(frame_rx)
      })?;

    let (width, height) = display;
    info!("流水线已启动，显示尺寸 {}x{}", width, height);

    Ok(Self {
      admission: FrameAdmission { shared },
      worker: Some(handle),
      exited,
      shutdown_timeout,
    })
  }

  pub fn admission(&self) -> FrameAdmission {
    self.admission.clone()
  }

  pub fn submit(&self, frame: Frame) -> Admission {
    self.admission.submit(frame)
  }

  pub fn set_display_size(&self, width: u32, height: u32) {
    let viewport = self.admission.shared.update_viewport(|v| {
      v.width = width;
      v.height = height;
    });
    debug!("显示尺寸更新为 {}x{}", viewport.width, viewport.height);
  }

  pub fn set_lens_facing(&self, lens_facing: LensFacing) {
    self
      .admission
      .shared
      .update_viewport(|v| v.lens_facing = lens_facing);
    info!("切换镜头: {:?}", lens_facing);
  }

  /// 前后镜头互换，返回切换后的朝向
  pub fn toggle_lens_facing(&self) -> LensFacing {
    let viewport = self
      .admission
      .shared
      .update_viewport(|v| v.lens_facing = v.lens_facing.toggled());
    info!("切换镜头: {:?}", viewport.lens_facing);
    viewport.lens_facing
  }

  pub fn viewport(&self) -> Viewport {
    self.admission.shared.viewport()
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.admission.shared.stats.snapshot()
  }

  /// 关闭流水线
  ///
  /// 1. 停止准入; 2. 在超时内等待工作线程回到空闲并退出; 3. 释放推理引擎。
  /// 超时后工作线程在当前推理结束时自行释放引擎。
  pub fn shutdown(mut self) -> Result<StatsSnapshot, PipelineError> {
    self.stop()?;
    Ok(self.stats())
  }

  fn stop(&mut self) -> Result<(), PipelineError> {
    let Some(handle) = self.worker.take() else {
      return Ok(());
    };

    info!("关闭流水线...");
    let shared = &self.admission.shared;
    shared.stopping.store(true, Ordering::SeqCst);
    // 丢弃唯一的发送端，工作线程处理完当前帧后退出
    drop(
      shared
        .mailbox
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take(),
    );

    let now = Instant::now();
    match self.exited.recv_timeout(self.shutdown_timeout) {
      Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
      Err(RecvTimeoutError::Timeout) => {
        error!(
          "工作线程未在 {:?} 内回到空闲，放弃等待",
          self.shutdown_timeout
        );
        return Err(PipelineError::ShutdownTimeout(self.shutdown_timeout));
      }
    }

    let mut engine = handle.join().map_err(|_| {
      error!("工作线程异常退出");
      PipelineError::WorkerPanicked
    })?;
    engine.release();
    info!("流水线已关闭，耗时: {:.2?}", now.elapsed());
    Ok(())
  }
}

impl<B: InferenceBackend + 'static> Drop for PipelineController<B> {
  fn drop(&mut self) {
    if let Err(e) = self.stop() {
      warn!("关闭流水线失败: {}", e);
    }
  }
}

struct Worker<B: InferenceBackend> {
  converter: FrameConverter,
  preprocessor: Preprocessor,
  engine: InferenceEngine<B>,
  config: PipelineConfig,
  shared: Arc<Shared>,
  sink: Arc<dyn OverlaySink>,
  generation: u64,
}

impl<B: InferenceBackend> Worker<B> {
  fn run(mut self, frames: Receiver<Frame>) -> InferenceEngine<B> {
    debug!("工作线程启动");
    for frame in frames.iter() {
      let sequence = frame.sequence();
      let outcome = self.process(frame);
      self.publish(sequence, outcome);
      self.shared.busy.store(false, Ordering::Release);
    }
    debug!("工作线程退出");
    self.engine
  }

  fn process(&mut self, frame: Frame) -> FrameOutcome {
    let started = Instant::now();

    let image = match self.converter.convert(&frame) {
      Ok(image) => image,
      Err(e) => return FrameOutcome::Failed(e.into()),
    };
    drop(frame);
    let converted = started.elapsed();

    let tensor = self.preprocessor.preprocess(&image);
    drop(image);
    let preprocessed = started.elapsed();

    if self.shared.stopping.load(Ordering::SeqCst) {
      return FrameOutcome::Cancelled;
    }

    let detection = match self.engine.infer(&tensor) {
      Ok(detection) => detection,
      Err(e) => return FrameOutcome::Failed(e.into()),
    };
    let inferred = started.elapsed();

    let viewport = self.shared.viewport();
    let outcome = match transform_for(&detection, &self.config, &viewport) {
      Ok(detection) => FrameOutcome::Detected(detection),
      Err(rejection @ (Rejection::DegenerateGeometry | Rejection::InvalidDisplay)) => {
        FrameOutcome::Failed(StageError::Geometry(rejection))
      }
      Err(rejection) => FrameOutcome::Rejected(rejection),
    };

    debug!(
      "阶段耗时: 转换 {:.2?} / 预处理 {:.2?} / 推理 {:.2?} / 变换 {:.2?}",
      converted,
      preprocessed - converted,
      inferred - preprocessed,
      started.elapsed() - inferred
    );
    outcome
  }

  fn publish(&mut self, sequence: u64, outcome: FrameOutcome) {
    let stats = &self.shared.stats;
    let detections = match outcome {
      FrameOutcome::Detected(detection) => {
        PipelineStats::bump(&stats.detected);
        debug!("第 {} 帧: {} {:.2}", sequence, detection.label, detection.confidence);
        vec![detection]
      }
      FrameOutcome::Rejected(rejection) => {
        PipelineStats::bump(&stats.rejected);
        debug!("第 {} 帧: {}", sequence, rejection);
        Vec::new()
      }
      FrameOutcome::Failed(e) => {
        PipelineStats::bump(&stats.failed);
        warn!("第 {} 帧处理失败: {}", sequence, e);
        match self.config.frame_error_policy() {
          FrameErrorPolicy::KeepPrevious => return,
          FrameErrorPolicy::Clear => Vec::new(),
        }
      }
      FrameOutcome::Cancelled => {
        debug!("正在关闭，跳过第 {} 帧", sequence);
        return;
      }
    };

    self.generation += 1;
    self
      .sink
      .publish(Arc::new(OverlayState::new(self.generation, sequence, detections)));
    PipelineStats::bump(&stats.published);
  }
}
