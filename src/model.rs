// 该文件是 Shoushi （手势） 项目的一部分。
// src/model.rs - 模型推理引擎
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

use std::{fmt, sync::Arc, time::Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::{AcceleratorPreference, BoxOrder, PipelineConfig},
  preprocess::Tensor,
};

#[cfg(feature = "onnxruntime")]
mod ort_backend;
#[cfg(feature = "onnxruntime")]
pub use self::ort_backend::{OrtBackend, OrtLoader};

/// 边框输出元素个数 [1, 4]
pub const BBOX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("模型无效: {0}")]
  InvalidModel(String),
  #[error("加速器错误: {0}")]
  Accelerator(String),
  #[error("推理执行错误: {0}")]
  Run(String),
  #[cfg(feature = "onnxruntime")]
  #[error("ONNX Runtime 错误: {0}")]
  Ort(#[from] ort::Error),
}

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型缓冲区为空")]
  EmptyModel,
  #[error("模型加载错误: {0}")]
  Load(BackendError),
  #[error("模型无效: {0}")]
  InvalidModel(String),
  #[error("标签数量 {labels} 与模型分类输出 {outputs} 不一致")]
  LabelMismatch { labels: usize, outputs: usize },
  #[error("输入张量长度不匹配: 期望 {expected}, 实际 {actual}")]
  InputShape { expected: usize, actual: usize },
  #[error("输出 {output} 长度不匹配: 期望 {expected}, 实际 {actual}")]
  OutputShape {
    output: usize,
    expected: usize,
    actual: usize,
  },
  #[error("推理错误: {0}")]
  Backend(#[from] BackendError),
  #[error("推理引擎已释放")]
  Released,
  #[error("模型读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 实际使用的执行后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
  Cpu,
  Hardware,
}

impl fmt::Display for Accelerator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Accelerator::Cpu => write!(f, "CPU"),
      Accelerator::Hardware => write!(f, "硬件加速"),
    }
  }
}

/// 创建推理会话时的参数，初始化后不再改变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
  pub accelerator: Accelerator,
  pub threads: usize,
  pub input_size: u32,
}

/// 一次前向推理的原始输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutputs {
  /// 输出 0: [1, 4] 归一化边框
  pub bbox: Vec<f32>,
  /// 输出 1: [1, N] 分类置信度
  pub scores: Vec<f32>,
}

/// 推理运行时。实现不要求可重入，引擎保证同一时刻只有一次调用。
pub trait InferenceBackend: Send {
  fn run(&mut self, input: &Tensor) -> Result<ModelOutputs, BackendError>;
}

/// 从模型缓冲区创建运行时
pub trait BackendLoader {
  type Backend: InferenceBackend;

  /// 运行时是否报告硬件加速器可用
  fn accelerator_available(&self) -> bool;

  fn load(&self, model: &[u8], options: &SessionOptions) -> Result<Self::Backend, BackendError>;
}

/// 单帧推理结果，边框为模型输入空间内的归一化 [left, top, right, bottom]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub class: Option<usize>,
  pub confidence: f32,
  pub bbox: [f32; 4],
}

impl Detection {
  pub fn none() -> Self {
    Self {
      class: None,
      confidence: 0.0,
      bbox: [0.0; 4],
    }
  }

  /// 无类别时为 -1
  pub fn class_index(&self) -> i64 {
    self.class.map(|c| c as i64).unwrap_or(-1)
  }
}

/// 取最大置信度的类别，并列时取最小下标，忽略 NaN
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
  let mut best: Option<(usize, f32)> = None;
  for (index, &score) in scores.iter().enumerate() {
    if score.is_nan() {
      continue;
    }
    match best {
      Some((_, best_score)) if score <= best_score => {}
      _ => best = Some((index, score)),
    }
  }
  best
}

/// 外部加载器提供的模型缓冲区，来源（内存映射或堆内存）对流水线透明
#[derive(Clone)]
pub struct ModelBuffer {
  bytes: Arc<[u8]>,
}

impl ModelBuffer {
  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

impl From<Vec<u8>> for ModelBuffer {
  fn from(bytes: Vec<u8>) -> Self {
    Self {
      bytes: bytes.into(),
    }
  }
}

impl fmt::Debug for ModelBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelBuffer")
      .field("len", &self.bytes.len())
      .finish()
  }
}

impl FromUrlWithScheme for ModelBuffer {
  const SCHEME: &'static str = "file";
}

impl FromUrl for ModelBuffer {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(EngineError::SchemeMismatch(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    info!("加载模型文件: {}", url.path());
    let bytes = std::fs::read(url.path())?;
    debug!(
      "模型文件大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(Self::from(bytes))
  }
}

/// 推理线程数: 预留一个核心给取帧线程，并限制上限
pub fn inference_threads(cap: usize) -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
    .saturating_sub(1)
    .clamp(1, cap.max(1))
}

/// 推理引擎，持有运行时（及其加速器）
///
/// `release` 之后句柄失效；引擎被丢弃时同样会释放运行时。
pub struct InferenceEngine<B: InferenceBackend> {
  backend: Option<B>,
  accelerator: Accelerator,
  threads: usize,
  box_order: BoxOrder,
  num_classes: usize,
  input_len: usize,
}

impl<B: InferenceBackend> InferenceEngine<B> {
  pub fn initialize<L>(loader: &L, model: &[u8], config: &PipelineConfig) -> Result<Self, EngineError>
  where
    L: BackendLoader<Backend = B>,
  {
    if model.is_empty() {
      error!("模型缓冲区为空");
      return Err(EngineError::EmptyModel);
    }

    let threads = inference_threads(config.max_inference_threads());
    let num_classes = config.labels().len();
    let input_size = config.input_size();
    let engine_for = |accelerator: Accelerator| -> Result<Self, EngineError> {
      let options = SessionOptions {
        accelerator,
        threads,
        input_size,
      };
      let backend = loader.load(model, &options).map_err(EngineError::Load)?;
      let mut engine = Self {
        backend: Some(backend),
        accelerator,
        threads,
        box_order: config.box_order(),
        num_classes,
        input_len: config.tensor_len(),
      };
      engine.warm_up(input_size)?;
      Ok(engine)
    };

    if config.accelerator() == AcceleratorPreference::PreferHardware {
      if loader.accelerator_available() {
        match engine_for(Accelerator::Hardware) {
          Ok(engine) => {
            info!("推理引擎已初始化: {}, {} 线程", engine.accelerator, threads);
            return Ok(engine);
          }
          // 标签与模型不一致时换后端也无济于事
          Err(e @ EngineError::LabelMismatch { .. }) => return Err(e),
          Err(e) => warn!("硬件加速初始化失败，回退到 CPU: {}", e),
        }
      } else {
        info!("运行时未报告可用的硬件加速器，使用 CPU");
      }
    }

    let engine = engine_for(Accelerator::Cpu)?;
    info!("推理引擎已初始化: {}, {} 线程", engine.accelerator, threads);
    Ok(engine)
  }

  /// 用全零张量跑一次，校验输出形状与标签表一致
  fn warm_up(&mut self, input_size: u32) -> Result<(), EngineError> {
    let tensor = Tensor::zeros(input_size);
    let now = Instant::now();
    match self.infer(&tensor) {
      Ok(_) => {
        debug!("预热推理完成，耗时: {:.2?}", now.elapsed());
        Ok(())
      }
      Err(EngineError::OutputShape {
        output: 1, actual, ..
      }) => Err(EngineError::LabelMismatch {
        labels: self.num_classes,
        outputs: actual,
      }),
      Err(EngineError::OutputShape {
        output,
        expected,
        actual,
      }) => Err(EngineError::InvalidModel(format!(
        "输出 {} 长度应为 {}, 实际为 {}",
        output, expected, actual
      ))),
      Err(e) => Err(e),
    }
  }

  pub fn infer(&mut self, tensor: &Tensor) -> Result<Detection, EngineError> {
    let Some(backend) = self.backend.as_mut() else {
      debug_assert!(false, "推理引擎释放后仍被调用");
      error!("推理引擎释放后仍被调用");
      return Err(EngineError::Released);
    };

    if tensor.len() != self.input_len {
      return Err(EngineError::InputShape {
        expected: self.input_len,
        actual: tensor.len(),
      });
    }

    let outputs = backend.run(tensor)?;

    if outputs.bbox.len() != BBOX_LEN {
      return Err(EngineError::OutputShape {
        output: 0,
        expected: BBOX_LEN,
        actual: outputs.bbox.len(),
      });
    }
    if outputs.scores.len() != self.num_classes {
      return Err(EngineError::OutputShape {
        output: 1,
        expected: self.num_classes,
        actual: outputs.scores.len(),
      });
    }

    let raw = [
      outputs.bbox[0],
      outputs.bbox[1],
      outputs.bbox[2],
      outputs.bbox[3],
    ];
    let detection = match argmax(&outputs.scores) {
      Some((class, confidence)) => Detection {
        class: Some(class),
        confidence,
        bbox: self.box_order.to_ltrb(raw),
      },
      None => Detection::none(),
    };
    debug!("推理结果: {:?}", detection);
    Ok(detection)
  }

  /// 释放运行时，可重复调用
  pub fn release(&mut self) {
    if let Some(backend) = self.backend.take() {
      drop(backend);
      info!("推理引擎已释放 ({})", self.accelerator);
    }
  }

  pub fn is_released(&self) -> bool {
    self.backend.is_none()
  }

  pub fn accelerator(&self) -> Accelerator {
    self.accelerator
  }

  pub fn threads(&self) -> usize {
    self.threads
  }
}

impl<B: InferenceBackend> Drop for InferenceEngine<B> {
  fn drop(&mut self) {
    self.release();
  }
}

impl<B: InferenceBackend> fmt::Debug for InferenceEngine<B> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InferenceEngine")
      .field("accelerator", &self.accelerator)
      .field("threads", &self.threads)
      .field("released", &self.is_released())
      .finish()
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  };

  use super::*;

  /// 按脚本返回输出的测试运行时
  pub struct ScriptedBackend {
    pub outputs: Script,
    pub runs: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
  }

  impl InferenceBackend for ScriptedBackend {
    fn run(&mut self, _input: &Tensor) -> Result<ModelOutputs, BackendError> {
      self.runs.fetch_add(1, Ordering::SeqCst);
      let mut script = self.outputs.lock().unwrap();
      (*script)()
    }
  }

  impl Drop for ScriptedBackend {
    fn drop(&mut self) {
      self.released.store(true, Ordering::SeqCst);
    }
  }

  type Script = Arc<Mutex<Box<dyn FnMut() -> Result<ModelOutputs, BackendError> + Send>>>;

  pub struct ScriptedLoader {
    pub accelerator_available: bool,
    pub fail_hardware: bool,
    pub script: Script,
    pub runs: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
    pub loads: Mutex<Vec<SessionOptions>>,
  }

  impl ScriptedLoader {
    pub fn new<F>(script: F) -> Self
    where
      F: FnMut() -> Result<ModelOutputs, BackendError> + Send + 'static,
    {
      Self {
        accelerator_available: false,
        fail_hardware: false,
        script: Arc::new(Mutex::new(Box::new(script))),
        runs: Arc::new(AtomicUsize::new(0)),
        released: Arc::new(AtomicBool::new(false)),
        loads: Mutex::new(Vec::new()),
      }
    }

    /// 每次推理都返回同样的输出
    pub fn constant(bbox: [f32; 4], scores: Vec<f32>) -> Self {
      Self::new(move || {
        Ok(ModelOutputs {
          bbox: bbox.to_vec(),
          scores: scores.clone(),
        })
      })
    }
  }

  impl BackendLoader for ScriptedLoader {
    type Backend = ScriptedBackend;

    fn accelerator_available(&self) -> bool {
      self.accelerator_available
    }

    fn load(&self, _model: &[u8], options: &SessionOptions) -> Result<ScriptedBackend, BackendError> {
      self.loads.lock().unwrap().push(*options);
      if options.accelerator == Accelerator::Hardware && self.fail_hardware {
        return Err(BackendError::Accelerator("delegate 创建失败".to_string()));
      }
      Ok(ScriptedBackend {
        outputs: self.script.clone(),
        runs: self.runs.clone(),
        released: self.released.clone(),
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::Ordering;

  use super::{testing::ScriptedLoader, *};
  use crate::config::{AcceleratorPreference, LabelTable};

  const MODEL: &[u8] = b"model";

  fn config(accelerator: AcceleratorPreference, box_order: BoxOrder) -> PipelineConfig {
    PipelineConfig::builder()
      .input_size(8)
      .accelerator(accelerator)
      .box_order(box_order)
      .labels(LabelTable::parse("fist\npalm\nok").unwrap())
      .build()
      .unwrap()
  }

  fn default_config() -> PipelineConfig {
    config(AcceleratorPreference::CpuOnly, BoxOrder::LeftTopRightBottom)
  }

  #[test]
  fn argmax_prefers_lowest_index_on_ties_and_skips_nan() {
    assert_eq!(argmax(&[0.2, 0.7, 0.7, 0.1]), Some((1, 0.7)));
    assert_eq!(argmax(&[f32::NAN, 0.3]), Some((1, 0.3)));
    assert_eq!(argmax(&[]), None);
    assert_eq!(argmax(&[f32::NAN]), None);
  }

  #[test]
  fn infer_selects_best_class() {
    let loader = ScriptedLoader::constant([0.1, 0.2, 0.6, 0.8], vec![0.05, 0.91, 0.04]);
    let mut engine = InferenceEngine::initialize(&loader, MODEL, &default_config()).unwrap();
    let detection = engine.infer(&Tensor::zeros(8)).unwrap();
    assert_eq!(detection.class, Some(1));
    assert_eq!(detection.class_index(), 1);
    assert_eq!(detection.confidence, 0.91);
    assert_eq!(detection.bbox, [0.1, 0.2, 0.6, 0.8]);
  }

  #[test]
  fn box_order_is_configurable() {
    let loader = ScriptedLoader::constant([0.2, 0.1, 0.8, 0.6], vec![0.9, 0.0, 0.0]);
    let config = config(AcceleratorPreference::CpuOnly, BoxOrder::TopLeftBottomRight);
    let mut engine = InferenceEngine::initialize(&loader, MODEL, &config).unwrap();
    let detection = engine.infer(&Tensor::zeros(8)).unwrap();
    assert_eq!(detection.bbox, [0.1, 0.2, 0.6, 0.8]);
  }

  #[test]
  fn empty_model_is_an_init_error() {
    let loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    assert!(matches!(
      InferenceEngine::initialize(&loader, &[], &default_config()),
      Err(EngineError::EmptyModel)
    ));
  }

  #[test]
  fn label_mismatch_is_an_init_error() {
    let loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 32]);
    assert!(matches!(
      InferenceEngine::initialize(&loader, MODEL, &default_config()),
      Err(EngineError::LabelMismatch {
        labels: 3,
        outputs: 32
      })
    ));
  }

  #[test]
  fn hardware_failure_falls_back_to_cpu() {
    let mut loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    loader.accelerator_available = true;
    loader.fail_hardware = true;
    let config = config(AcceleratorPreference::PreferHardware, BoxOrder::LeftTopRightBottom);
    let engine = InferenceEngine::initialize(&loader, MODEL, &config).unwrap();
    assert_eq!(engine.accelerator(), Accelerator::Cpu);
    let loads = loader.loads.lock().unwrap();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[0].accelerator, Accelerator::Hardware);
    assert_eq!(loads[1].accelerator, Accelerator::Cpu);
    assert_eq!(loads[0].threads, loads[1].threads);
  }

  #[test]
  fn hardware_is_used_when_available() {
    let mut loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    loader.accelerator_available = true;
    let config = config(AcceleratorPreference::PreferHardware, BoxOrder::LeftTopRightBottom);
    let engine = InferenceEngine::initialize(&loader, MODEL, &config).unwrap();
    assert_eq!(engine.accelerator(), Accelerator::Hardware);
  }

  #[test]
  fn cpu_only_never_tries_hardware() {
    let mut loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    loader.accelerator_available = true;
    let engine = InferenceEngine::initialize(&loader, MODEL, &default_config()).unwrap();
    assert_eq!(engine.accelerator(), Accelerator::Cpu);
    assert_eq!(loader.loads.lock().unwrap().len(), 1);
  }

  #[test]
  fn runtime_error_is_per_frame() {
    let mut calls = 0;
    let loader = ScriptedLoader::new(move || {
      calls += 1;
      if calls == 2 {
        Err(BackendError::Run("boom".to_string()))
      } else {
        Ok(ModelOutputs {
          bbox: vec![0.0, 0.0, 1.0, 1.0],
          scores: vec![0.1, 0.2, 0.3],
        })
      }
    });
    let mut engine = InferenceEngine::initialize(&loader, MODEL, &default_config()).unwrap();
    assert!(matches!(
      engine.infer(&Tensor::zeros(8)),
      Err(EngineError::Backend(_))
    ));
    assert!(engine.infer(&Tensor::zeros(8)).is_ok());
  }

  #[test]
  fn wrong_input_length_is_rejected() {
    let loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    let mut engine = InferenceEngine::initialize(&loader, MODEL, &default_config()).unwrap();
    assert!(matches!(
      engine.infer(&Tensor::zeros(4)),
      Err(EngineError::InputShape { .. })
    ));
  }

  #[test]
  fn release_is_idempotent_and_drops_backend() {
    let loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    let mut engine = InferenceEngine::initialize(&loader, MODEL, &default_config()).unwrap();
    assert!(!loader.released.load(Ordering::SeqCst));
    engine.release();
    engine.release();
    assert!(engine.is_released());
    assert!(loader.released.load(Ordering::SeqCst));
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic(expected = "推理引擎释放后仍被调用")]
  fn infer_after_release_is_fatal_in_debug() {
    let loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    let mut engine = InferenceEngine::initialize(&loader, MODEL, &default_config()).unwrap();
    engine.release();
    let _ = engine.infer(&Tensor::zeros(8));
  }

  #[test]
  #[cfg(not(debug_assertions))]
  fn infer_after_release_is_an_error_in_release() {
    let loader = ScriptedLoader::constant([0.0; 4], vec![0.0; 3]);
    let mut engine = InferenceEngine::initialize(&loader, MODEL, &default_config()).unwrap();
    engine.release();
    assert!(matches!(
      engine.infer(&Tensor::zeros(8)),
      Err(EngineError::Released)
    ));
  }

  #[test]
  fn thread_count_is_bounded() {
    let threads = inference_threads(4);
    assert!((1..=4).contains(&threads));
    assert_eq!(inference_threads(1), 1);
  }
}
