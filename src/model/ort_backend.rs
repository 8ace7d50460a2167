// 该文件是 Shoushi （手势） 项目的一部分。
// src/model/ort_backend.rs - ONNX Runtime 推理后端
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

use ort::{
  execution_providers::{CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch},
  session::{Session, builder::GraphOptimizationLevel},
  value::Tensor as OrtTensor,
};
use tracing::{debug, info};

use super::{Accelerator, BackendError, BackendLoader, InferenceBackend, ModelOutputs, SessionOptions};
use crate::preprocess::Tensor;

const NUM_INPUTS: usize = 1;
const NUM_OUTPUTS: usize = 2;
const BBOX_OUTPUT: usize = 0;
const SCORES_OUTPUT: usize = 1;

fn hardware_providers() -> Vec<ExecutionProviderDispatch> {
  vec![CUDAExecutionProvider::default().build().error_on_failure()]
}

/// 创建 ONNX Runtime 会话
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtLoader;

impl OrtLoader {
  pub fn new() -> Self {
    Self
  }
}

impl BackendLoader for OrtLoader {
  type Backend = OrtBackend;

  fn accelerator_available(&self) -> bool {
    CUDAExecutionProvider::default()
      .is_available()
      .unwrap_or(false)
  }

  fn load(&self, model: &[u8], options: &SessionOptions) -> Result<OrtBackend, BackendError> {
    info!(
      "创建 ONNX Runtime 会话: {}, {} 线程",
      options.accelerator, options.threads
    );

    let mut builder = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .with_intra_threads(options.threads)?;
    if options.accelerator == Accelerator::Hardware {
      builder = builder.with_execution_providers(hardware_providers())?;
    }
    let session = builder.commit_from_memory(model)?;

    if session.inputs.len() != NUM_INPUTS {
      return Err(BackendError::InvalidModel(format!(
        "模型输入数量应为 {}, 实际为 {}",
        NUM_INPUTS,
        session.inputs.len()
      )));
    }
    if session.outputs.len() != NUM_OUTPUTS {
      return Err(BackendError::InvalidModel(format!(
        "模型输出数量应为 {}, 实际为 {}",
        NUM_OUTPUTS,
        session.outputs.len()
      )));
    }

    let input_name = session.inputs[0].name.clone();
    let bbox_output = session.outputs[BBOX_OUTPUT].name.clone();
    let scores_output = session.outputs[SCORES_OUTPUT].name.clone();
    debug!(
      "模型输入: {}, 输出: {} / {}",
      input_name, bbox_output, scores_output
    );

    Ok(OrtBackend {
      session,
      input_name,
      bbox_output,
      scores_output,
    })
  }
}

pub struct OrtBackend {
  session: Session,
  input_name: String,
  bbox_output: String,
  scores_output: String,
}

impl InferenceBackend for OrtBackend {
  fn run(&mut self, input: &Tensor) -> Result<ModelOutputs, BackendError> {
    let value = OrtTensor::from_array((input.shape(), input.as_slice().to_vec()))?;
    let outputs = self
      .session
      .run(ort::inputs![self.input_name.as_str() => value])?;

    let (_, bbox) = outputs[self.bbox_output.as_str()].try_extract_tensor::<f32>()?;
    let (_, scores) = outputs[self.scores_output.as_str()].try_extract_tensor::<f32>()?;

    Ok(ModelOutputs {
      bbox: bbox.to_vec(),
      scores: scores.to_vec(),
    })
  }
}
