// 该文件是 Shijue （视觉） 项目的一部分。
// src/runtime.rs - 推理运行时
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

use std::{fmt, str::FromStr, sync::Arc};

use thiserror::Error;

use crate::{
  config::{GraphOptimizationLevel, RuntimeConfig, TfliteDelegate},
  frame::{FramePacket, PixelFormat, Tensor},
  model::{Detection, RawPrediction},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeKind {
  Tflite,
  Onnx,
  Server,
}

impl RuntimeKind {
  /// 固定的回退顺序：设备端优先，服务器最后
  pub const PRIORITY: [RuntimeKind; 3] = [RuntimeKind::Tflite, RuntimeKind::Onnx, RuntimeKind::Server];

  pub fn as_str(&self) -> &'static str {
    match self {
      RuntimeKind::Tflite => "tflite",
      RuntimeKind::Onnx => "onnx",
      RuntimeKind::Server => "server",
    }
  }

  pub fn priority(&self) -> usize {
    match self {
      RuntimeKind::Tflite => 0,
      RuntimeKind::Onnx => 1,
      RuntimeKind::Server => 2,
    }
  }
}

impl fmt::Display for RuntimeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RuntimeKind {
  type Err = RuntimeError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "tflite" => Ok(RuntimeKind::Tflite),
      "onnx" => Ok(RuntimeKind::Onnx),
      "server" => Ok(RuntimeKind::Server),
      other => Err(RuntimeError::UnknownRuntime(other.to_string())),
    }
  }
}

/// 图像输入：已编码的文件数据或原始像素
#[derive(Debug, Clone)]
pub enum ImagePayload {
  Encoded {
    bytes: Vec<u8>,
    mime: String,
  },
  Raw {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    bytes: Vec<u8>,
  },
}

/// 一次推理的输入，张量与图像二选一
#[derive(Debug, Clone)]
pub enum InferenceInput {
  Tensor(Tensor),
  Image(ImagePayload),
}

impl InferenceInput {
  pub fn kind(&self) -> &'static str {
    match self {
      InferenceInput::Tensor(_) => "tensor",
      InferenceInput::Image(_) => "image",
    }
  }
}

impl From<FramePacket> for InferenceInput {
  fn from(packet: FramePacket) -> Self {
    InferenceInput::Image(ImagePayload::Raw {
      width: packet.width,
      height: packet.height,
      pixel_format: packet.pixel_format,
      bytes: packet.bytes,
    })
  }
}

impl From<Tensor> for InferenceInput {
  fn from(tensor: Tensor) -> Self {
    InferenceInput::Tensor(tensor)
  }
}

/// 后端返回的原始结果
#[derive(Debug, Clone, Default)]
pub struct BackendOutput {
  pub predictions: Vec<RawPrediction>,
  pub infer_ms: f64,
}

/// 注册表一次成功推理的结果
#[derive(Debug, Clone)]
pub struct InferenceOutcome {
  pub runtime: RuntimeKind,
  pub detections: Vec<Detection>,
  pub infer_ms: f64,
}

/// 由配置推导出的运行时参数，加载与推理时交给原生绑定
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeOptions {
  Tflite {
    delegate: TfliteDelegate,
    fallback_delegates: Vec<TfliteDelegate>,
    num_threads: u32,
  },
  Onnx {
    execution_providers: Vec<String>,
    graph_optimization_level: GraphOptimizationLevel,
    intra_op_threads: u32,
    inter_op_threads: u32,
    enable_cpu_mem_arena: bool,
    enable_mem_pattern: bool,
  },
  None,
}

impl RuntimeOptions {
  pub fn for_runtime(kind: RuntimeKind, config: &RuntimeConfig) -> Self {
    match kind {
      RuntimeKind::Tflite => {
        let fallback_delegates =
          if config.tflite_allow_nnapi_fallback && config.tflite_delegate == TfliteDelegate::Gpu {
            vec![TfliteDelegate::Nnapi, TfliteDelegate::Xnnpack, TfliteDelegate::Cpu]
          } else {
            Vec::new()
          };
        RuntimeOptions::Tflite {
          delegate: config.tflite_delegate,
          fallback_delegates,
          num_threads: config.tflite_num_threads,
        }
      }
      RuntimeKind::Onnx => RuntimeOptions::Onnx {
        execution_providers: config.onnx_execution_providers.clone(),
        graph_optimization_level: config.onnx_graph_optimization_level,
        intra_op_threads: config.onnx_intra_op_threads,
        inter_op_threads: config.onnx_inter_op_threads,
        enable_cpu_mem_arena: config.onnx_enable_cpu_mem_arena,
        enable_mem_pattern: config.onnx_enable_mem_pattern,
      },
      RuntimeKind::Server => RuntimeOptions::None,
    }
  }
}

#[derive(Error, Debug)]
pub enum BackendError {
  /// 配置问题，换下一个运行时但不进入退避
  #[error("配置错误: {0}")]
  Configuration(String),
  #[error("原生绑定错误: {0}")]
  Binding(#[source] anyhow::Error),
  #[error("服务器推理失败: {0}")]
  Server(String),
  #[cfg(feature = "remote")]
  #[error("网络错误: {0}")]
  Network(#[from] reqwest::Error),
  #[error("响应无效: {0}")]
  InvalidResponse(String),
  #[error("图像编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("推理超时 ({0} ms)")]
  Timeout(u64),
}

impl BackendError {
  /// 是否需要让该运行时进入退避
  pub fn is_transient(&self) -> bool {
    !matches!(self, BackendError::Configuration(_))
  }
}

impl From<anyhow::Error> for BackendError {
  fn from(err: anyhow::Error) -> Self {
    BackendError::Binding(err)
  }
}

#[derive(Error, Debug)]
pub enum RuntimeError {
  #[error("没有可用的推理运行时")]
  NoRuntimeAvailable,
  #[error("所有运行时均失败 ({})", format_failures(.failures))]
  Exhausted {
    failures: Vec<(RuntimeKind, String)>,
    #[source]
    last: BackendError,
  },
  #[error("未知的运行时: {0}")]
  UnknownRuntime(String),
  #[error("运行时 {0} 当前不可用")]
  Unavailable(RuntimeKind),
  #[error("运行时 {runtime} 错误: {source}")]
  Backend {
    runtime: RuntimeKind,
    #[source]
    source: BackendError,
  },
}

fn format_failures(failures: &[(RuntimeKind, String)]) -> String {
  failures
    .iter()
    .map(|(runtime, message)| format!("{}: {}", runtime, message))
    .collect::<Vec<_>>()
    .join(" | ")
}

/// 推理后端的统一接口
pub trait InferenceBackend: Send {
  fn runtime(&self) -> RuntimeKind;

  /// 探测当前构建/设备上是否可用
  fn available(&mut self) -> bool;

  fn is_loaded(&self) -> bool;

  fn load(&mut self) -> Result<(), BackendError>;

  fn unload(&mut self) -> Result<(), BackendError>;

  fn infer(&mut self, input: &InferenceInput) -> Result<BackendOutput, BackendError>;

  /// 替换配置快照，下一次加载/推理生效
  fn apply_config(&mut self, config: Arc<RuntimeConfig>);
}

/// 按需构造后端实例
pub type BackendFactory =
  Box<dyn FnMut(Arc<RuntimeConfig>) -> Result<Box<dyn InferenceBackend>, BackendError> + Send>;

pub mod native;
#[cfg(feature = "remote")]
pub mod remote;
pub mod registry;

pub use self::native::{NativeBackend, NativeBinding, NativeOutput};
#[cfg(feature = "remote")]
pub use self::remote::{RemoteBackend, RemoteEndpoint};
pub use self::registry::{RegistryBuilder, RuntimeAvailability, RuntimeRegistry};
