// 该文件是 Shijue （视觉） 项目的一部分。
// src/runtime/native.rs - 原生推理绑定适配
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

use std::{sync::Arc, time::Instant};

use tracing::{debug, info, warn};

use crate::{
  clock::as_millis_f64,
  config::{Resolution, RuntimeConfig},
  model::RawPrediction,
  runtime::{
    BackendError, BackendFactory, BackendOutput, InferenceBackend, InferenceInput, RuntimeKind,
    RuntimeOptions,
  },
};

pub const DEFAULT_TFLITE_MODEL: &str = "assets/yolov8n.tflite";
pub const DEFAULT_ONNX_MODEL: &str = "assets/yolov8n.onnx";

/// 加载模型的参数
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
  pub model_uri: &'a str,
  pub input_resolution: Resolution,
  pub options: &'a RuntimeOptions,
}

/// 一次推理的参数
#[derive(Debug, Clone)]
pub struct InferRequest<'a> {
  pub input: &'a InferenceInput,
  pub confidence_threshold: f32,
  pub nms_iou: f32,
  pub input_resolution: Resolution,
  pub options: &'a RuntimeOptions,
}

/// 绑定返回的结果，未给出耗时时由适配器测量
#[derive(Debug, Clone, Default)]
pub struct NativeOutput {
  pub predictions: Vec<RawPrediction>,
  pub infer_ms: Option<f64>,
}

/// 设备端推理库的绑定（TFLite / ONNX Runtime 等）
///
/// 神经网络的实际计算由实现方负责，适配器只负责生命周期与参数传递。
pub trait NativeBinding: Send {
  fn is_available(&self) -> bool;
  fn load_model(&mut self, request: &LoadRequest<'_>) -> anyhow::Result<()>;
  fn infer(&mut self, request: &InferRequest<'_>) -> anyhow::Result<NativeOutput>;
  fn unload_model(&mut self) -> anyhow::Result<()>;
}

pub struct NativeBackend {
  runtime: RuntimeKind,
  binding: Box<dyn NativeBinding>,
  model_uri: String,
  config: Arc<RuntimeConfig>,
  loaded: bool,
}

impl NativeBackend {
  pub fn new(
    runtime: RuntimeKind,
    binding: Box<dyn NativeBinding>,
    model_uri: impl Into<String>,
    config: Arc<RuntimeConfig>,
  ) -> Self {
    Self {
      runtime,
      binding,
      model_uri: model_uri.into(),
      config,
      loaded: false,
    }
  }

  /// 构造一个每次调用都新建绑定的工厂
  pub fn factory<F>(
    runtime: RuntimeKind,
    model_uri: impl Into<String>,
    mut make_binding: F,
  ) -> BackendFactory
  where
    F: FnMut() -> anyhow::Result<Box<dyn NativeBinding>> + Send + 'static,
  {
    let model_uri = model_uri.into();
    Box::new(move |config: Arc<RuntimeConfig>| {
      let binding = make_binding()?;
      let backend = NativeBackend::new(runtime, binding, model_uri.clone(), config);
      Ok(Box::new(backend) as Box<dyn InferenceBackend>)
    })
  }

  fn options(&self) -> RuntimeOptions {
    RuntimeOptions::for_runtime(self.runtime, &self.config)
  }
}

impl InferenceBackend for NativeBackend {
  fn runtime(&self) -> RuntimeKind {
    self.runtime
  }

  fn available(&mut self) -> bool {
    self.binding.is_available()
  }

  fn is_loaded(&self) -> bool {
    self.loaded
  }

  fn load(&mut self) -> Result<(), BackendError> {
    if self.loaded {
      return Ok(());
    }
    if self.model_uri.trim().is_empty() {
      return Err(BackendError::Configuration(format!(
        "{} 运行时未指定模型文件",
        self.runtime
      )));
    }

    let options = self.options();
    info!("加载 {} 模型: {}", self.runtime, self.model_uri);
    debug!("运行时参数: {:?}", options);
    self.binding.load_model(&LoadRequest {
      model_uri: &self.model_uri,
      input_resolution: self.config.input_resolution,
      options: &options,
    })?;
    self.loaded = true;
    info!("{} 模型加载完成", self.runtime);
    Ok(())
  }

  fn unload(&mut self) -> Result<(), BackendError> {
    if !self.loaded {
      return Ok(());
    }
    // 先清除标记，卸载失败时实例也不会被当作已加载
    self.loaded = false;
    self.binding.unload_model()?;
    info!("{} 模型已卸载", self.runtime);
    Ok(())
  }

  fn infer(&mut self, input: &InferenceInput) -> Result<BackendOutput, BackendError> {
    if !self.loaded {
      return Err(BackendError::Configuration(format!(
        "{} 运行时尚未加载模型",
        self.runtime
      )));
    }
    if !self.binding.is_available() {
      warn!("{} 运行时已不可用", self.runtime);
      return Err(BackendError::Binding(anyhow::anyhow!(
        "{} runtime is no longer available",
        self.runtime
      )));
    }

    let options = self.options();
    let started = Instant::now();
    let output = self.binding.infer(&InferRequest {
      input,
      confidence_threshold: self.config.confidence_threshold,
      nms_iou: self.config.nms_iou,
      input_resolution: self.config.input_resolution,
      options: &options,
    })?;
    let measured = as_millis_f64(started.elapsed());

    Ok(BackendOutput {
      predictions: output.predictions,
      infer_ms: output
        .infer_ms
        .filter(|ms| ms.is_finite())
        .unwrap_or(measured),
    })
  }

  fn apply_config(&mut self, config: Arc<RuntimeConfig>) {
    self.config = config;
  }
}
