// 该文件是 Shijue （视觉） 项目的一部分。
// src/config.rs - 运行时与调度配置
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

//! 配置快照与配置补丁
//!
//! [`RuntimeConfig`] 与 [`SchedulerConfig`] 都是不可变快照：更新时通过
//! [`ConfigPatch`] 合并出新的快照，数值越界时静默截断，类型错误时保留原值，
//! 任何输入都不会导致失败。

use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_NMS_IOU: f32 = 0.45;
pub const DEFAULT_INPUT_RESOLUTION: Resolution = Resolution::square(640);
pub const DEFAULT_SERVER_TIMEOUT_MS: u64 = 350;
pub const DEFAULT_TFLITE_NUM_THREADS: u32 = 4;
pub const DEFAULT_ONNX_PROVIDERS: [&str; 2] = ["nnapi", "cpu"];
pub const DEFAULT_ONNX_INTRA_OP_THREADS: u32 = 2;
pub const DEFAULT_ONNX_INTER_OP_THREADS: u32 = 1;

pub const DEFAULT_MAX_INFERENCE_FPS: u32 = 8;
pub const MAX_INFERENCE_FPS_LIMIT: u32 = 30;
pub const DEFAULT_PROCESS_EVERY_N_MAX: u32 = 6;
pub const PROCESS_EVERY_N_LIMIT: u32 = 30;

const MAX_THREADS: u32 = 8;
const MAX_INTER_OP_THREADS: u32 = 4;

/// 宽 × 高，均为正数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
  pub width: u32,
  pub height: u32,
}

impl Resolution {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub const fn square(side: u32) -> Self {
    Self {
      width: side,
      height: side,
    }
  }

  pub fn as_array(&self) -> [u32; 2] {
    [self.width, self.height]
  }
}

impl fmt::Display for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TfliteDelegate {
  Auto,
  #[default]
  Gpu,
  Nnapi,
  Xnnpack,
  Cpu,
}

impl TfliteDelegate {
  pub fn as_str(&self) -> &'static str {
    match self {
      TfliteDelegate::Auto => "auto",
      TfliteDelegate::Gpu => "gpu",
      TfliteDelegate::Nnapi => "nnapi",
      TfliteDelegate::Xnnpack => "xnnpack",
      TfliteDelegate::Cpu => "cpu",
    }
  }

  fn parse(name: &str) -> Option<Self> {
    match name.trim().to_ascii_lowercase().as_str() {
      "auto" => Some(TfliteDelegate::Auto),
      "gpu" => Some(TfliteDelegate::Gpu),
      "nnapi" => Some(TfliteDelegate::Nnapi),
      "xnnpack" => Some(TfliteDelegate::Xnnpack),
      "cpu" => Some(TfliteDelegate::Cpu),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphOptimizationLevel {
  Disabled,
  Basic,
  Extended,
  #[default]
  All,
}

impl GraphOptimizationLevel {
  pub fn as_str(&self) -> &'static str {
    match self {
      GraphOptimizationLevel::Disabled => "disabled",
      GraphOptimizationLevel::Basic => "basic",
      GraphOptimizationLevel::Extended => "extended",
      GraphOptimizationLevel::All => "all",
    }
  }

  fn parse(name: &str) -> Option<Self> {
    match name.trim().to_ascii_lowercase().as_str() {
      "disabled" => Some(GraphOptimizationLevel::Disabled),
      "basic" => Some(GraphOptimizationLevel::Basic),
      "extended" => Some(GraphOptimizationLevel::Extended),
      "all" => Some(GraphOptimizationLevel::All),
      _ => None,
    }
  }
}

/// 仅有数字类别编号的检测结果如何生成显示标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelSet {
  /// `class 3` 形式
  #[default]
  Raw,
  /// 按 COCO 80 类名称表查找
  Coco,
}

impl LabelSet {
  fn parse(name: &str) -> Option<Self> {
    match name.trim().to_ascii_lowercase().as_str() {
      "raw" | "none" => Some(LabelSet::Raw),
      "coco" => Some(LabelSet::Coco),
      _ => None,
    }
  }
}

/// 推理运行时配置快照
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
  pub confidence_threshold: f32,
  pub nms_iou: f32,
  pub input_resolution: Resolution,
  pub server_timeout_ms: u64,
  pub tflite_delegate: TfliteDelegate,
  pub tflite_allow_nnapi_fallback: bool,
  pub tflite_num_threads: u32,
  pub onnx_execution_providers: Vec<String>,
  pub onnx_graph_optimization_level: GraphOptimizationLevel,
  pub onnx_intra_op_threads: u32,
  pub onnx_inter_op_threads: u32,
  pub onnx_enable_cpu_mem_arena: bool,
  pub onnx_enable_mem_pattern: bool,
  pub label_set: LabelSet,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      nms_iou: DEFAULT_NMS_IOU,
      input_resolution: DEFAULT_INPUT_RESOLUTION,
      server_timeout_ms: DEFAULT_SERVER_TIMEOUT_MS,
      tflite_delegate: TfliteDelegate::default(),
      tflite_allow_nnapi_fallback: true,
      tflite_num_threads: DEFAULT_TFLITE_NUM_THREADS,
      onnx_execution_providers: default_onnx_providers(),
      onnx_graph_optimization_level: GraphOptimizationLevel::default(),
      onnx_intra_op_threads: DEFAULT_ONNX_INTRA_OP_THREADS,
      onnx_inter_op_threads: DEFAULT_ONNX_INTER_OP_THREADS,
      onnx_enable_cpu_mem_arena: true,
      onnx_enable_mem_pattern: true,
      label_set: LabelSet::default(),
    }
  }
}

impl RuntimeConfig {
  /// 合并补丁并截断，返回新的快照
  pub fn merged(&self, patch: &ConfigPatch) -> Self {
    let providers = patch
      .onnx_execution_providers
      .as_ref()
      .map(|providers| normalize_providers(providers))
      .unwrap_or_else(|| self.onnx_execution_providers.clone());

    Self {
      confidence_threshold: unit(patch.confidence_threshold, self.confidence_threshold),
      nms_iou: unit(patch.nms_iou, self.nms_iou),
      input_resolution: patch.input_resolution.unwrap_or(self.input_resolution),
      server_timeout_ms: patch
        .server_timeout_ms
        .filter(|v| v.is_finite())
        .map(|v| v.trunc().max(1.0) as u64)
        .unwrap_or(self.server_timeout_ms),
      tflite_delegate: patch.tflite_delegate.unwrap_or(self.tflite_delegate),
      tflite_allow_nnapi_fallback: patch
        .tflite_allow_nnapi_fallback
        .unwrap_or(self.tflite_allow_nnapi_fallback),
      tflite_num_threads: count(patch.tflite_num_threads, self.tflite_num_threads, MAX_THREADS),
      onnx_execution_providers: providers,
      onnx_graph_optimization_level: patch
        .onnx_graph_optimization_level
        .unwrap_or(self.onnx_graph_optimization_level),
      onnx_intra_op_threads: count(
        patch.onnx_intra_op_threads,
        self.onnx_intra_op_threads,
        MAX_THREADS,
      ),
      onnx_inter_op_threads: count(
        patch.onnx_inter_op_threads,
        self.onnx_inter_op_threads,
        MAX_INTER_OP_THREADS,
      ),
      onnx_enable_cpu_mem_arena: patch
        .onnx_enable_cpu_mem_arena
        .unwrap_or(self.onnx_enable_cpu_mem_arena),
      onnx_enable_mem_pattern: patch
        .onnx_enable_mem_pattern
        .unwrap_or(self.onnx_enable_mem_pattern),
      label_set: patch.label_set.unwrap_or(self.label_set),
    }
  }

  pub fn server_timeout(&self) -> Duration {
    Duration::from_millis(self.server_timeout_ms)
  }
}

/// 每通道的均值/方差归一化参数，作用于 [0,1] 范围的像素值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
  pub mean: [f32; 3],
  pub std: [f32; 3],
}

impl Default for Normalization {
  fn default() -> Self {
    Self {
      mean: [0.0; 3],
      std: [1.0; 3],
    }
  }
}

/// 自适应跳帧的滞回参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrideTuning {
  /// 耗时超过 `预算 × over_budget_factor` 视为超预算
  pub over_budget_factor: f64,
  /// 耗时低于 `预算 × under_budget_factor` 视为有余量
  pub under_budget_factor: f64,
  /// 连续超预算多少帧后增大步长
  pub over_budget_frames: u32,
  /// 连续有余量多少帧后减小步长
  pub under_budget_frames: u32,
}

impl Default for StrideTuning {
  fn default() -> Self {
    Self {
      over_budget_factor: 1.2,
      under_budget_factor: 0.7,
      over_budget_frames: 3,
      under_budget_frames: 6,
    }
  }
}

/// 帧调度配置快照
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
  pub max_inference_fps: u32,
  pub adaptive_frame_skip: bool,
  pub process_every_n_max: u32,
  pub preprocess_before_handoff: bool,
  pub input_resolution: Resolution,
  pub normalization: Normalization,
  pub stride: StrideTuning,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_inference_fps: DEFAULT_MAX_INFERENCE_FPS,
      adaptive_frame_skip: true,
      process_every_n_max: DEFAULT_PROCESS_EVERY_N_MAX,
      preprocess_before_handoff: false,
      input_resolution: DEFAULT_INPUT_RESOLUTION,
      normalization: Normalization::default(),
      stride: StrideTuning::default(),
    }
  }
}

impl SchedulerConfig {
  pub fn merged(&self, patch: &ConfigPatch) -> Self {
    let mean = patch.normalize_mean.unwrap_or(self.normalization.mean);
    let std = patch
      .normalize_std
      .map(|std| std.map(|v| if v == 0.0 { 1.0 } else { v }))
      .unwrap_or(self.normalization.std);

    Self {
      max_inference_fps: count(
        patch.max_inference_fps,
        self.max_inference_fps,
        MAX_INFERENCE_FPS_LIMIT,
      ),
      adaptive_frame_skip: patch.adaptive_frame_skip.unwrap_or(self.adaptive_frame_skip),
      process_every_n_max: count(
        patch.process_every_n_max,
        self.process_every_n_max,
        PROCESS_EVERY_N_LIMIT,
      ),
      preprocess_before_handoff: patch
        .preprocess_before_handoff
        .unwrap_or(self.preprocess_before_handoff),
      input_resolution: patch.input_resolution.unwrap_or(self.input_resolution),
      normalization: Normalization { mean, std },
      stride: self.stride,
    }
  }

  /// 单帧耗时预算（毫秒）
  pub fn target_budget_ms(&self) -> f64 {
    1000.0 / f64::from(self.max_inference_fps.max(1))
  }

  /// 两次推理开始之间的最小间隔
  pub fn min_interval(&self) -> Duration {
    Duration::from_secs_f64(self.target_budget_ms() / 1000.0)
  }

  /// 步长上限，关闭自适应跳帧时固定为 1
  pub fn max_stride(&self) -> u32 {
    if self.adaptive_frame_skip {
      self.process_every_n_max.max(1)
    } else {
      1
    }
  }
}

/// 扁平配置补丁
///
/// 数值字段保留原始的 `f64`，在合并时再截断到合法范围。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
  pub confidence_threshold: Option<f64>,
  pub nms_iou: Option<f64>,
  pub input_resolution: Option<Resolution>,
  pub server_timeout_ms: Option<f64>,
  pub tflite_delegate: Option<TfliteDelegate>,
  pub tflite_allow_nnapi_fallback: Option<bool>,
  pub tflite_num_threads: Option<f64>,
  pub onnx_execution_providers: Option<Vec<String>>,
  pub onnx_graph_optimization_level: Option<GraphOptimizationLevel>,
  pub onnx_intra_op_threads: Option<f64>,
  pub onnx_inter_op_threads: Option<f64>,
  pub onnx_enable_cpu_mem_arena: Option<bool>,
  pub onnx_enable_mem_pattern: Option<bool>,
  pub label_set: Option<LabelSet>,
  pub max_inference_fps: Option<f64>,
  pub adaptive_frame_skip: Option<bool>,
  pub process_every_n_max: Option<f64>,
  pub preprocess_before_handoff: Option<bool>,
  pub normalize_mean: Option<[f32; 3]>,
  pub normalize_std: Option<[f32; 3]>,
}

impl ConfigPatch {
  /// 只包含运行时相关字段的补丁，调度器用它同步注册表
  pub fn runtime_only(&self) -> ConfigPatch {
    ConfigPatch {
      max_inference_fps: None,
      adaptive_frame_skip: None,
      process_every_n_max: None,
      preprocess_before_handoff: None,
      normalize_mean: None,
      normalize_std: None,
      ..self.clone()
    }
  }

  pub fn is_empty(&self) -> bool {
    *self == ConfigPatch::default()
  }
}

impl From<&Value> for ConfigPatch {
  fn from(value: &Value) -> Self {
    let Some(object) = value.as_object() else {
      return ConfigPatch::default();
    };

    let normalize = field(object, &["normalize"]).and_then(Value::as_object);

    ConfigPatch {
      confidence_threshold: field(object, &["confidenceThreshold", "confidence_threshold"])
        .and_then(number),
      nms_iou: field(object, &["nmsIoU", "nmsIou", "nms_iou"]).and_then(number),
      input_resolution: field(object, &["inputResolution", "input_resolution"])
        .map(|v| resolution(v).unwrap_or(DEFAULT_INPUT_RESOLUTION)),
      server_timeout_ms: field(object, &["serverTimeoutMs", "server_timeout_ms"]).and_then(number),
      tflite_delegate: field(object, &["tfliteDelegate", "tflite_delegate"]).map(|v| {
        v.as_str()
          .and_then(TfliteDelegate::parse)
          .unwrap_or_default()
      }),
      tflite_allow_nnapi_fallback: field(
        object,
        &["tfliteAllowNnapiFallback", "tflite_allow_nnapi_fallback"],
      )
      .and_then(Value::as_bool),
      tflite_num_threads: field(object, &["tfliteNumThreads", "tflite_num_threads"])
        .and_then(number),
      onnx_execution_providers: field(
        object,
        &["onnxExecutionProviders", "onnx_execution_providers"],
      )
      .map(|v| {
        v.as_array()
          .map(|items| items.iter().map(value_to_string).collect())
          .unwrap_or_default()
      }),
      onnx_graph_optimization_level: field(
        object,
        &["onnxGraphOptimizationLevel", "onnx_graph_optimization_level"],
      )
      .map(|v| {
        v.as_str()
          .and_then(GraphOptimizationLevel::parse)
          .unwrap_or_default()
      }),
      onnx_intra_op_threads: field(object, &["onnxIntraOpThreads", "onnx_intra_op_threads"])
        .and_then(number),
      onnx_inter_op_threads: field(object, &["onnxInterOpThreads", "onnx_inter_op_threads"])
        .and_then(number),
      onnx_enable_cpu_mem_arena: field(
        object,
        &["onnxEnableCpuMemArena", "onnx_enable_cpu_mem_arena"],
      )
      .and_then(Value::as_bool),
      onnx_enable_mem_pattern: field(object, &["onnxEnableMemPattern", "onnx_enable_mem_pattern"])
        .and_then(Value::as_bool),
      label_set: field(object, &["labelSet", "label_set"])
        .and_then(Value::as_str)
        .and_then(LabelSet::parse),
      max_inference_fps: field(object, &["maxInferenceFps", "max_inference_fps"]).and_then(number),
      adaptive_frame_skip: field(object, &["adaptiveFrameSkip", "adaptive_frame_skip"])
        .and_then(Value::as_bool),
      process_every_n_max: field(object, &["processEveryNMax", "process_every_n_max"])
        .and_then(number),
      preprocess_before_handoff: field(
        object,
        &["preprocessBeforeHandoff", "preprocess_before_handoff", "preprocessOnJs"],
      )
      .and_then(Value::as_bool),
      normalize_mean: normalize
        .and_then(|n| n.get("mean"))
        .and_then(triple),
      normalize_std: normalize.and_then(|n| n.get("std")).and_then(triple),
    }
  }
}

fn default_onnx_providers() -> Vec<String> {
  DEFAULT_ONNX_PROVIDERS.iter().map(|p| p.to_string()).collect()
}

fn normalize_providers(providers: &[String]) -> Vec<String> {
  let providers: Vec<String> = providers
    .iter()
    .map(|p| p.trim().to_ascii_lowercase())
    .filter(|p| !p.is_empty())
    .collect();
  if providers.is_empty() {
    default_onnx_providers()
  } else {
    providers
  }
}

fn unit(value: Option<f64>, current: f32) -> f32 {
  value
    .filter(|v| v.is_finite())
    .map(|v| v.clamp(0.0, 1.0) as f32)
    .unwrap_or(current)
}

fn count(value: Option<f64>, current: u32, max: u32) -> u32 {
  value
    .filter(|v| v.is_finite())
    .map(|v| v.trunc().clamp(1.0, f64::from(max)) as u32)
    .unwrap_or(current)
}

fn field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
  keys.iter().find_map(|key| object.get(*key))
}

fn number(value: &Value) -> Option<f64> {
  let number = match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok(),
    _ => None,
  };
  number.filter(|v| v.is_finite())
}

fn value_to_string(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn positive_side(value: Option<&Value>) -> Option<u32> {
  let side = value.and_then(number)?.trunc();
  (side >= 1.0 && side <= f64::from(u32::MAX)).then_some(side as u32)
}

fn resolution(value: &Value) -> Option<Resolution> {
  match value {
    Value::Array(items) if items.len() == 2 => {
      Some(Resolution::new(positive_side(items.first())?, positive_side(items.get(1))?))
    }
    Value::Object(object) => Some(Resolution::new(
      positive_side(object.get("width"))?,
      positive_side(object.get("height"))?,
    )),
    other => positive_side(Some(other)).map(Resolution::square),
  }
}

fn triple(value: &Value) -> Option<[f32; 3]> {
  let items = value.as_array()?;
  if items.len() != 3 {
    return None;
  }
  let mut out = [0.0f32; 3];
  for (slot, item) in out.iter_mut().zip(items) {
    *slot = number(item)? as f32;
  }
  Some(out)
}
