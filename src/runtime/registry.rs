// 该文件是 Shijue （视觉） 项目的一部分。
// src/runtime/registry.rs - 运行时注册表与回退
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

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
  clock::{Clock, system_clock},
  config::{ConfigPatch, RuntimeConfig},
  model::postprocess,
  runtime::{
    BackendError, BackendFactory, InferenceBackend, InferenceInput, InferenceOutcome, RuntimeError,
    RuntimeKind,
  },
};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// 一个运行时的可用性探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeAvailability {
  pub runtime: RuntimeKind,
  pub available: bool,
  /// 处于退避期时剩余的时间
  pub backoff_remaining: Option<Duration>,
}

struct Slot {
  kind: RuntimeKind,
  factory: BackendFactory,
  instance: Option<Box<dyn InferenceBackend>>,
  /// 最近一次探测结果
  available: Option<bool>,
  backoff_until: Option<Duration>,
}

impl Slot {
  fn in_backoff(&self, now: Duration) -> bool {
    self.backoff_until.is_some_and(|until| now < until)
  }
}

pub struct RegistryBuilder {
  config: RuntimeConfig,
  cooldown: Duration,
  clock: Arc<dyn Clock>,
  factories: Vec<(RuntimeKind, BackendFactory)>,
}

impl Default for RegistryBuilder {
  fn default() -> Self {
    Self {
      config: RuntimeConfig::default(),
      cooldown: DEFAULT_BACKOFF,
      clock: system_clock(),
      factories: Vec::new(),
    }
  }
}

impl RegistryBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn config(mut self, config: RuntimeConfig) -> Self {
    self.config = config;
    self
  }

  pub fn cooldown(mut self, cooldown: Duration) -> Self {
    self.cooldown = cooldown;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// 注册运行时工厂，同一运行时重复注册时覆盖之前的工厂
  pub fn register(mut self, kind: RuntimeKind, factory: BackendFactory) -> Self {
    self.factories.retain(|(existing, _)| *existing != kind);
    self.factories.push((kind, factory));
    self
  }

  pub fn build(self) -> RuntimeRegistry {
    let mut slots: Vec<Slot> = self
      .factories
      .into_iter()
      .map(|(kind, factory)| Slot {
        kind,
        factory,
        instance: None,
        available: None,
        backoff_until: None,
      })
      .collect();
    slots.sort_by_key(|slot| slot.kind.priority());

    info!(
      "运行时注册表: [{}], 退避时长 {:?}",
      slots
        .iter()
        .map(|slot| slot.kind.as_str())
        .collect::<Vec<_>>()
        .join(", "),
      self.cooldown
    );

    RuntimeRegistry {
      config: Arc::new(self.config),
      slots,
      active: None,
      loaded: None,
      cooldown: self.cooldown,
      clock: self.clock,
    }
  }
}

/// 多后端注册表
///
/// 按固定优先级选择后端，失败的后端进入退避期，同一时刻最多加载一个实例。
pub struct RuntimeRegistry {
  config: Arc<RuntimeConfig>,
  slots: Vec<Slot>,
  active: Option<RuntimeKind>,
  loaded: Option<RuntimeKind>,
  cooldown: Duration,
  clock: Arc<dyn Clock>,
}

impl RuntimeRegistry {
  pub fn builder() -> RegistryBuilder {
    RegistryBuilder::new()
  }

  pub fn config(&self) -> Arc<RuntimeConfig> {
    self.config.clone()
  }

  pub fn active_runtime(&self) -> Option<RuntimeKind> {
    self.active
  }

  pub fn loaded_runtime(&self) -> Option<RuntimeKind> {
    self.loaded
  }

  pub fn registered(&self) -> Vec<RuntimeKind> {
    self.slots.iter().map(|slot| slot.kind).collect()
  }

  fn index_of(&self, kind: RuntimeKind) -> Option<usize> {
    self.slots.iter().position(|slot| slot.kind == kind)
  }

  fn ensure_instance(&mut self, index: usize) -> Result<(), BackendError> {
    let config = self.config.clone();
    let slot = &mut self.slots[index];
    if slot.instance.is_none() {
      debug!("构造 {} 运行时实例", slot.kind);
      slot.instance = Some((slot.factory)(config)?);
    }
    Ok(())
  }

  fn probe(&mut self, index: usize, refresh: bool) -> RuntimeAvailability {
    let now = self.clock.now();
    let kind = self.slots[index].kind;

    {
      let slot = &mut self.slots[index];
      if let Some(until) = slot.backoff_until {
        if now < until {
          return RuntimeAvailability {
            runtime: kind,
            available: false,
            backoff_remaining: Some(until - now),
          };
        }
        debug!("{} 运行时退避结束", kind);
        slot.backoff_until = None;
      }
      if !refresh && slot.available == Some(true) {
        return RuntimeAvailability {
          runtime: kind,
          available: true,
          backoff_remaining: None,
        };
      }
    }

    let available = match self.ensure_instance(index) {
      Ok(()) => self.slots[index]
        .instance
        .as_mut()
        .is_some_and(|instance| instance.available()),
      Err(e) => {
        warn!("无法构造 {} 运行时: {}", kind, e);
        false
      }
    };
    self.slots[index].available = Some(available);
    debug!("{} 运行时可用性: {}", kind, available);

    RuntimeAvailability {
      runtime: kind,
      available,
      backoff_remaining: None,
    }
  }

  /// 按优先级探测所有已注册运行时的可用性
  ///
  /// 退避期内的运行时直接报告不可用；`refresh` 为 `false` 时复用已缓存的可用结果。
  pub fn detect_available_runtimes(&mut self, refresh: bool) -> Vec<RuntimeAvailability> {
    (0..self.slots.len())
      .map(|index| self.probe(index, refresh))
      .collect()
  }

  fn unload_index(&mut self, index: usize) -> Result<(), BackendError> {
    let slot = &mut self.slots[index];
    if self.loaded == Some(slot.kind) {
      self.loaded = None;
    }
    if self.active == Some(slot.kind) {
      self.active = None;
    }
    match slot.instance.as_mut() {
      Some(instance) if instance.is_loaded() => instance.unload(),
      _ => Ok(()),
    }
  }

  /// 确保 `index` 是唯一已加载的实例
  fn activate(&mut self, index: usize) -> Result<(), BackendError> {
    let kind = self.slots[index].kind;
    if let Some(loaded) = self.loaded
      && loaded != kind
      && let Some(other) = self.index_of(loaded)
    {
      info!("切换运行时: {} -> {}", loaded, kind);
      if let Err(e) = self.unload_index(other) {
        warn!("卸载 {} 运行时失败: {}", loaded, e);
      }
    }

    self.ensure_instance(index)?;
    if let Some(instance) = self.slots[index].instance.as_mut()
      && !instance.is_loaded()
    {
      instance.load()?;
    }
    self.loaded = Some(kind);
    Ok(())
  }

  fn record_failure(&mut self, index: usize, err: &BackendError) {
    let kind = self.slots[index].kind;
    if !err.is_transient() {
      warn!("{} 运行时配置错误, 尝试下一个: {}", kind, err);
      self.slots[index].available = Some(false);
      return;
    }

    let until = self.clock.now() + self.cooldown;
    warn!("{} 运行时失败, 退避 {:?}: {}", kind, self.cooldown, err);
    if let Err(e) = self.unload_index(index) {
      warn!("卸载失败的 {} 运行时出错: {}", kind, e);
    }
    let slot = &mut self.slots[index];
    slot.instance = None;
    slot.available = Some(false);
    slot.backoff_until = Some(until);
  }

  fn candidates(&mut self) -> Vec<usize> {
    self
      .detect_available_runtimes(false)
      .iter()
      .enumerate()
      .filter(|(_, availability)| availability.available)
      .map(|(index, _)| index)
      .collect()
  }

  fn exhausted(failures: Vec<(RuntimeKind, String)>, last: Option<BackendError>) -> RuntimeError {
    match last {
      Some(last) => RuntimeError::Exhausted { failures, last },
      None => RuntimeError::NoRuntimeAvailable,
    }
  }

  /// 按优先级加载第一个可用的运行时
  pub fn load(&mut self) -> Result<RuntimeKind, RuntimeError> {
    let mut failures = Vec::new();
    let mut last = None;

    for index in self.candidates() {
      let kind = self.slots[index].kind;
      match self.activate(index) {
        Ok(()) => {
          self.active = Some(kind);
          info!("已激活运行时: {}", kind);
          return Ok(kind);
        }
        Err(e) => {
          self.record_failure(index, &e);
          failures.push((kind, e.to_string()));
          last = Some(e);
        }
      }
    }

    Err(Self::exhausted(failures, last))
  }

  /// 推理一次，失败时按优先级回退到下一个运行时
  pub fn infer(&mut self, input: &InferenceInput) -> Result<InferenceOutcome, RuntimeError> {
    let mut failures = Vec::new();
    let mut last = None;

    for index in self.candidates() {
      let kind = self.slots[index].kind;
      let result = self.activate(index).and_then(|()| {
        self.slots[index]
          .instance
          .as_mut()
          .ok_or_else(|| BackendError::Configuration(format!("{} 运行时实例缺失", kind)))?
          .infer(input)
      });

      match result {
        Ok(output) => {
          self.slots[index].backoff_until = None;
          if self.active != Some(kind) {
            info!("当前运行时: {}", kind);
          }
          self.active = Some(kind);
          let detections = postprocess(&output.predictions, &self.config);
          debug!(
            "{} 推理完成: {} 个检测结果, 耗时 {:.2} ms",
            kind,
            detections.len(),
            output.infer_ms
          );
          return Ok(InferenceOutcome {
            runtime: kind,
            detections,
            infer_ms: output.infer_ms,
          });
        }
        Err(e) => {
          self.record_failure(index, &e);
          failures.push((kind, e.to_string()));
          last = Some(e);
        }
      }
    }

    Err(Self::exhausted(failures, last))
  }

  /// 合并配置补丁并推送给所有存活的实例
  pub fn update_config(&mut self, patch: &ConfigPatch) -> Arc<RuntimeConfig> {
    let config = Arc::new(self.config.merged(patch));
    debug!("更新运行时配置: {:?}", config);
    for instance in self.slots.iter_mut().filter_map(|slot| slot.instance.as_mut()) {
      instance.apply_config(config.clone());
    }
    self.config = config.clone();
    config
  }

  /// 显式切换到指定运行时：卸载并丢弃当前实例后加载目标运行时
  pub fn switch_runtime(&mut self, kind: RuntimeKind) -> Result<RuntimeKind, RuntimeError> {
    let index = self
      .index_of(kind)
      .ok_or_else(|| RuntimeError::UnknownRuntime(kind.to_string()))?;

    if let Some(current) = self.loaded
      && current != kind
      && let Some(current_index) = self.index_of(current)
    {
      if let Err(e) = self.unload_index(current_index) {
        warn!("卸载 {} 运行时失败: {}", current, e);
      }
      self.slots[current_index].instance = None;
      self.slots[current_index].available = None;
    }

    if !self.probe(index, true).available {
      return Err(RuntimeError::Unavailable(kind));
    }

    match self.activate(index) {
      Ok(()) => {
        self.active = Some(kind);
        info!("已切换到运行时: {}", kind);
        Ok(kind)
      }
      Err(source) => {
        self.record_failure(index, &source);
        Err(RuntimeError::Backend {
          runtime: kind,
          source,
        })
      }
    }
  }

  /// 卸载当前已加载的实例
  pub fn unload(&mut self) -> Result<(), RuntimeError> {
    self.active = None;
    let Some(kind) = self.loaded else {
      return Ok(());
    };
    let Some(index) = self.index_of(kind) else {
      self.loaded = None;
      return Ok(());
    };

    self
      .unload_index(index)
      .map_err(|source| RuntimeError::Backend {
        runtime: kind,
        source,
      })?;
    info!("已卸载运行时: {}", kind);
    Ok(())
  }
}

impl Drop for RuntimeRegistry {
  fn drop(&mut self) {
    if let Err(e) = self.unload() {
      warn!("释放注册表时卸载运行时失败: {}", e);
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::{
    clock::ManualClock,
    model::RawPrediction,
    runtime::{BackendOutput, ImagePayload},
  };
  use serde_json::json;
  use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  };

  /// 各后端共享的调用计数
  #[derive(Debug, Default)]
  pub(crate) struct Calls {
    pub probes: AtomicUsize,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub infers: AtomicUsize,
    pub constructed: AtomicUsize,
  }

  impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
      counter.load(Ordering::SeqCst)
    }
  }

  #[derive(Debug, Clone, Copy, PartialEq)]
  pub(crate) enum Behavior {
    Succeed,
    FailTransient,
    FailConfiguration,
    Unavailable,
  }

  pub(crate) struct MockBackend {
    kind: RuntimeKind,
    behavior: Arc<Mutex<Behavior>>,
    calls: Arc<Calls>,
    loaded: bool,
    config: Arc<RuntimeConfig>,
  }

  impl InferenceBackend for MockBackend {
    fn runtime(&self) -> RuntimeKind {
      self.kind
    }

    fn available(&mut self) -> bool {
      self.calls.probes.fetch_add(1, Ordering::SeqCst);
      *self.behavior.lock().unwrap() != Behavior::Unavailable
    }

    fn is_loaded(&self) -> bool {
      self.loaded
    }

    fn load(&mut self) -> Result<(), BackendError> {
      self.calls.loads.fetch_add(1, Ordering::SeqCst);
      self.loaded = true;
      Ok(())
    }

    fn unload(&mut self) -> Result<(), BackendError> {
      self.calls.unloads.fetch_add(1, Ordering::SeqCst);
      self.loaded = false;
      Ok(())
    }

    fn infer(&mut self, _input: &InferenceInput) -> Result<BackendOutput, BackendError> {
      self.calls.infers.fetch_add(1, Ordering::SeqCst);
      match *self.behavior.lock().unwrap() {
        Behavior::FailTransient => Err(BackendError::Server(format!("{} exploded", self.kind))),
        Behavior::FailConfiguration => Err(BackendError::Configuration("bad input".into())),
        _ => Ok(BackendOutput {
          predictions: RawPrediction::from_values(&[
            json!({ "bbox": [0, 0, 10, 10], "score": 0.9, "label": "cat" }),
            json!({ "bbox": [0, 0, 10, 9], "score": 0.8, "label": "cat" }),
            json!({ "bbox": [0, 0, 10, 10], "score": self.config.confidence_threshold / 2.0 }),
          ]),
          infer_ms: 5.0,
        }),
      }
    }

    fn apply_config(&mut self, config: Arc<RuntimeConfig>) {
      self.config = config;
    }
  }

  pub(crate) fn mock_factory(
    kind: RuntimeKind,
    behavior: Arc<Mutex<Behavior>>,
    calls: Arc<Calls>,
  ) -> BackendFactory {
    Box::new(move |config: Arc<RuntimeConfig>| {
      calls.constructed.fetch_add(1, Ordering::SeqCst);
      Ok(Box::new(MockBackend {
        kind,
        behavior: behavior.clone(),
        calls: calls.clone(),
        loaded: false,
        config,
      }) as Box<dyn InferenceBackend>)
    })
  }

  struct Harness {
    clock: ManualClock,
    behaviors: Vec<Arc<Mutex<Behavior>>>,
    calls: Vec<Arc<Calls>>,
    registry: RuntimeRegistry,
  }

  fn harness(behaviors: [Behavior; 3]) -> Harness {
    let clock = ManualClock::new();
    let mut builder = RuntimeRegistry::builder()
      .clock(Arc::new(clock.clone()))
      .cooldown(Duration::from_secs(10));
    let mut handles = Vec::new();
    let mut calls = Vec::new();
    // 故意倒序注册，验证按优先级排序
    for (kind, behavior) in RuntimeKind::PRIORITY.iter().zip(behaviors).rev() {
      let behavior = Arc::new(Mutex::new(behavior));
      let counter = Arc::new(Calls::default());
      builder = builder.register(*kind, mock_factory(*kind, behavior.clone(), counter.clone()));
      handles.push(behavior);
      calls.push(counter);
    }
    handles.reverse();
    calls.reverse();

    Harness {
      clock,
      behaviors: handles,
      calls,
      registry: builder.build(),
    }
  }

  fn image() -> InferenceInput {
    InferenceInput::Image(ImagePayload::Encoded {
      bytes: vec![1, 2, 3],
      mime: "image/jpeg".into(),
    })
  }

  #[test]
  fn test_detect_available_runtimes_in_priority_order() {
    let mut h = harness([Behavior::Unavailable, Behavior::Succeed, Behavior::Succeed]);
    assert_eq!(h.registry.registered(), RuntimeKind::PRIORITY.to_vec());

    let availability = h.registry.detect_available_runtimes(true);
    let flags: Vec<bool> = availability.iter().map(|a| a.available).collect();
    assert_eq!(flags, vec![false, true, true]);

    // 缓存的可用结果不会重复探测，不可用的会
    h.registry.detect_available_runtimes(false);
    assert_eq!(Calls::get(&h.calls[0].probes), 2);
    assert_eq!(Calls::get(&h.calls[1].probes), 1);

    h.registry.detect_available_runtimes(true);
    assert_eq!(Calls::get(&h.calls[1].probes), 2);
  }

  #[test]
  fn test_infer_falls_back_and_backs_off() {
    let mut h = harness([Behavior::FailTransient, Behavior::FailTransient, Behavior::Succeed]);

    let outcome = h.registry.infer(&image()).expect("server should succeed");
    assert_eq!(outcome.runtime, RuntimeKind::Server);
    assert_eq!(h.registry.active_runtime(), Some(RuntimeKind::Server));
    assert_eq!(outcome.infer_ms, 5.0);
    // NMS 去掉重叠框，阈值去掉低置信度框
    assert_eq!(outcome.detections.len(), 1);
    assert_eq!(outcome.detections[0].class_key, "cat");

    for calls in &h.calls[..2] {
      assert_eq!(Calls::get(&calls.infers), 1);
      assert_eq!(Calls::get(&calls.unloads), 1);
    }

    // 退避期内不再探测失败的运行时
    h.clock.advance(Duration::from_secs(5));
    let availability = h.registry.detect_available_runtimes(false);
    assert_eq!(availability[0].backoff_remaining, Some(Duration::from_secs(5)));
    h.registry.infer(&image()).expect("server again");
    for calls in &h.calls[..2] {
      assert_eq!(Calls::get(&calls.probes), 1);
      assert_eq!(Calls::get(&calls.infers), 1);
    }
    assert_eq!(Calls::get(&h.calls[2].infers), 2);

    // 退避结束后重新探测并优先使用恢复的运行时
    *h.behaviors[0].lock().unwrap() = Behavior::Succeed;
    h.clock.advance(Duration::from_secs(6));
    let outcome = h.registry.infer(&image()).expect("tflite recovered");
    assert_eq!(outcome.runtime, RuntimeKind::Tflite);
    assert_eq!(Calls::get(&h.calls[0].constructed), 2);
    assert_eq!(h.registry.loaded_runtime(), Some(RuntimeKind::Tflite));
  }

  #[test]
  fn test_configuration_failure_skips_without_backoff() {
    let mut h = harness([Behavior::FailConfiguration, Behavior::Unavailable, Behavior::Succeed]);

    let outcome = h.registry.infer(&image()).expect("server");
    assert_eq!(outcome.runtime, RuntimeKind::Server);

    let availability = h.registry.detect_available_runtimes(false);
    assert_eq!(availability[0].backoff_remaining, None);
    // 配置错误不丢弃实例
    assert_eq!(Calls::get(&h.calls[0].constructed), 1);
    assert_eq!(Calls::get(&h.calls[0].probes), 2);
  }

  #[test]
  fn test_all_runtimes_exhausted() {
    let mut h = harness([Behavior::FailTransient, Behavior::Unavailable, Behavior::FailTransient]);

    match h.registry.infer(&image()) {
      Err(RuntimeError::Exhausted { failures, last }) => {
        let kinds: Vec<RuntimeKind> = failures.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(kinds, vec![RuntimeKind::Tflite, RuntimeKind::Server]);
        assert!(matches!(last, BackendError::Server(_)));
      }
      other => panic!("expected exhaustion, got {:?}", other.map(|o| o.runtime)),
    }
    assert_eq!(h.registry.active_runtime(), None);

    // 全部处于退避期或不可用
    assert!(matches!(h.registry.infer(&image()), Err(RuntimeError::NoRuntimeAvailable)));
    assert!(matches!(h.registry.load(), Err(RuntimeError::NoRuntimeAvailable)));
  }

  #[test]
  fn test_load_keeps_single_instance_loaded() {
    let mut h = harness([Behavior::Succeed, Behavior::Succeed, Behavior::Succeed]);

    assert_eq!(h.registry.load().expect("load"), RuntimeKind::Tflite);
    assert_eq!(h.registry.switch_runtime(RuntimeKind::Onnx).expect("switch"), RuntimeKind::Onnx);
    assert_eq!(Calls::get(&h.calls[0].unloads), 1);
    assert_eq!(h.registry.loaded_runtime(), Some(RuntimeKind::Onnx));

    // 下一次推理回到最高优先级并卸载 ONNX
    let outcome = h.registry.infer(&image()).expect("infer");
    assert_eq!(outcome.runtime, RuntimeKind::Tflite);
    assert_eq!(Calls::get(&h.calls[1].unloads), 1);
    assert_eq!(Calls::get(&h.calls[0].constructed), 2);

    h.registry.unload().expect("unload");
    assert_eq!(h.registry.active_runtime(), None);
    assert_eq!(h.registry.loaded_runtime(), None);
    assert_eq!(Calls::get(&h.calls[0].unloads), 2);
  }

  #[test]
  fn test_switch_to_unavailable_or_unregistered() {
    let calls = Arc::new(Calls::default());
    let mut registry = RuntimeRegistry::builder()
      .register(
        RuntimeKind::Onnx,
        mock_factory(
          RuntimeKind::Onnx,
          Arc::new(Mutex::new(Behavior::Unavailable)),
          calls,
        ),
      )
      .build();

    assert!(matches!(
      registry.switch_runtime(RuntimeKind::Server),
      Err(RuntimeError::UnknownRuntime(_))
    ));
    assert!(matches!(
      registry.switch_runtime(RuntimeKind::Onnx),
      Err(RuntimeError::Unavailable(RuntimeKind::Onnx))
    ));
  }

  #[test]
  fn test_update_config_reaches_live_instances() {
    let mut h = harness([Behavior::Succeed, Behavior::Succeed, Behavior::Succeed]);
    h.registry.infer(&image()).expect("warm up");

    let config = h.registry.update_config(&ConfigPatch::from(&json!({
      "confidenceThreshold": 0.95,
      "nmsIoU": 2.0,
    })));
    assert_eq!(config.confidence_threshold, 0.95);
    assert_eq!(config.nms_iou, 1.0);
    assert_eq!(h.registry.config().confidence_threshold, 0.95);

    // 新阈值作用于后处理
    let outcome = h.registry.infer(&image()).expect("infer");
    assert!(outcome.detections.is_empty());
  }
}
