// 该文件是 Shijue （视觉） 项目的一部分。
// src/scheduler.rs - 帧调度器
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

//! 帧调度
//!
//! 采集线程调用 [`FrameScheduler::enqueue_frame`] 投递帧，调度器按最大推理帧率限速，
//! 按自适应步长跳帧，同一时刻只有一帧在推理。推理期间到达的帧只保留最新的一帧，
//! 当前帧完成后立即处理。

use std::{
  sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
  thread::{self, JoinHandle},
  time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  clock::{Clock, as_millis_f64},
  config::{ConfigPatch, SchedulerConfig},
  frame::FramePacket,
  model::Detection,
  preprocess::{PreprocessError, preprocess_frame},
  runtime::{InferenceInput, RuntimeError, RuntimeKind, RuntimeRegistry},
};

pub mod stride;

pub use self::stride::StrideController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
  Idle,
  Started,
  Stopped,
  Disposed,
}

/// 单帧各阶段耗时（毫秒）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTimings {
  pub preprocess_ms: f64,
  pub infer_ms: f64,
  pub total_ms: f64,
}

#[derive(Debug, Clone)]
pub struct FrameResult {
  pub frame_id: u64,
  pub runtime: RuntimeKind,
  pub detections: Vec<Detection>,
  pub timings: FrameTimings,
  /// 源图像尺寸 `[宽, 高]`
  pub source_size: [u32; 2],
  /// 模型输入尺寸 `[宽, 高]`
  pub input_size: [u32; 2],
  pub dropped_frames_since_last: u64,
  pub stride: u32,
  pub target_budget_ms: f64,
  pub captured_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("预处理失败: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error(transparent)]
  Runtime(#[from] RuntimeError),
}

/// 处理失败的帧
#[derive(Debug)]
pub struct FrameFailure {
  pub frame_id: u64,
  pub captured_at: DateTime<Utc>,
  pub source_size: [u32; 2],
  pub total_ms: f64,
  pub error: PipelineError,
}

/// 接收调度结果的一方，回调在调度线程上执行
pub trait FrameSink: Send + Sync {
  fn on_result(&self, result: FrameResult);
  fn on_error(&self, failure: FrameFailure);
}

struct Shared {
  state: SchedulerState,
  busy: bool,
  /// 已派发给工作线程、尚未开始处理的帧
  job: Option<FramePacket>,
  /// 推理期间到达的最新一帧
  pending: Option<FramePacket>,
  config: SchedulerConfig,
  stride: StrideController,
  frame_counter: u64,
  last_started: Option<Duration>,
  dropped_total: u64,
  dropped_since_last: u64,
}

impl Shared {
  fn drop_frame(&mut self, frame_id: u64, reason: &str) {
    self.dropped_total += 1;
    self.dropped_since_last += 1;
    debug!("丢弃第 {} 帧: {}", frame_id, reason);
  }

  fn dispatch(&mut self, packet: FramePacket, now: Duration) {
    self.busy = true;
    self.last_started = Some(now);
    self.job = Some(packet);
  }

  fn reset_counters(&mut self) {
    self.frame_counter = 0;
    self.last_started = None;
    self.dropped_since_last = 0;
    self.stride.reset();
  }
}

struct Inner {
  shared: Mutex<Shared>,
  wakeup: Condvar,
  registry: Mutex<RuntimeRegistry>,
  sink: Arc<dyn FrameSink>,
  clock: Arc<dyn Clock>,
}

impl Inner {
  fn shared(&self) -> MutexGuard<'_, Shared> {
    self.shared.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn registry(&self) -> MutexGuard<'_, RuntimeRegistry> {
    self.registry.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn next_job(&self) -> Option<(FramePacket, SchedulerConfig, u32)> {
    let mut shared = self.shared();
    loop {
      if shared.state == SchedulerState::Disposed {
        return None;
      }
      if let Some(packet) = shared.job.take() {
        return Some((packet, shared.config.clone(), shared.stride.stride()));
      }
      shared = self
        .wakeup
        .wait(shared)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  fn process_frame(
    &self,
    packet: FramePacket,
    config: &SchedulerConfig,
  ) -> Result<(RuntimeKind, Vec<Detection>, FrameTimings), PipelineError> {
    let started = self.clock.now();
    let input = if config.preprocess_before_handoff {
      let tensor = preprocess_frame(&packet, config.input_resolution, &config.normalization)?;
      InferenceInput::Tensor(tensor)
    } else {
      InferenceInput::from(packet)
    };
    let preprocessed = self.clock.now();

    let outcome = self.registry().infer(&input)?;
    let finished = self.clock.now();

    Ok((
      outcome.runtime,
      outcome.detections,
      FrameTimings {
        preprocess_ms: as_millis_f64(preprocessed.saturating_sub(started)),
        infer_ms: outcome.infer_ms,
        total_ms: as_millis_f64(finished.saturating_sub(started)),
      },
    ))
  }

  fn run(&self) {
    debug!("调度线程启动");
    while let Some((packet, config, stride)) = self.next_job() {
      let frame_id = packet.frame_id;
      let captured_at = packet.captured_at;
      let source_size = packet.source_size();
      let started = self.clock.now();
      debug!("处理第 {} 帧图像", frame_id);

      let result = self.process_frame(packet, &config);
      let total_ms = match &result {
        Ok((_, _, timings)) => timings.total_ms,
        Err(_) => as_millis_f64(self.clock.now().saturating_sub(started)),
      };

      let dropped_frames_since_last = {
        let mut shared = self.shared();
        let budget = shared.config.target_budget_ms();
        shared.stride.record(total_ms, budget);
        shared.busy = false;
        if shared.state == SchedulerState::Started
          && let Some(next) = shared.pending.take()
        {
          let now = self.clock.now();
          shared.dispatch(next, now);
          self.wakeup.notify_all();
        }
        if result.is_ok() {
          std::mem::take(&mut shared.dropped_since_last)
        } else {
          shared.dropped_since_last
        }
      };

      match result {
        Ok((runtime, detections, timings)) => {
          debug!(
            "第 {} 帧推理完成 ({}), 耗时: {:.2} / {:.2} ms",
            frame_id, runtime, timings.infer_ms, timings.total_ms
          );
          self.sink.on_result(FrameResult {
            frame_id,
            runtime,
            detections,
            timings,
            source_size,
            input_size: config.input_resolution.as_array(),
            dropped_frames_since_last,
            stride,
            target_budget_ms: config.target_budget_ms(),
            captured_at,
          });
        }
        Err(error) => {
          warn!("第 {} 帧处理失败: {}", frame_id, error);
          self.sink.on_error(FrameFailure {
            frame_id,
            captured_at,
            source_size,
            total_ms,
            error,
          });
        }
      }
    }
    debug!("调度线程退出");
  }
}

/// 帧调度器
///
/// 状态：`Idle → Started ⇄ Stopped`，`Disposed` 为终态。
/// 所有方法都只需要 `&self`，可以在多个采集线程间共享。
pub struct FrameScheduler {
  inner: Arc<Inner>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameScheduler {
  pub fn new(
    registry: RuntimeRegistry,
    sink: Arc<dyn FrameSink>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
  ) -> std::io::Result<Self> {
    let inner = Arc::new(Inner {
      shared: Mutex::new(Shared {
        state: SchedulerState::Idle,
        busy: false,
        job: None,
        pending: None,
        stride: StrideController::from_config(&config),
        config,
        frame_counter: 0,
        last_started: None,
        dropped_total: 0,
        dropped_since_last: 0,
      }),
      wakeup: Condvar::new(),
      registry: Mutex::new(registry),
      sink,
      clock,
    });

    let worker = {
      let inner = inner.clone();
      thread::Builder::new()
        .name("shijue-scheduler".to_string())
        .spawn(move || inner.run())?
    };

    Ok(Self {
      inner,
      worker: Mutex::new(Some(worker)),
    })
  }

  /// 投递一帧，返回该帧是否被派发给工作线程
  ///
  /// 未启动、已释放、正在推理、未到限速间隔或不在步长处理位上时返回 `false`
  /// 并计入丢帧数。正在推理时该帧替换待处理帧，当前帧完成后立即处理。
  pub fn enqueue_frame(&self, packet: FramePacket) -> bool {
    let frame_id = packet.frame_id;
    let mut shared = self.inner.shared();

    if shared.state != SchedulerState::Started {
      let reason = match shared.state {
        SchedulerState::Disposed => "调度器已释放",
        _ => "调度器未启动",
      };
      shared.drop_frame(frame_id, reason);
      return false;
    }

    if shared.busy {
      if let Some(replaced) = shared.pending.replace(packet) {
        debug!("待处理帧 {} 被第 {} 帧替换", replaced.frame_id, frame_id);
      }
      shared.drop_frame(frame_id, "推理进行中");
      return false;
    }

    let now = self.inner.clock.now();
    if let Some(last) = shared.last_started
      && now.saturating_sub(last) < shared.config.min_interval()
    {
      shared.drop_frame(frame_id, "未到推理间隔");
      return false;
    }

    shared.frame_counter += 1;
    if !shared.stride.should_process(shared.frame_counter) {
      shared.drop_frame(frame_id, "跳帧");
      return false;
    }

    shared.dispatch(packet, now);
    self.inner.wakeup.notify_all();
    true
  }

  /// 合并配置补丁，运行时相关字段同步到注册表
  pub fn configure(&self, patch: &ConfigPatch) {
    {
      let mut shared = self.inner.shared();
      if shared.state == SchedulerState::Disposed {
        warn!("调度器已释放, 忽略配置更新");
        return;
      }
      shared.config = shared.config.merged(patch);
      let config = shared.config.clone();
      shared.stride.reconfigure(&config);
      shared.reset_counters();
      debug!("更新调度配置: {:?}", config);
    }

    let runtime_patch = patch.runtime_only();
    if !runtime_patch.is_empty() {
      self.inner.registry().update_config(&runtime_patch);
    }
  }

  fn sync_registry(&self) {
    let input_resolution = self.inner.shared().config.input_resolution;
    self.inner.registry().update_config(&ConfigPatch {
      input_resolution: Some(input_resolution),
      ..ConfigPatch::default()
    });
  }

  pub fn start(&self) {
    {
      let mut shared = self.inner.shared();
      match shared.state {
        SchedulerState::Disposed => {
          warn!("调度器已释放, 无法启动");
          return;
        }
        SchedulerState::Started => return,
        _ => {}
      }
      shared.state = SchedulerState::Started;
      shared.reset_counters();
      info!(
        "调度器启动: 最大推理帧率 {}, 最大步长 {}",
        shared.config.max_inference_fps,
        shared.stride.max_stride()
      );
    }
    self.sync_registry();
  }

  pub fn stop(&self) {
    {
      let mut shared = self.inner.shared();
      if shared.state != SchedulerState::Started {
        return;
      }
      shared.state = SchedulerState::Stopped;
      shared.pending = None;
      shared.reset_counters();
      info!("调度器停止, 累计丢帧 {}", shared.dropped_total);
    }
    self.sync_registry();
  }

  /// 停止工作线程并卸载运行时，之后所有帧都会被拒绝
  pub fn dispose(&self) {
    {
      let mut shared = self.inner.shared();
      if shared.state == SchedulerState::Disposed {
        return;
      }
      shared.state = SchedulerState::Disposed;
      shared.job = None;
      shared.pending = None;
      shared.busy = false;
      self.inner.wakeup.notify_all();
    }

    let worker = self
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(worker) = worker {
      // 在回调中释放时不能等待自己
      if worker.thread().id() == thread::current().id() {
        debug!("在调度线程内释放, 跳过等待");
      } else if worker.join().is_err() {
        error!("调度线程异常退出");
      }
    }

    if let Err(e) = self.inner.registry().unload() {
      warn!("释放调度器时卸载运行时失败: {}", e);
    }
    info!("调度器已释放");
  }

  pub fn state(&self) -> SchedulerState {
    self.inner.shared().state
  }

  pub fn is_busy(&self) -> bool {
    self.inner.shared().busy
  }

  /// 累计丢帧数
  pub fn dropped_frames(&self) -> u64 {
    self.inner.shared().dropped_total
  }

  pub fn current_stride(&self) -> u32 {
    self.inner.shared().stride.stride()
  }

  pub fn config(&self) -> SchedulerConfig {
    self.inner.shared().config.clone()
  }

  /// 在持有注册表锁的情况下访问注册表，推理进行中时会等待
  pub fn with_registry<R>(&self, f: impl FnOnce(&mut RuntimeRegistry) -> R) -> R {
    f(&mut self.inner.registry())
  }
}

impl Drop for FrameScheduler {
  fn drop(&mut self) {
    self.dispose();
  }
}
