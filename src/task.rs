// 该文件是 Shijue （视觉） 项目的一部分。
// src/task.rs - 采集循环
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

use tracing::{info, warn};

use crate::{frame::FramePacket, scheduler::FrameScheduler};

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// 一次采集循环的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureSummary {
  pub frames: usize,
  pub accepted: usize,
  pub dropped: u64,
}

/// 把帧源逐帧投递给调度器，直到帧源耗尽、达到帧数上限或收到停止信号
#[derive(Debug)]
pub struct CaptureTask {
  frame_number: Option<usize>,
  drain_timeout: Duration,
  stop: Arc<AtomicBool>,
}

impl Default for CaptureTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      drain_timeout: Duration::from_secs(5),
      stop: Arc::new(AtomicBool::new(false)),
    }
  }
}

impl CaptureTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 帧源结束后等待最后一帧推理完成的最长时间
  pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
    self.drain_timeout = drain_timeout;
    self
  }

  pub fn stop_handle(&self) -> Arc<AtomicBool> {
    self.stop.clone()
  }

  /// 安装 Ctrl-C 处理，进程内只能调用一次
  pub fn with_ctrlc(self) -> Result<Self, ctrlc::Error> {
    let stop = self.stop.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.store(true, Ordering::SeqCst);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    Ok(self)
  }

  pub fn run<I>(self, input: I, scheduler: &FrameScheduler) -> CaptureSummary
  where
    I: IntoIterator<Item = FramePacket>,
  {
    info!("开始任务...");
    scheduler.start();

    let mut summary = CaptureSummary::default();
    for frame in input {
      if self.stop.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }

      summary.frames += 1;
      if scheduler.enqueue_frame(frame) {
        summary.accepted += 1;
      }

      if self.frame_number.is_some_and(|n| summary.frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.frames);
        break;
      }
    }

    let deadline = Instant::now() + self.drain_timeout;
    while scheduler.is_busy() && Instant::now() < deadline {
      thread::sleep(DRAIN_POLL);
    }
    if scheduler.is_busy() {
      warn!("等待推理完成超时");
    }
    scheduler.stop();

    summary.dropped = scheduler.dropped_frames();
    info!(
      "任务完成，退出: 共 {} 帧, 派发 {} 帧, 丢弃 {} 帧",
      summary.frames, summary.accepted, summary.dropped
    );
    summary
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    clock::system_clock,
    config::SchedulerConfig,
    runtime::{
      RuntimeKind, RuntimeRegistry,
      registry::tests::{Behavior, Calls, mock_factory},
    },
    scheduler::{FrameFailure, FrameResult, FrameSink},
  };
  use std::sync::Mutex;

  #[derive(Default)]
  struct CountSink {
    results: Mutex<Vec<u64>>,
  }

  impl FrameSink for CountSink {
    fn on_result(&self, result: FrameResult) {
      self.results.lock().unwrap().push(result.frame_id);
    }

    fn on_error(&self, _failure: FrameFailure) {}
  }

  fn scheduler(sink: Arc<CountSink>) -> FrameScheduler {
    let registry = RuntimeRegistry::builder()
      .register(
        RuntimeKind::Server,
        mock_factory(
          RuntimeKind::Server,
          Arc::new(Mutex::new(Behavior::Succeed)),
          Arc::new(Calls::default()),
        ),
      )
      .build();
    let config = SchedulerConfig {
      max_inference_fps: 30,
      ..SchedulerConfig::default()
    };
    FrameScheduler::new(registry, sink, config, system_clock()).expect("scheduler")
  }

  fn frames() -> impl Iterator<Item = FramePacket> {
    (1..).map(|id| FramePacket::from_rgb_image(id, &image::RgbImage::new(4, 4)))
  }

  #[test]
  fn test_stops_at_frame_number_and_drains() {
    let sink = Arc::new(CountSink::default());
    let scheduler = scheduler(sink.clone());

    let summary = CaptureTask::default()
      .with_frame_number(Some(5))
      .run(frames(), &scheduler);

    assert_eq!(summary.frames, 5);
    assert_eq!(summary.frames as u64, summary.accepted as u64 + summary.dropped);
    assert!(summary.accepted >= 1);
    assert!(!scheduler.is_busy());

    // 回调在忙碌标记清除之后执行
    let deadline = Instant::now() + Duration::from_secs(2);
    while sink.results.lock().unwrap().is_empty() && Instant::now() < deadline {
      thread::sleep(DRAIN_POLL);
    }
    assert_eq!(sink.results.lock().unwrap().first(), Some(&1));
  }

  #[test]
  fn test_stop_flag_ends_loop() {
    let sink = Arc::new(CountSink::default());
    let scheduler = scheduler(sink);
    let task = CaptureTask::default();
    task.stop_handle().store(true, Ordering::SeqCst);

    let summary = task.run(frames(), &scheduler);
    assert_eq!(summary.frames, 0);
  }
}
