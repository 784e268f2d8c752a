// 该文件是 Shijue （视觉） 项目的一部分。
// src/clock.rs - 单调时钟
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

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 单调时钟，返回自时钟起点以来经过的时间
///
/// 退避窗口、推理限速与耗时统计都通过它取时间，测试中可替换为 [`ManualClock`]。
pub trait Clock: Send + Sync + std::fmt::Debug {
  fn now(&self) -> Duration;
}

#[derive(Debug)]
pub struct SystemClock {
  origin: Instant,
}

impl Default for SystemClock {
  fn default() -> Self {
    Self {
      origin: Instant::now(),
    }
  }
}

impl Clock for SystemClock {
  fn now(&self) -> Duration {
    self.origin.elapsed()
  }
}

/// 手动推进的时钟
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<Duration>>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn advance(&self, delta: Duration) {
    let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
    *now += delta;
  }

  pub fn set(&self, value: Duration) {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner) = value;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Duration {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

pub fn system_clock() -> Arc<dyn Clock> {
  Arc::new(SystemClock::default())
}

/// 将时长换算为毫秒（浮点）
pub fn as_millis_f64(duration: Duration) -> f64 {
  duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::new();
    assert_eq!(clock.now(), Duration::ZERO);

    clock.advance(Duration::from_millis(250));
    let shared = clock.clone();
    shared.advance(Duration::from_millis(250));

    assert_eq!(clock.now(), Duration::from_millis(500));
    assert_eq!(as_millis_f64(clock.now()), 500.0);
  }
}
