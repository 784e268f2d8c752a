// 该文件是 Shijue （视觉） 项目的一部分。
// src/scheduler/stride.rs - 自适应跳帧步长
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

use tracing::debug;

use crate::config::{SchedulerConfig, StrideTuning};

/// 根据每帧总耗时调整处理步长 N（每 N 帧处理一帧）
///
/// 连续若干帧超出预算时 N 加一，连续若干帧有余量时 N 减一，
/// 介于两者之间的帧会清空两边的计数。
#[derive(Debug, Clone)]
pub struct StrideController {
  stride: u32,
  max_stride: u32,
  tuning: StrideTuning,
  over_streak: u32,
  under_streak: u32,
}

impl StrideController {
  pub fn new(max_stride: u32, tuning: StrideTuning) -> Self {
    Self {
      stride: 1,
      max_stride: max_stride.max(1),
      tuning,
      over_streak: 0,
      under_streak: 0,
    }
  }

  pub fn from_config(config: &SchedulerConfig) -> Self {
    Self::new(config.max_stride(), config.stride)
  }

  pub fn stride(&self) -> u32 {
    self.stride
  }

  pub fn max_stride(&self) -> u32 {
    self.max_stride
  }

  /// 第 `counter` 帧（从 1 开始）是否落在处理位上
  pub fn should_process(&self, counter: u64) -> bool {
    counter % u64::from(self.stride) == 0
  }

  pub fn reset(&mut self) {
    self.stride = 1;
    self.over_streak = 0;
    self.under_streak = 0;
  }

  /// 应用新配置，当前步长截断到新的上限内
  pub fn reconfigure(&mut self, config: &SchedulerConfig) {
    self.max_stride = config.max_stride();
    self.tuning = config.stride;
    self.stride = self.stride.clamp(1, self.max_stride);
    self.over_streak = 0;
    self.under_streak = 0;
  }

  /// 记录一帧的总耗时，返回更新后的步长
  pub fn record(&mut self, total_ms: f64, budget_ms: f64) -> u32 {
    if self.max_stride <= 1 {
      self.reset();
      return self.stride;
    }

    if total_ms > budget_ms * self.tuning.over_budget_factor {
      self.over_streak += 1;
      self.under_streak = 0;
      if self.over_streak >= self.tuning.over_budget_frames {
        if self.stride < self.max_stride {
          self.stride += 1;
          debug!("推理超出预算, 步长增加到 {}", self.stride);
        }
        self.over_streak = 0;
      }
    } else if total_ms < budget_ms * self.tuning.under_budget_factor {
      self.under_streak += 1;
      self.over_streak = 0;
      if self.under_streak >= self.tuning.under_budget_frames {
        if self.stride > 1 {
          self.stride -= 1;
          debug!("推理有余量, 步长减少到 {}", self.stride);
        }
        self.under_streak = 0;
      }
    } else {
      self.over_streak = 0;
      self.under_streak = 0;
    }

    self.stride
  }
}
