// 该文件是 Shijue （视觉） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::{
  collections::VecDeque,
  sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use shijue::{
  FromUrl,
  clock::system_clock,
  config::{ConfigPatch, RuntimeConfig, SchedulerConfig},
  frame::FramePacket,
  input::InputWrapper,
  output::{
    BoxSmoother, CoordinateMapper, DisplayResizeMode, GeometryBasis, ModelResizeMode,
    OutputWrapper, Render, draw::Draw,
  },
  runtime::{RemoteBackend, RemoteEndpoint, RuntimeKind, RuntimeRegistry},
  scheduler::{FrameFailure, FrameResult, FrameScheduler, FrameSink},
  task::CaptureTask,
};

use crate::args::{Args, Viewport};

/// 等待推理结果的帧，最多保留的数量
const FRAME_HISTORY: usize = 8;

/// 把推理结果映射到屏幕并写出标注图像
struct OverlaySink {
  frames: Mutex<VecDeque<FramePacket>>,
  smoother: Mutex<BoxSmoother>,
  output: OutputWrapper,
  model_resize: ModelResizeMode,
  display_resize: DisplayResizeMode,
  viewport: Option<Viewport>,
}

impl OverlaySink {
  fn remember(&self, frame: &FramePacket) {
    let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
    if frames.len() >= FRAME_HISTORY {
      frames.pop_front();
    }
    frames.push_back(frame.clone());
  }

  fn take_frame(&self, frame_id: u64) -> Option<FramePacket> {
    let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
    let index = frames.iter().position(|f| f.frame_id == frame_id)?;
    frames.drain(..=index).last()
  }
}

impl FrameSink for OverlaySink {
  fn on_result(&self, result: FrameResult) {
    info!(
      "第 {} 帧 ({}): {} 个目标, 推理耗时: {:.2} ms / {:.2} ms, 步长 {}, 丢帧 {}",
      result.frame_id,
      result.runtime,
      result.detections.len(),
      result.timings.infer_ms,
      result.timings.total_ms,
      result.stride,
      result.dropped_frames_since_last
    );

    let Some(frame) = self.take_frame(result.frame_id) else {
      warn!("找不到第 {} 帧的图像, 跳过渲染", result.frame_id);
      return;
    };

    let basis = GeometryBasis::new(result.input_size, result.source_size)
      .with_model_resize(self.model_resize)
      .with_display_resize(self.display_resize);
    let viewport = self.viewport.map_or(
      [result.source_size[0] as f32, result.source_size[1] as f32],
      |v| [v.width, v.height],
    );
    let boxes = CoordinateMapper::new(basis, viewport).map_detections(&result.detections);
    let boxes = self
      .smoother
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .smooth(&basis, boxes);

    for b in &boxes {
      info!(
        "  - {} {}: {:.2}% at ({:.0}, {:.0}, {:.0}x{:.0})",
        b.track_key,
        b.label,
        b.confidence * 100.0,
        b.x,
        b.y,
        b.width,
        b.height
      );
    }

    if let Err(e) = self.output.render_result(&frame, &boxes) {
      warn!("渲染第 {} 帧失败: {}", result.frame_id, e);
    }
  }

  fn on_error(&self, failure: FrameFailure) {
    warn!(
      "第 {} 帧推理失败 ({:.2} ms): {}",
      failure.frame_id, failure.total_ms, failure.error
    );
  }
}

fn load_patch(args: &Args) -> Result<ConfigPatch> {
  let mut patch = match &args.config {
    Some(path) => {
      let text = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
      let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("配置文件不是合法的 JSON: {}", path.display()))?;
      ConfigPatch::from(&value)
    }
    None => ConfigPatch::default(),
  };
  if let Some(fps) = args.fps {
    patch.max_inference_fps = Some(f64::from(fps));
  }
  Ok(patch)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!(
    "推理服务: {}",
    args.server.as_ref().map_or("未配置".to_string(), |s| s.to_string())
  );

  let patch = load_patch(&args)?;
  let runtime_config = RuntimeConfig::default().merged(&patch);
  let scheduler_config = SchedulerConfig::default().merged(&patch);

  let endpoint = args
    .server
    .as_ref()
    .map(RemoteEndpoint::from_url)
    .transpose()?;
  let registry = RuntimeRegistry::builder()
    .config(runtime_config)
    .register(RuntimeKind::Server, RemoteBackend::factory(endpoint))
    .build();

  let mut draw = Draw::default();
  if let Some(font) = &args.font {
    draw = draw.with_font_file(font)?;
  }
  let sink = Arc::new(OverlaySink {
    frames: Mutex::new(VecDeque::with_capacity(FRAME_HISTORY)),
    smoother: Mutex::new(BoxSmoother::new(args.smoothing)),
    output: OutputWrapper::from_url(&args.output)?.with_draw(draw),
    model_resize: args.model_resize.into(),
    display_resize: args.display_resize.into(),
    viewport: args.viewport,
  });

  let scheduler = FrameScheduler::new(registry, sink.clone(), scheduler_config, system_clock())?;
  let input = InputWrapper::from_url(&args.input)?;

  let summary = CaptureTask::default()
    .with_frame_number(args.frame_number)
    .with_ctrlc()?
    .run(input.into_iter().inspect(|frame| sink.remember(frame)), &scheduler);

  scheduler.dispose();
  info!(
    "处理完成! 总帧数: {}, 派发: {}, 丢帧: {}",
    summary.frames, summary.accepted, summary.dropped
  );

  Ok(())
}
