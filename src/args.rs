// 该文件是 Shijue （视觉） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use url::Url;

use shijue::output::{DisplayResizeMode, ModelResizeMode};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelResize {
  Stretch,
  Letterbox,
}

impl From<ModelResize> for ModelResizeMode {
  fn from(mode: ModelResize) -> Self {
    match mode {
      ModelResize::Stretch => ModelResizeMode::Stretch,
      ModelResize::Letterbox => ModelResizeMode::Letterbox,
    }
  }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayResize {
  Stretch,
  Contain,
  Cover,
}

impl From<DisplayResize> for DisplayResizeMode {
  fn from(mode: DisplayResize) -> Self {
    match mode {
      DisplayResize::Stretch => DisplayResizeMode::Stretch,
      DisplayResize::Contain => DisplayResizeMode::Contain,
      DisplayResize::Cover => DisplayResizeMode::Cover,
    }
  }
}

/// 视口尺寸，`宽x高`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
  pub width: f32,
  pub height: f32,
}

fn parse_viewport(value: &str) -> Result<Viewport, String> {
  let (width, height) = value
    .split_once(['x', 'X'])
    .ok_or_else(|| format!("视口格式应为 宽x高: {}", value))?;
  let parse = |side: &str| {
    side
      .trim()
      .parse::<f32>()
      .ok()
      .filter(|v| v.is_finite() && *v > 0.0)
      .ok_or_else(|| format!("无效的视口尺寸: {}", value))
  };
  Ok(Viewport {
    width: parse(width)?,
    height: parse(height)?,
  })
}

/// Shijue 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，例如 image:///path/frame.jpg?repeat=30&interval_ms=33
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///path/out.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 远程推理服务地址
  #[arg(long, value_name = "SERVER")]
  pub server: Option<Url>,
  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 标签字体文件，不指定时只画边框
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 最大推理帧率，覆盖配置文件
  #[arg(long, value_name = "FPS")]
  pub fps: Option<u32>,
  /// 视口尺寸，默认与源图像一致
  #[arg(long, value_name = "WxH", value_parser = parse_viewport)]
  pub viewport: Option<Viewport>,
  #[arg(long, value_enum, default_value_t = ModelResize::Stretch)]
  pub model_resize: ModelResize,
  #[arg(long, value_enum, default_value_t = DisplayResize::Stretch)]
  pub display_resize: DisplayResize,
  /// 检测框平滑系数 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.35, value_name = "ALPHA")]
  pub smoothing: f32,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}
