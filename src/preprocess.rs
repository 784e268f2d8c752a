// 该文件是 Shijue （视觉） 项目的一部分。
// src/preprocess.rs - 帧预处理
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

use thiserror::Error;

use crate::{
  config::{Normalization, Resolution},
  frame::{FramePacket, PixelFormat, RGB_CHANNELS, Tensor, TensorLayout},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessError {
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
  #[error("目标分辨率无效: {0}")]
  InvalidTarget(Resolution),
  #[error("缓冲区长度不匹配: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  BufferLength { expected: usize, actual: usize },
  #[error("无法从 {actual} 字节推断 {width}x{height} 帧的像素布局")]
  UnknownLayout { width: u32, height: u32, actual: usize },
  #[error("不支持的像素格式: {0:?}")]
  UnsupportedPixelFormat(PixelFormat),
}

/// 最近邻采样的源索引表，`index[i] = min(src - 1, floor(i * src / dst))`
fn nearest_index(src: usize, dst: usize) -> Vec<usize> {
  (0..dst).map(|i| (i * src / dst).min(src - 1)).collect()
}

fn pixel_stride(packet: &FramePacket, pixels: usize) -> Result<usize, PreprocessError> {
  let actual = packet.bytes.len();
  match packet.pixel_format {
    PixelFormat::Yuv => Err(PreprocessError::UnsupportedPixelFormat(PixelFormat::Yuv)),
    PixelFormat::Unknown => [RGB_CHANNELS, 4, 1]
      .into_iter()
      .find(|channels| pixels * channels == actual)
      .ok_or(PreprocessError::UnknownLayout {
        width: packet.width,
        height: packet.height,
        actual,
      }),
    format => {
      // 其余格式均有固定通道数
      let channels = format.channels().unwrap_or(RGB_CHANNELS);
      let expected = pixels * channels;
      if actual < expected {
        return Err(PreprocessError::BufferLength { expected, actual });
      }
      Ok(channels)
    }
  }
}

/// 把原始帧缩放并归一化为 `[1, H, W, 3]` 的 NHWC 浮点张量
///
/// 采用逐轴独立缩放的最近邻采样，像素值先除以 255 再按 `(v - mean) / std`
/// 归一化。单通道源复制到三个通道，BGR 顺序的源会交换为 RGB。
/// 失败时不返回任何部分结果。
pub fn preprocess_frame(
  packet: &FramePacket,
  target: Resolution,
  normalization: &Normalization,
) -> Result<Tensor, PreprocessError> {
  if packet.width == 0 || packet.height == 0 {
    return Err(PreprocessError::InvalidDimensions {
      width: packet.width,
      height: packet.height,
    });
  }
  if target.width == 0 || target.height == 0 {
    return Err(PreprocessError::InvalidTarget(target));
  }

  let (src_w, src_h) = (packet.width as usize, packet.height as usize);
  let (dst_w, dst_h) = (target.width as usize, target.height as usize);
  let stride = pixel_stride(packet, src_w * src_h)?;

  let order: [usize; 3] = match (stride, packet.pixel_format.is_bgr_order()) {
    (1, _) => [0, 0, 0],
    (_, true) => [2, 1, 0],
    _ => [0, 1, 2],
  };

  let x_map = nearest_index(src_w, dst_w);
  let y_map = nearest_index(src_h, dst_h);
  let Normalization { mean, std } = *normalization;
  let bytes = &packet.bytes;

  let mut data = Vec::with_capacity(dst_w * dst_h * RGB_CHANNELS);
  for &src_y in &y_map {
    let row = src_y * src_w * stride;
    for &src_x in &x_map {
      let offset = row + src_x * stride;
      for c in 0..RGB_CHANNELS {
        let value = f32::from(bytes[offset + order[c]]) / 255.0;
        data.push((value - mean[c]) / std[c]);
      }
    }
  }

  Ok(Tensor {
    data,
    shape: [1, dst_h, dst_w, RGB_CHANNELS],
    layout: TensorLayout::Nhwc,
    source_width: packet.width,
    source_height: packet.height,
    rotation: packet.rotation,
    pixel_format: packet.pixel_format,
  })
}
