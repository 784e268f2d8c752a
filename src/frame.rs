// 该文件是 Shijue （视觉） 项目的一部分。
// src/frame.rs - 帧与张量定义
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

use chrono::{DateTime, Utc};
use image::RgbImage;

pub const RGB_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
  #[default]
  Rgb,
  Bgr,
  Rgba,
  Bgra,
  Gray,
  Yuv,
  /// 未声明格式，按缓冲区长度推断通道数
  Unknown,
}

impl PixelFormat {
  /// 每像素字节数，`Yuv` 与 `Unknown` 没有固定值
  pub fn channels(&self) -> Option<usize> {
    match self {
      PixelFormat::Rgb | PixelFormat::Bgr => Some(3),
      PixelFormat::Rgba | PixelFormat::Bgra => Some(4),
      PixelFormat::Gray => Some(1),
      PixelFormat::Yuv | PixelFormat::Unknown => None,
    }
  }

  /// 通道顺序是否为 B, G, R
  pub fn is_bgr_order(&self) -> bool {
    matches!(self, PixelFormat::Bgr | PixelFormat::Bgra)
  }

  pub fn parse(name: &str) -> Self {
    match name.trim().to_ascii_lowercase().as_str() {
      "rgb" => PixelFormat::Rgb,
      "bgr" => PixelFormat::Bgr,
      "rgba" => PixelFormat::Rgba,
      "bgra" => PixelFormat::Bgra,
      "gray" | "grey" | "luma" => PixelFormat::Gray,
      "yuv" | "yuv420" | "nv21" => PixelFormat::Yuv,
      _ => PixelFormat::Unknown,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub fn degrees(&self) -> u32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }

  /// 任意角度向下取整到 90 的倍数
  pub fn from_degrees(degrees: i32) -> Self {
    match degrees.rem_euclid(360) / 90 {
      1 => Rotation::Deg90,
      2 => Rotation::Deg180,
      3 => Rotation::Deg270,
      _ => Rotation::Deg0,
    }
  }
}

/// 采集端交给调度器的一帧原始图像
#[derive(Debug, Clone)]
pub struct FramePacket {
  pub frame_id: u64,
  pub captured_at: DateTime<Utc>,
  pub width: u32,
  pub height: u32,
  pub pixel_format: PixelFormat,
  pub rotation: Rotation,
  pub bytes: Vec<u8>,
}

impl FramePacket {
  pub fn new(
    frame_id: u64,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    bytes: Vec<u8>,
  ) -> Self {
    Self {
      frame_id,
      captured_at: Utc::now(),
      width,
      height,
      pixel_format,
      rotation: Rotation::default(),
      bytes,
    }
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
    self.captured_at = captured_at;
    self
  }

  pub fn from_rgb_image(frame_id: u64, image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self::new(frame_id, width, height, PixelFormat::Rgb, image.as_raw().clone())
  }

  /// 转为 RGB 图像，YUV 或无法推断布局时返回 `None`
  pub fn to_rgb_image(&self) -> Option<RgbImage> {
    rgb_image_from_raw(self.width, self.height, self.pixel_format, &self.bytes)
  }

  /// 源图像尺寸 `[宽, 高]`
  pub fn source_size(&self) -> [u32; 2] {
    [self.width, self.height]
  }
}

/// 按像素格式把原始缓冲区转换为 RGB 图像
pub fn rgb_image_from_raw(
  width: u32,
  height: u32,
  pixel_format: PixelFormat,
  bytes: &[u8],
) -> Option<RgbImage> {
  let pixels = width as usize * height as usize;
  if pixels == 0 {
    return None;
  }
  let channels = match pixel_format {
    PixelFormat::Yuv => return None,
    PixelFormat::Unknown => [RGB_CHANNELS, 4, 1]
      .into_iter()
      .find(|channels| pixels * channels == bytes.len())?,
    format => format.channels()?,
  };
  if bytes.len() < pixels * channels {
    return None;
  }

  let bgr = pixel_format.is_bgr_order();
  Some(RgbImage::from_fn(width, height, |x, y| {
    let offset = (y as usize * width as usize + x as usize) * channels;
    let pixel = &bytes[offset..offset + channels];
    match (channels, bgr) {
      (1, _) => image::Rgb([pixel[0]; 3]),
      (_, true) => image::Rgb([pixel[2], pixel[1], pixel[0]]),
      _ => image::Rgb([pixel[0], pixel[1], pixel[2]]),
    }
  }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  Nhwc,
}

/// 预处理后的浮点张量，形状固定为 `[1, H, W, 3]`
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  pub data: Vec<f32>,
  pub shape: [usize; 4],
  pub layout: TensorLayout,
  pub source_width: u32,
  pub source_height: u32,
  pub rotation: Rotation,
  pub pixel_format: PixelFormat,
}

impl Tensor {
  pub fn height(&self) -> usize {
    self.shape[1]
  }

  pub fn width(&self) -> usize {
    self.shape[2]
  }

  pub fn channels(&self) -> usize {
    self.shape[3]
  }

  /// 取 `(y, x)` 处的一个像素
  pub fn pixel(&self, y: usize, x: usize) -> Option<&[f32]> {
    if y >= self.height() || x >= self.width() {
      return None;
    }
    let start = (y * self.width() + x) * self.channels();
    self.data.get(start..start + self.channels())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pixel_format_channels() {
    assert_eq!(PixelFormat::Rgb.channels(), Some(3));
    assert_eq!(PixelFormat::Bgra.channels(), Some(4));
    assert_eq!(PixelFormat::Gray.channels(), Some(1));
    assert_eq!(PixelFormat::Yuv.channels(), None);
    assert_eq!(PixelFormat::parse("NV21"), PixelFormat::Yuv);
    assert_eq!(PixelFormat::parse("whatever"), PixelFormat::Unknown);
  }

  #[test]
  fn test_rotation_from_degrees() {
    assert_eq!(Rotation::from_degrees(90), Rotation::Deg90);
    assert_eq!(Rotation::from_degrees(-90), Rotation::Deg270);
    assert_eq!(Rotation::from_degrees(450), Rotation::Deg90);
    assert_eq!(Rotation::from_degrees(179), Rotation::Deg90);
  }

  #[test]
  fn test_rgb_image_from_raw() {
    let bgra = rgb_image_from_raw(1, 1, PixelFormat::Bgra, &[1, 2, 3, 4]).expect("bgra");
    assert_eq!(bgra.get_pixel(0, 0).0, [3, 2, 1]);

    let gray = rgb_image_from_raw(2, 1, PixelFormat::Gray, &[7, 9]).expect("gray");
    assert_eq!(gray.get_pixel(1, 0).0, [9, 9, 9]);

    assert!(rgb_image_from_raw(1, 1, PixelFormat::Yuv, &[0; 3]).is_none());
    assert!(rgb_image_from_raw(2, 2, PixelFormat::Rgb, &[0; 3]).is_none());
  }

  #[test]
  fn test_packet_from_rgb_image() {
    let image = RgbImage::from_pixel(4, 2, image::Rgb([1, 2, 3]));
    let packet = FramePacket::from_rgb_image(7, &image);
    assert_eq!(packet.frame_id, 7);
    assert_eq!(packet.source_size(), [4, 2]);
    assert_eq!(packet.bytes.len(), 4 * 2 * RGB_CHANNELS);
    assert_eq!(&packet.bytes[..3], &[1, 2, 3]);
  }
}
