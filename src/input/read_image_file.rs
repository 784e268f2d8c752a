// 该文件是 Shijue （视觉） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::{thread, time::Duration};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::FramePacket};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(image::ImageError),
  #[error("无效的参数 {name}: {value}")]
  InvalidParameter { name: &'static str, value: String },
}

impl From<std::io::Error> for ImageFileInputError {
  fn from(err: std::io::Error) -> Self {
    ImageFileInputError::IoError(err)
  }
}

impl From<image::ImageError> for ImageFileInputError {
  fn from(err: image::ImageError) -> Self {
    ImageFileInputError::ImageLoadError(err)
  }
}

/// `image:///path/to/frame.jpg?repeat=N&interval_ms=M`
///
/// 把一张图像当作采集源，按固定间隔重复产出 `N` 帧（`repeat=0` 表示无限重复）。
pub struct ImageFileInput {
  image: RgbImage,
  repeat: usize,
  interval: Duration,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

fn query_number(url: &Url, name: &'static str) -> Result<Option<u64>, ImageFileInputError> {
  url
    .query_pairs()
    .find(|(key, _)| key == name)
    .map(|(_, value)| {
      value
        .trim()
        .parse::<u64>()
        .map_err(|_| ImageFileInputError::InvalidParameter {
          name,
          value: value.to_string(),
        })
    })
    .transpose()
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let repeat = query_number(url, "repeat")?.unwrap_or(1) as usize;
    let interval = Duration::from_millis(query_number(url, "interval_ms")?.unwrap_or(0));

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    info!(
      "读取图像文件: {} ({}x{}), 重复 {} 次, 间隔 {:?}",
      path,
      image.width(),
      image.height(),
      repeat,
      interval
    );

    Ok(ImageFileInput {
      image,
      repeat,
      interval,
    })
  }
}

impl ImageFileInput {
  pub fn new(image: RgbImage, repeat: usize, interval: Duration) -> Self {
    Self {
      image,
      repeat,
      interval,
    }
  }
}

impl IntoIterator for ImageFileInput {
  type Item = FramePacket;
  type IntoIter = ImageFileFrames;

  fn into_iter(self) -> Self::IntoIter {
    ImageFileFrames {
      remaining: (self.repeat > 0).then_some(self.repeat),
      inner: self,
      next_id: 1,
    }
  }
}

pub struct ImageFileFrames {
  inner: ImageFileInput,
  remaining: Option<usize>,
  next_id: u64,
}

impl Iterator for ImageFileFrames {
  type Item = FramePacket;

  fn next(&mut self) -> Option<Self::Item> {
    if let Some(remaining) = self.remaining.as_mut() {
      if *remaining == 0 {
        return None;
      }
      *remaining -= 1;
    }

    if self.next_id > 1 && !self.inner.interval.is_zero() {
      thread::sleep(self.inner.interval);
    }

    let frame_id = self.next_id;
    self.next_id += 1;
    debug!("产出第 {} 帧", frame_id);
    Some(FramePacket::from_rgb_image(frame_id, &self.inner.image))
  }
}
