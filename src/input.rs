// 该文件是 Shijue （视觉） 项目的一部分。
// src/input.rs - 帧输入
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

use crate::{FromUrl, FromUrlWithScheme, frame::FramePacket};

mod read_image_file;

pub use self::read_image_file::{ImageFileFrames, ImageFileInput, ImageFileInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 按 URI 方案选择的输入
pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() == ImageFileInput::SCHEME {
      let input = ImageFileInput::from_url(url)?;
      return Ok(InputWrapper::ReadImageFile(input));
    }
    Err(InputError::SchemeMismatch)
  }
}

impl IntoIterator for InputWrapper {
  type Item = FramePacket;
  type IntoIter = InputFrames;

  fn into_iter(self) -> Self::IntoIter {
    match self {
      InputWrapper::ReadImageFile(input) => InputFrames::ReadImageFile(input.into_iter()),
    }
  }
}

pub enum InputFrames {
  ReadImageFile(ImageFileFrames),
}

impl Iterator for InputFrames {
  type Item = FramePacket;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputFrames::ReadImageFile(input) => input.next(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unknown_scheme() {
    let url = url::Url::parse("v4l:///dev/video0").expect("url");
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }
}
