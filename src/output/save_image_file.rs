// 该文件是 Shijue （视觉） 项目的一部分。
// src/output/save_image_file.rs - 保存标注后的图像
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

use std::path::Path;

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FramePacket, PixelFormat},
  output::{Render, draw::Draw, overlay::ScreenBox},
};

/// `image:///path/to/out.png`
///
/// 每一帧覆盖写入同一个文件，屏幕框坐标需与源图像像素一致。
pub struct SaveImageFileOutput {
  path: String,
  draw: Draw,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(image::ImageError),
  #[error("无法转换像素格式为 {0:?} 的帧")]
  UnsupportedFrame(PixelFormat),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: uri.path().to_string(),
      draw: Draw::default(),
    })
  }
}

impl SaveImageFileOutput {
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  fn save_image(&self, image: image::RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(SaveImageFileError::IoError)?;
    }

    image
      .save(&self.path)
      .map_err(SaveImageFileError::ImageError)?;

    warn!("保存图像到文件: {}", self.path);

    Ok(())
  }
}

impl Render<FramePacket, Vec<ScreenBox>> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &FramePacket, result: &Vec<ScreenBox>) -> Result<(), Self::Error> {
    let mut image = frame
      .to_rgb_image()
      .ok_or(SaveImageFileError::UnsupportedFrame(frame.pixel_format))?;
    self.draw.draw_boxes(&mut image, result);
    self.save_image(image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn output_in(dir: &Path) -> SaveImageFileOutput {
    let url = Url::parse(&format!("image://{}/nested/out.png", dir.display())).expect("url");
    SaveImageFileOutput::from_url(&url).expect("output")
  }

  fn red_box() -> ScreenBox {
    ScreenBox {
      track_key: "cup:0".to_string(),
      x: 1.0,
      y: 1.0,
      width: 4.0,
      height: 4.0,
      color: [255, 0, 0],
      label: "cup".to_string(),
      confidence: 0.9,
      model_box: [0.0; 4],
      source_box: [0.0; 4],
    }
  }

  #[test]
  fn test_renders_and_saves_annotated_frame() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = output_in(dir.path());
    let frame = FramePacket::new(1, 8, 8, PixelFormat::Bgr, vec![0; 8 * 8 * 3]);

    output.render_result(&frame, &vec![red_box()]).expect("render");

    let saved = image::open(output.path()).expect("open").to_rgb8();
    assert_eq!(saved.dimensions(), (8, 8));
    assert_eq!(saved.get_pixel(1, 1).0, [255, 0, 0]);
    assert_eq!(saved.get_pixel(3, 3).0, [0, 0, 0]);
  }

  #[test]
  fn test_scheme_and_frame_errors() {
    let url = Url::parse("file:///tmp/out.png").expect("url");
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));

    let dir = tempfile::tempdir().expect("tempdir");
    let output = output_in(dir.path());
    let yuv = FramePacket::new(1, 2, 2, PixelFormat::Yuv, vec![0; 6]);
    assert!(matches!(
      output.render_result(&yuv, &Vec::new()),
      Err(SaveImageFileError::UnsupportedFrame(PixelFormat::Yuv))
    ));
  }
}
