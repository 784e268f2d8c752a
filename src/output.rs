// 该文件是 Shijue （视觉） 项目的一部分。
// src/output.rs - 渲染输出
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

//! 渲染侧：坐标映射、平滑与输出

#[cfg(feature = "save_image_file")]
use thiserror::Error;
#[cfg(feature = "save_image_file")]
use url::Url;

#[cfg(feature = "save_image_file")]
use crate::{FromUrl, FromUrlWithScheme, frame::FramePacket};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

pub mod overlay;

pub use self::overlay::{
  BoxSmoother, CoordinateMapper, DisplayResizeMode, GeometryBasis, ModelResizeMode, ScreenBox,
};

#[cfg(feature = "save_image_file")]
pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "save_image_file")]
#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 按 URI 方案选择的输出
#[cfg(feature = "save_image_file")]
pub enum OutputWrapper {
  SaveImageFileOutput(SaveImageFileOutput),
}

#[cfg(feature = "save_image_file")]
impl OutputWrapper {
  /// 替换绘制参数（例如加载了标签字体）
  pub fn with_draw(self, draw: draw::Draw) -> Self {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => {
        OutputWrapper::SaveImageFileOutput(output.with_draw(draw))
      }
    }
  }
}

#[cfg(feature = "save_image_file")]
impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

#[cfg(feature = "save_image_file")]
impl Render<FramePacket, Vec<ScreenBox>> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &FramePacket, result: &Vec<ScreenBox>) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(all(test, feature = "save_image_file"))]
mod tests {
  use super::*;

  #[test]
  fn test_output_dispatch_by_scheme() {
    let image = Url::parse("image:///tmp/shijue/out.png").expect("url");
    assert!(matches!(
      OutputWrapper::from_url(&image),
      Ok(OutputWrapper::SaveImageFileOutput(_))
    ));

    let rtsp = Url::parse("rtsp://localhost/live").expect("url");
    assert!(matches!(
      OutputWrapper::from_url(&rtsp),
      Err(OutputError::SchemeMismatch)
    ));
  }
}
