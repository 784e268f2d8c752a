// 该文件是 Shijue （视觉） 项目的一部分。
// src/output/draw.rs - 在图像上绘制检测框
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

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::output::overlay::ScreenBox;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;

#[derive(Error, Debug)]
pub enum FontError {
  #[error("读取字体文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  Invalid(#[from] ab_glyph::InvalidFont),
}

/// 检测框绘制参数，未加载字体时只画边框
pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  thickness: i32,
  font: Option<FontVec>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      thickness: BOX_THICKNESS,
      font: None,
    }
  }
}

impl Draw {
  pub fn with_font_file(mut self, path: impl AsRef<Path>) -> Result<Self, FontError> {
    let data = std::fs::read(path.as_ref())?;
    self.font = Some(FontVec::try_from_vec(data)?);
    info!("加载标签字体: {}", path.as_ref().display());
    Ok(self)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  fn draw_box(&self, image: &mut RgbImage, screen_box: &ScreenBox) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (screen_box.x.floor() as i32).clamp(0, w - 1);
    let y_min = (screen_box.y.floor() as i32).clamp(0, h - 1);
    let x_max = ((screen_box.x + screen_box.width).ceil() as i32).clamp(0, w - 1);
    let y_max = ((screen_box.y + screen_box.height).ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(screen_box.color);
    // 向内逐像素加粗
    for t in 0..self.thickness {
      let width = x_max - x_min - 2 * t;
      let height = y_max - y_min - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32 + 1, height as u32 + 1);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", screen_box.label, screen_box.confidence);
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = text_width.min(w - label_x);

    if label_width > 0 && self.label_text_height > 0 {
      let rect =
        Rect::at(label_x, label_y).of_size(label_width as u32, self.label_text_height as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x,
        label_y + self.label_text_vertical_padding,
        PxScale::from(self.font_size),
        font,
        &label,
      );
    }
  }

  /// 在屏幕坐标与图像像素一致的前提下绘制所有框
  pub fn draw_boxes(&self, image: &mut RgbImage, boxes: &[ScreenBox]) {
    for screen_box in boxes {
      self.draw_box(image, screen_box);
    }
  }
}
