// 该文件是 Shijue （视觉） 项目的一部分。
// src/output/overlay.rs - 坐标映射与检测框平滑
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

//! 叠加层几何
//!
//! 检测框依次经过三个坐标系：模型输入空间、源图像空间、屏幕（视口）空间。
//! [`CoordinateMapper`] 负责换算，[`BoxSmoother`] 在帧之间对同一目标做指数平滑。
//!
//! 目标跟踪是启发式的：同一帧内的检测先按置信度降序、再按类别键排序，
//! 每个类别内按出现顺序编号，得到 `类别键:序号` 形式的跟踪键。
//! 两帧之间同一类别的第 N 个框被视为同一目标。

use std::collections::HashMap;

use tracing::debug;

use crate::model::Detection;

pub const DEFAULT_MIN_BOX_SIZE: f32 = 2.0;
pub const DEFAULT_MAX_BOXES: usize = 50;
pub const DEFAULT_SMOOTHING_ALPHA: f32 = 0.35;

/// 坐标均落在该范围内的框按归一化坐标处理
const NORMALIZED_LIMIT: f32 = 1.01;

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

pub const PALETTE: [[u8; 3]; 12] = [
  [0x22, 0xC5, 0x5E],
  [0x3B, 0x82, 0xF6],
  [0xF9, 0x73, 0x16],
  [0xEF, 0x44, 0x44],
  [0x14, 0xB8, 0xA6],
  [0xF5, 0x9E, 0x0B],
  [0x06, 0xB6, 0xD4],
  [0x84, 0xCC, 0x16],
  [0xEA, 0xB3, 0x08],
  [0xA8, 0x55, 0xF7],
  [0x10, 0xB9, 0x81],
  [0xF4, 0x3F, 0x5E],
];

/// 源图像缩放到模型输入的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelResizeMode {
  /// 两个方向独立缩放
  #[default]
  Stretch,
  /// 等比缩放并在两侧居中填充
  Letterbox,
}

/// 源图像显示到视口的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayResizeMode {
  #[default]
  Stretch,
  /// 完整显示，留边
  Contain,
  /// 铺满视口，裁掉超出部分
  Cover,
}

/// 决定坐标换算的几何参数，变化时平滑状态失效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBasis {
  pub model_size: [u32; 2],
  pub source_size: [u32; 2],
  pub model_resize: ModelResizeMode,
  pub display_resize: DisplayResizeMode,
}

impl GeometryBasis {
  pub fn new(model_size: [u32; 2], source_size: [u32; 2]) -> Self {
    Self {
      model_size,
      source_size,
      model_resize: ModelResizeMode::default(),
      display_resize: DisplayResizeMode::default(),
    }
  }

  pub fn with_model_resize(mut self, mode: ModelResizeMode) -> Self {
    self.model_resize = mode;
    self
  }

  pub fn with_display_resize(mut self, mode: DisplayResizeMode) -> Self {
    self.display_resize = mode;
    self
  }
}

/// 映射到屏幕上的检测框
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenBox {
  pub track_key: String,
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
  pub color: [u8; 3],
  pub label: String,
  pub confidence: f32,
  pub model_box: [f32; 4],
  pub source_box: [f32; 4],
}

impl ScreenBox {
  pub fn center(&self) -> [f32; 2] {
    [self.x + self.width / 2.0, self.y + self.height / 2.0]
  }
}

/// 按类别键取稳定的颜色（FNV-1a 哈希）
pub fn class_color(class_key: &str) -> [u8; 3] {
  let hash = class_key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
    (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
  });
  PALETTE[hash as usize % PALETTE.len()]
}

fn ratio(numerator: f32, denominator: f32) -> f32 {
  if denominator > 0.0 {
    numerator / denominator
  } else {
    1.0
  }
}

fn size_f32(size: [u32; 2]) -> [f32; 2] {
  [size[0] as f32, size[1] as f32]
}

#[derive(Debug, Clone)]
pub struct CoordinateMapper {
  pub basis: GeometryBasis,
  /// 视口尺寸 `[宽, 高]`
  pub viewport: [f32; 2],
  pub min_box_size: f32,
  pub max_boxes: usize,
}

impl CoordinateMapper {
  pub fn new(basis: GeometryBasis, viewport: [f32; 2]) -> Self {
    Self {
      basis,
      viewport,
      min_box_size: DEFAULT_MIN_BOX_SIZE,
      max_boxes: DEFAULT_MAX_BOXES,
    }
  }

  pub fn with_min_box_size(mut self, min_box_size: f32) -> Self {
    self.min_box_size = min_box_size.max(0.0);
    self
  }

  pub fn with_max_boxes(mut self, max_boxes: usize) -> Self {
    self.max_boxes = max_boxes;
    self
  }

  /// 归一化坐标放大到模型输入空间，其余原样返回
  pub fn to_model_space(&self, bbox: [f32; 4]) -> [f32; 4] {
    if bbox.iter().all(|v| (0.0..=NORMALIZED_LIMIT).contains(v)) {
      let [mw, mh] = size_f32(self.basis.model_size);
      [bbox[0] * mw, bbox[1] * mh, bbox[2] * mw, bbox[3] * mh]
    } else {
      bbox
    }
  }

  pub fn model_to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
    let [mw, mh] = size_f32(self.basis.model_size);
    let [sw, sh] = size_f32(self.basis.source_size);

    match self.basis.model_resize {
      ModelResizeMode::Stretch => {
        let (sx, sy) = (ratio(sw, mw), ratio(sh, mh));
        [bbox[0] * sx, bbox[1] * sy, bbox[2] * sx, bbox[3] * sy]
      }
      ModelResizeMode::Letterbox => {
        let scale = ratio(mw, sw).min(ratio(mh, sh));
        let pad_x = (mw - sw * scale) / 2.0;
        let pad_y = (mh - sh * scale) / 2.0;
        [
          (bbox[0] - pad_x) / scale,
          (bbox[1] - pad_y) / scale,
          (bbox[2] - pad_x) / scale,
          (bbox[3] - pad_y) / scale,
        ]
      }
    }
  }

  pub fn source_to_screen(&self, bbox: [f32; 4]) -> [f32; 4] {
    let [sw, sh] = size_f32(self.basis.source_size);
    let [vw, vh] = self.viewport;

    let (sx, sy, offset_x, offset_y) = match self.basis.display_resize {
      DisplayResizeMode::Stretch => (ratio(vw, sw), ratio(vh, sh), 0.0, 0.0),
      DisplayResizeMode::Contain | DisplayResizeMode::Cover => {
        let (rx, ry) = (ratio(vw, sw), ratio(vh, sh));
        let scale = if self.basis.display_resize == DisplayResizeMode::Contain {
          rx.min(ry)
        } else {
          rx.max(ry)
        };
        (scale, scale, (vw - sw * scale) / 2.0, (vh - sh * scale) / 2.0)
      }
    };

    [
      bbox[0] * sx + offset_x,
      bbox[1] * sy + offset_y,
      bbox[2] * sx + offset_x,
      bbox[3] * sy + offset_y,
    ]
  }

  /// 截断到视口内，返回 `[x, y, 宽, 高]`
  fn clamp_to_viewport(&self, bbox: [f32; 4]) -> [f32; 4] {
    let [vw, vh] = self.viewport;
    let x1 = bbox[0].min(bbox[2]).clamp(0.0, vw);
    let y1 = bbox[1].min(bbox[3]).clamp(0.0, vh);
    let x2 = bbox[0].max(bbox[2]).clamp(0.0, vw);
    let y2 = bbox[1].max(bbox[3]).clamp(0.0, vh);
    [x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0)]
  }

  /// 把一帧检测结果映射为屏幕框
  pub fn map_detections(&self, detections: &[Detection]) -> Vec<ScreenBox> {
    let mut order: Vec<&Detection> = detections.iter().collect();
    order.sort_by(|a, b| {
      b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.class_key.cmp(&b.class_key))
    });

    let mut ordinals: HashMap<&str, usize> = HashMap::new();
    let mut boxes = Vec::new();
    for detection in order {
      if boxes.len() >= self.max_boxes {
        break;
      }

      let model_box = self.to_model_space(detection.bbox);
      let source_box = self.model_to_source(model_box);
      let [x, y, width, height] = self.clamp_to_viewport(self.source_to_screen(source_box));
      if width < self.min_box_size || height < self.min_box_size {
        continue;
      }

      let ordinal = ordinals.entry(detection.class_key.as_str()).or_insert(0);
      let track_key = format!("{}:{}", detection.class_key, ordinal);
      *ordinal += 1;

      boxes.push(ScreenBox {
        track_key,
        x,
        y,
        width,
        height,
        color: class_color(&detection.class_key),
        label: detection.label.clone(),
        confidence: detection.confidence,
        model_box,
        source_box,
      });
    }

    boxes
  }
}

/// 按跟踪键对屏幕框做指数平滑，并保存点选状态
#[derive(Debug, Clone)]
pub struct BoxSmoother {
  alpha: f32,
  basis: Option<GeometryBasis>,
  previous: HashMap<String, ScreenBox>,
  selected: Option<String>,
}

impl Default for BoxSmoother {
  fn default() -> Self {
    Self::new(DEFAULT_SMOOTHING_ALPHA)
  }
}

impl BoxSmoother {
  pub fn new(alpha: f32) -> Self {
    Self {
      alpha: if alpha.is_finite() {
        alpha.clamp(0.0, 1.0)
      } else {
        DEFAULT_SMOOTHING_ALPHA
      },
      basis: None,
      previous: HashMap::new(),
      selected: None,
    }
  }

  pub fn alpha(&self) -> f32 {
    self.alpha
  }

  pub fn reset(&mut self) {
    self.previous.clear();
    self.selected = None;
  }

  /// 平滑一帧屏幕框，几何基准变化时先清空历史
  pub fn smooth(&mut self, basis: &GeometryBasis, boxes: Vec<ScreenBox>) -> Vec<ScreenBox> {
    if self.basis.as_ref() != Some(basis) {
      if self.basis.is_some() {
        debug!("几何基准变化, 重置平滑状态");
      }
      self.reset();
      self.basis = Some(*basis);
    }

    let alpha = self.alpha;
    let smoothed: Vec<ScreenBox> = boxes
      .into_iter()
      .map(|mut target| {
        if let Some(prev) = self.previous.get(&target.track_key) {
          target.x = prev.x + alpha * (target.x - prev.x);
          target.y = prev.y + alpha * (target.y - prev.y);
          target.width = prev.width + alpha * (target.width - prev.width);
          target.height = prev.height + alpha * (target.height - prev.height);
        }
        target
      })
      .collect();

    self.previous = smoothed
      .iter()
      .map(|b| (b.track_key.clone(), b.clone()))
      .collect();
    if let Some(key) = &self.selected
      && !self.previous.contains_key(key)
    {
      debug!("选中的目标 {} 已消失", key);
      self.selected = None;
    }

    smoothed
  }

  /// 选中一个跟踪键，只有上一帧存在的目标可以被选中
  pub fn select(&mut self, track_key: &str) -> bool {
    if self.previous.contains_key(track_key) {
      self.selected = Some(track_key.to_string());
      true
    } else {
      false
    }
  }

  pub fn clear_selection(&mut self) {
    self.selected = None;
  }

  pub fn selected(&self) -> Option<&ScreenBox> {
    self
      .selected
      .as_ref()
      .and_then(|key| self.previous.get(key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(bbox: [f32; 4], confidence: f32, class_key: &str) -> Detection {
    Detection {
      bbox,
      confidence,
      class_key: class_key.to_string(),
      label: class_key.to_uppercase(),
      class_id: None,
    }
  }

  fn assert_close(actual: [f32; 4], expected: [f32; 4]) {
    for (a, e) in actual.iter().zip(expected) {
      assert!((a - e).abs() < 1e-3, "{:?} != {:?}", actual, expected);
    }
  }

  fn screen_box(track_key: &str, x: f32, y: f32, size: f32) -> ScreenBox {
    ScreenBox {
      track_key: track_key.to_string(),
      x,
      y,
      width: size,
      height: size,
      color: PALETTE[0],
      label: String::new(),
      confidence: 0.5,
      model_box: [0.0; 4],
      source_box: [0.0; 4],
    }
  }

  #[test]
  fn test_stretch_center_round_trip() {
    let basis = GeometryBasis::new([640, 640], [1280, 720]);
    let mapper = CoordinateMapper::new(basis, [400.0, 300.0]);

    let boxes = mapper.map_detections(&[detection([300.0, 300.0, 340.0, 340.0], 0.9, "car")]);
    assert_eq!(boxes.len(), 1);
    let [cx, cy] = boxes[0].center();
    assert!((cx - 200.0).abs() < 1e-3);
    assert!((cy - 150.0).abs() < 1e-3);
    assert_close(boxes[0].source_box, [600.0, 337.5, 680.0, 382.5]);
  }

  #[test]
  fn test_letterbox_removes_padding() {
    let basis = GeometryBasis::new([640, 640], [1280, 720])
      .with_model_resize(ModelResizeMode::Letterbox);
    let mapper = CoordinateMapper::new(basis, [1280.0, 720.0]);
    assert_close(
      mapper.model_to_source([0.0, 140.0, 640.0, 500.0]),
      [0.0, 0.0, 1280.0, 720.0],
    );
  }

  #[test]
  fn test_contain_and_cover() {
    let contain = CoordinateMapper::new(
      GeometryBasis::new([640, 640], [1280, 720]).with_display_resize(DisplayResizeMode::Contain),
      [400.0, 400.0],
    );
    assert_close(
      contain.source_to_screen([0.0, 0.0, 1280.0, 720.0]),
      [0.0, 87.5, 400.0, 312.5],
    );

    let cover = CoordinateMapper::new(
      GeometryBasis::new([640, 640], [1280, 720]).with_display_resize(DisplayResizeMode::Cover),
      [400.0, 400.0],
    );
    let boxes = cover.map_detections(&[detection([0.0, 0.0, 640.0, 640.0], 0.9, "wall")]);
    // 超出视口的部分被截掉
    assert_eq!(boxes[0].x, 0.0);
    assert_eq!(boxes[0].width, 400.0);
    assert!((boxes[0].height - 400.0).abs() < 1e-3);
  }

  #[test]
  fn test_normalized_boxes_scaled_to_model_space() {
    let mapper = CoordinateMapper::new(GeometryBasis::new([640, 480], [640, 480]), [640.0, 480.0]);
    assert_close(
      mapper.to_model_space([0.25, 0.25, 0.75, 1.005]),
      [160.0, 120.0, 480.0, 482.4],
    );
    assert_close(
      mapper.to_model_space([0.5, 0.5, 2.0, 2.0]),
      [0.5, 0.5, 2.0, 2.0],
    );
  }

  #[test]
  fn test_track_keys_colors_and_limits() {
    let mapper = CoordinateMapper::new(GeometryBasis::new([100, 100], [100, 100]), [100.0, 100.0])
      .with_max_boxes(3);
    let boxes = mapper.map_detections(&[
      detection([10.0, 10.0, 20.0, 20.0], 0.5, "dog"),
      detection([30.0, 30.0, 40.0, 40.0], 0.9, "dog"),
      detection([50.0, 50.0, 60.0, 60.0], 0.9, "cat"),
      detection([70.0, 70.0, 71.0, 71.0], 0.8, "dog"),
      detection([80.0, 80.0, 90.0, 90.0], 0.1, "dog"),
    ]);

    let keys: Vec<&str> = boxes.iter().map(|b| b.track_key.as_str()).collect();
    assert_eq!(keys, vec!["cat:0", "dog:0", "dog:1"]);
    // 过小的框被丢弃，不占用序号
    assert_eq!(boxes[2].confidence, 0.5);
    assert_eq!(boxes[1].color, class_color("dog"));
    assert_eq!(boxes[1].label, "DOG");
    assert_eq!(class_color("dog"), class_color("dog"));
    assert!(boxes.iter().all(|b| b.width >= 0.0 && b.height >= 0.0));
  }

  #[test]
  fn test_smoothing_alpha_bounds_and_first_sighting() {
    let basis = GeometryBasis::new([640, 640], [640, 640]);

    let mut follow = BoxSmoother::new(1.0);
    follow.smooth(&basis, vec![screen_box("a:0", 0.0, 0.0, 10.0)]);
    let out = follow.smooth(&basis, vec![screen_box("a:0", 100.0, 50.0, 20.0)]);
    assert_eq!((out[0].x, out[0].y, out[0].width), (100.0, 50.0, 20.0));

    let mut frozen = BoxSmoother::new(-3.0);
    assert_eq!(frozen.alpha(), 0.0);
    frozen.smooth(&basis, vec![screen_box("a:0", 0.0, 0.0, 10.0)]);
    let out = frozen.smooth(&basis, vec![screen_box("a:0", 100.0, 50.0, 20.0)]);
    assert_eq!((out[0].x, out[0].y, out[0].width), (0.0, 0.0, 10.0));

    let mut smoother = BoxSmoother::default();
    let first = smoother.smooth(&basis, vec![screen_box("b:0", 40.0, 40.0, 10.0)]);
    assert_eq!(first[0].x, 40.0);
    let next = smoother.smooth(&basis, vec![screen_box("b:0", 140.0, 40.0, 10.0)]);
    assert!((next[0].x - 75.0).abs() < 1e-4);
  }

  #[test]
  fn test_basis_change_resets_history_and_selection() {
    let basis = GeometryBasis::new([640, 640], [640, 640]);
    let mut smoother = BoxSmoother::new(0.5);
    smoother.smooth(&basis, vec![screen_box("a:0", 0.0, 0.0, 10.0)]);
    assert!(smoother.select("a:0"));
    assert!(!smoother.select("z:9"));
    assert_eq!(smoother.selected().map(|b| b.x), Some(0.0));

    let rotated = GeometryBasis::new([640, 640], [480, 640]);
    let out = smoother.smooth(&rotated, vec![screen_box("a:0", 100.0, 0.0, 10.0)]);
    assert_eq!(out[0].x, 100.0);
    assert!(smoother.selected().is_none());

    // 选中的目标消失后清除选中状态
    assert!(smoother.select("a:0"));
    smoother.smooth(&rotated, vec![screen_box("b:0", 0.0, 0.0, 10.0)]);
    assert!(smoother.selected().is_none());
  }
}
