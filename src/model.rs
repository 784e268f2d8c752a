// 该文件是 Shijue （视觉） 项目的一部分。
// src/model.rs - 检测结果模型
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

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::debug;

/// 规范化后的检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  /// `[x1, y1, x2, y2]`，保证 `x1 <= x2`、`y1 <= y2`
  pub bbox: [f32; 4],
  /// 置信度，范围 [0, 1]
  pub confidence: f32,
  /// 分组与跟踪用的类别键（小写）
  pub class_key: String,
  /// 显示标签
  pub label: String,
  /// 数字类别编号（若后端给出）
  pub class_id: Option<i64>,
}

impl Detection {
  pub fn width(&self) -> f32 {
    self.bbox[2] - self.bbox[0]
  }

  pub fn height(&self) -> f32 {
    self.bbox[3] - self.bbox[1]
  }

  pub fn area(&self) -> f32 {
    self.width().max(0.0) * self.height().max(0.0)
  }
}

/// 数字或数字字符串，其余类型忽略
#[derive(Debug, Clone)]
pub enum RawNumber {
  Number(f64),
  Text(String),
  Other,
}

impl RawNumber {
  pub fn from_value(value: &Value) -> Self {
    match value {
      Value::Number(n) => n.as_f64().map_or(RawNumber::Other, RawNumber::Number),
      Value::String(s) => RawNumber::Text(s.clone()),
      _ => RawNumber::Other,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    let value = match self {
      RawNumber::Number(n) => Some(*n),
      RawNumber::Text(s) => s.trim().parse::<f64>().ok(),
      RawNumber::Other => None,
    };
    value.filter(|v| v.is_finite())
  }
}

/// 按顺序取第一个存在且非 null 的字段
fn first_present<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
  keys
    .iter()
    .filter_map(|key| object.get(*key))
    .find(|value| !value.is_null())
}

fn number_field(object: &Map<String, Value>, keys: &[&str]) -> RawNumber {
  first_present(object, keys).map_or(RawNumber::Other, RawNumber::from_value)
}

/// 后端给出的边界框，三种形状之一
#[derive(Debug, Clone)]
pub enum RawBox {
  /// `[x1, y1, x2, y2, ...]`
  Array(Vec<RawNumber>),
  /// `{x1|left, y1|top, x2|right, y2|bottom}`
  Corners([RawNumber; 4]),
  /// `{x, y, width|w, height|h}`
  Xywh([RawNumber; 4]),
}

impl RawBox {
  /// 对象形式先按角点解析，角点不完整时再按 `x, y, width, height` 解析
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::Array(items) => Some(RawBox::Array(items.iter().map(RawNumber::from_value).collect())),
      Value::Object(object) => {
        let corners = [
          number_field(object, &["x1", "left"]),
          number_field(object, &["y1", "top"]),
          number_field(object, &["x2", "right"]),
          number_field(object, &["y2", "bottom"]),
        ];
        if corners.iter().all(|v| v.as_f64().is_some()) {
          return Some(RawBox::Corners(corners));
        }
        Some(RawBox::Xywh([
          number_field(object, &["x"]),
          number_field(object, &["y"]),
          number_field(object, &["width", "w"]),
          number_field(object, &["height", "h"]),
        ]))
      }
      _ => None,
    }
  }

  /// 转为 `[x1, y1, x2, y2]` 并保证每个轴上 min <= max
  pub fn to_xyxy(&self) -> Option<[f32; 4]> {
    let [x1, y1, x2, y2] = match self {
      RawBox::Array(items) if items.len() >= 4 => [
        items[0].as_f64()?,
        items[1].as_f64()?,
        items[2].as_f64()?,
        items[3].as_f64()?,
      ],
      RawBox::Array(_) => return None,
      RawBox::Corners([x1, y1, x2, y2]) => [x1.as_f64()?, y1.as_f64()?, x2.as_f64()?, y2.as_f64()?],
      RawBox::Xywh([x, y, width, height]) => {
        let (x, y) = (x.as_f64()?, y.as_f64()?);
        [x, y, x + width.as_f64()?, y + height.as_f64()?]
      }
    };

    let values = [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)];
    values
      .iter()
      .all(|v| v.is_finite())
      .then(|| values.map(|v| v as f32))
  }
}

/// 类别字段：数字编号或名称
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawClass {
  Id(f64),
  Name(String),
  Other(IgnoredAny),
}

impl RawClass {
  fn from_value(value: &Value) -> Self {
    RawClass::deserialize(value).unwrap_or(RawClass::Other(IgnoredAny))
  }
}

const BOX_KEYS: &[&str] = &["bbox", "box", "xyxy", "coords"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "score", "conf", "probability"];
const CLASS_KEYS: &[&str] = &["class", "class_id", "classId", "cls"];
const CLASS_NAME_KEYS: &[&str] = &["class_name", "className", "label", "name"];

/// 后端原始预测记录
///
/// 每个字段接受一组固定的同义键，多个同义键同时出现时按固定顺序取第一个非 null 的值。
#[derive(Debug, Clone, Default)]
pub struct RawPrediction {
  pub bbox: Option<RawBox>,
  pub confidence: Option<RawNumber>,
  pub class: Option<RawClass>,
  pub class_name: Option<RawClass>,
}

impl RawPrediction {
  pub fn from_map(object: &Map<String, Value>) -> Self {
    RawPrediction {
      bbox: first_present(object, BOX_KEYS).and_then(RawBox::from_value),
      confidence: first_present(object, CONFIDENCE_KEYS).map(RawNumber::from_value),
      class: first_present(object, CLASS_KEYS).map(RawClass::from_value),
      class_name: first_present(object, CLASS_NAME_KEYS).map(RawClass::from_value),
    }
  }
}

impl<'de> Deserialize<'de> for RawPrediction {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let object = Map::<String, Value>::deserialize(deserializer)?;
    Ok(RawPrediction::from_map(&object))
  }
}

impl RawPrediction {
  pub fn from_value(value: &Value) -> Option<Self> {
    match RawPrediction::deserialize(value) {
      Ok(prediction) => Some(prediction),
      Err(e) => {
        debug!("丢弃无法解析的预测记录: {}", e);
        None
      }
    }
  }

  /// 逐条解析，无法解析的记录被丢弃
  pub fn from_values(values: &[Value]) -> Vec<Self> {
    values.iter().filter_map(RawPrediction::from_value).collect()
  }

  /// 在响应对象中查找 `predictions` 或 `objects` 数组；顶层就是数组时直接解析
  pub fn from_response(value: &Value) -> Vec<Self> {
    match value {
      Value::Array(items) => RawPrediction::from_values(items),
      Value::Object(object) => ["predictions", "objects"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_array))
        .map(|items| RawPrediction::from_values(items))
        .unwrap_or_default(),
      _ => Vec::new(),
    }
  }
}

pub mod labels;
pub mod postprocess;

pub use self::postprocess::{apply_nms, iou, normalize_prediction, postprocess};
