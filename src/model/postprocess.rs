// 该文件是 Shijue （视觉） 项目的一部分。
// src/model/postprocess.rs - 置信度过滤与按类别 NMS
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

use tracing::debug;

use crate::{
  config::{LabelSet, RuntimeConfig},
  model::{Detection, RawClass, RawPrediction},
};

const UNKNOWN_CLASS: &str = "unknown";

fn class_fields(prediction: &RawPrediction, label_set: LabelSet) -> (String, String, Option<i64>) {
  let name = match &prediction.class_name {
    Some(RawClass::Name(name)) if !name.trim().is_empty() => Some(name.trim().to_string()),
    _ => None,
  };

  let (class_id, class_text) = match &prediction.class {
    Some(RawClass::Id(id)) if id.is_finite() => (Some(id.trunc() as i64), None),
    Some(RawClass::Name(text)) => match text.trim().parse::<f64>() {
      Ok(id) if id.is_finite() => (Some(id.trunc() as i64), None),
      _ if !text.trim().is_empty() => (None, Some(text.trim().to_string())),
      _ => (None, None),
    },
    _ => (None, None),
  };

  match (name, class_id, class_text) {
    (Some(name), id, _) => (name.to_lowercase(), name, id),
    (None, Some(id), _) => (format!("class_{}", id), label_set.label_for_id(id), Some(id)),
    (None, None, Some(text)) => (text.to_lowercase(), text, None),
    (None, None, None) => (UNKNOWN_CLASS.to_string(), UNKNOWN_CLASS.to_string(), None),
  }
}

/// 把一条原始记录规范化为 [`Detection`]
///
/// 没有有效边界框或置信度的记录返回 `None`。
pub fn normalize_prediction(prediction: &RawPrediction, label_set: LabelSet) -> Option<Detection> {
  let bbox = prediction.bbox.as_ref()?.to_xyxy()?;
  let confidence = prediction.confidence.as_ref()?.as_f64()?.clamp(0.0, 1.0) as f32;
  let (class_key, label, class_id) = class_fields(prediction, label_set);

  Some(Detection {
    bbox,
    confidence,
    class_key,
    label,
    class_id,
  })
}

/// 计算两个 `[x1, y1, x2, y2]` 边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  if area_a <= 0.0 || area_b <= 0.0 {
    return 0.0;
  }

  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);
  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

fn sort_by_confidence(detections: &mut [Detection]) {
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// 非极大值抑制
///
/// 低于 `confidence_threshold` 的记录先被丢弃；剩余记录按类别键分组，
/// 组内按置信度贪心保留，抑制与已保留框 IoU 大于 `nms_iou` 的框。
/// 输出按置信度降序（稳定排序）。
pub fn apply_nms(
  detections: Vec<Detection>,
  confidence_threshold: f32,
  nms_iou: f32,
) -> Vec<Detection> {
  let mut filtered: Vec<Detection> = detections
    .into_iter()
    .filter(|d| d.confidence >= confidence_threshold)
    .collect();
  sort_by_confidence(&mut filtered);

  // 按首次出现的顺序分组
  let mut groups: Vec<(String, Vec<Detection>)> = Vec::new();
  for detection in filtered {
    match groups.iter_mut().find(|(key, _)| *key == detection.class_key) {
      Some((_, group)) => group.push(detection),
      None => groups.push((detection.class_key.clone(), vec![detection])),
    }
  }

  let mut kept = Vec::new();
  for (_, group) in groups {
    let mut accepted: Vec<Detection> = Vec::new();
    for candidate in group {
      if accepted
        .iter()
        .all(|best| iou(&best.bbox, &candidate.bbox) <= nms_iou)
      {
        accepted.push(candidate);
      }
    }
    kept.extend(accepted);
  }

  sort_by_confidence(&mut kept);
  kept
}

/// 规范化、过滤并去重一批原始预测
pub fn postprocess(predictions: &[RawPrediction], config: &RuntimeConfig) -> Vec<Detection> {
  let detections: Vec<Detection> = predictions
    .iter()
    .filter_map(|p| normalize_prediction(p, config.label_set))
    .collect();
  let normalized = detections.len();

  let kept = apply_nms(detections, config.confidence_threshold, config.nms_iou);
  debug!(
    "后处理: 原始 {} 条, 有效 {} 条, 保留 {} 条",
    predictions.len(),
    normalized,
    kept.len()
  );
  kept
}
