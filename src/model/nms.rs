// 该文件是 Liushui （流水） 项目的一部分。
// src/model/nms.rs - 按类别的非极大值抑制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use super::Detection;

/// 按置信度降序（稳定）排列后贪心保留：同类别中与已保留框 IoU 超过阈值的框被丢弃。
pub fn suppress(items: &mut Vec<Detection>, iou_threshold: f32) {
  items.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut kept: Vec<Detection> = Vec::with_capacity(items.len());
  for candidate in items.drain(..) {
    let overlapped = kept
      .iter()
      .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
    if !overlapped {
      kept.push(candidate);
    }
  }
  *items = kept;
}

#[cfg(test)]
mod tests {
  use super::*;

  fn boxed(x: f32, confidence: f32, class_id: u32) -> Detection {
    Detection {
      ymin: 0.0,
      xmin: x,
      ymax: 10.0,
      xmax: x + 10.0,
      confidence,
      class_id,
    }
  }

  #[test]
  fn keeps_highest_confidence_of_each_cluster() {
    let mut items = vec![boxed(0.0, 0.6, 0), boxed(1.0, 0.9, 0), boxed(50.0, 0.7, 0)];
    suppress(&mut items, 0.5);
    let confidences: Vec<_> = items.iter().map(|d| d.confidence).collect();
    assert_eq!(confidences, vec![0.9, 0.7]);
  }

  #[test]
  fn different_classes_do_not_suppress_each_other() {
    let mut items = vec![boxed(0.0, 0.9, 0), boxed(0.0, 0.8, 1)];
    suppress(&mut items, 0.5);
    assert_eq!(items.len(), 2);
  }

  #[test]
  fn equal_confidence_keeps_production_order() {
    let mut items = vec![boxed(0.0, 0.5, 4), boxed(100.0, 0.5, 2)];
    suppress(&mut items, 0.5);
    assert_eq!(items[0].class_id, 4);
    assert_eq!(items[1].class_id, 2);
  }
}
