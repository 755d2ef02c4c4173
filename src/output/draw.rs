// 该文件是 Liushui （流水） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
  rect::Rect,
};

use crate::{
  frame::Frame,
  model::{DetectResult, Detection},
};

const BOX_THICKNESS: i32 = 2;
/// 类别色块边长，没有字体时用颜色区分类别
const TAG_SIZE: u32 = 8;
const PALETTE: [[u8; 3]; 8] = [
  [0, 0, 255],
  [255, 56, 56],
  [72, 249, 10],
  [255, 157, 151],
  [0, 194, 255],
  [255, 178, 29],
  [207, 210, 49],
  [146, 204, 23],
];

pub struct Draw {
  thickness: i32,
  palette: Vec<[u8; 3]>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      thickness: BOX_THICKNESS,
      palette: PALETTE.to_vec(),
    }
  }
}

impl Draw {
  pub fn color_of(&self, class_id: u32) -> Rgb<u8> {
    Rgb(self.palette[class_id as usize % self.palette.len()])
  }

  // 在图像上绘制一个矩形边框，坐标为像素坐标
  fn draw_bbox(&self, image: &mut RgbImage, detection: &Detection) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (detection.xmin.floor() as i32).clamp(0, w - 1);
    let y_min = (detection.ymin.floor() as i32).clamp(0, h - 1);
    let x_max = (detection.xmax.ceil() as i32).clamp(0, w - 1);
    let y_max = (detection.ymax.ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color_of(detection.class_id);
    for t in 0..self.thickness {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    // 类别色块画在框的左上角
    let tag = Rect::at(x_min, y_min).of_size(
      TAG_SIZE.min((x_max - x_min) as u32),
      TAG_SIZE.min((y_max - y_min) as u32),
    );
    draw_filled_rect_mut(image, tag, color);
  }

  pub fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult) {
    for detection in result.items.iter() {
      self.draw_bbox(image, detection);
    }
  }

  pub fn draw_detection(&self, frame: &Frame, result: &DetectResult) -> RgbImage {
    let mut image = frame.to_rgb_image();
    self.draw_detections_on_image(&mut image, result);
    image
  }
}

pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn format(&self, result: &DetectResult) -> String {
    let mut records = Vec::with_capacity(result.len());
    for item in result.items.iter() {
      let name = match item.label() {
        Some(label) if self.label_with_name => label.to_string(),
        _ => item.class_id.to_string(),
      };
      records.push(format!(
        "{}, {:.4}, {:.1}, {:.1}, {:.1}, {:.1}",
        name, item.confidence, item.ymin, item.xmin, item.ymax, item.xmax
      ));
    }
    records.join("\n")
  }

  pub fn record(&self, result: &DetectResult, path: &std::path::Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), self.format(result))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn result() -> DetectResult {
    DetectResult::new(
      0,
      vec![Detection {
        ymin: 2.0,
        xmin: 2.0,
        ymax: 12.0,
        xmax: 14.0,
        confidence: 0.875,
        class_id: 1,
      }],
    )
  }

  #[test]
  fn draws_box_edges_in_class_color() {
    let frame = Frame::with_shape(0, 16, 16).unwrap();
    let draw = Draw::default();
    let image = draw.draw_detection(&frame, &result());
    let color = draw.color_of(1);
    assert_eq!(*image.get_pixel(14, 8), color);
    assert_eq!(*image.get_pixel(2, 2), color);
    assert_eq!(*image.get_pixel(12, 10), Rgb([0, 0, 0]));
  }

  #[test]
  fn record_lines_use_names_or_ids() {
    let by_name = Record {
      label_with_name: true,
    };
    let by_id = Record {
      label_with_name: false,
    };
    assert_eq!(by_name.format(&result()), "bicycle, 0.8750, 2.0, 2.0, 12.0, 14.0");
    assert!(by_id.format(&result()).starts_with("1, 0.8750"));
  }
}
