// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::Detection;

/// 类别调色板（RGB）
const CLASS_COLORS: [[u8; 3]; 10] = [
  [0, 255, 0],
  [0, 0, 255],
  [255, 0, 0],
  [0, 255, 255],
  [255, 0, 255],
  [255, 255, 0],
  [255, 0, 128],
  [0, 128, 255],
  [255, 128, 0],
  [0, 255, 128],
];

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const FPS_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const PANEL_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const TEXT_PADDING: i32 = 2;
const MARGIN: i32 = 5;

/// 未指定字体时依次尝试的系统字体
const SYSTEM_FONTS: [&str; 4] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

/// 字体缺失时使用的 5x7 点阵字形
const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const GLYPHS_DIGITS: [[u8; 7]; 10] = [
  [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
  [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
  [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
  [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
  [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
  [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
  [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
  [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
  [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
  [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
];
const GLYPHS_UPPER: [[u8; 7]; 26] = [
  [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
  [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
  [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
  [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
  [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
  [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
  [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
  [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
  [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
  [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
  [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
  [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
  [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
  [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
  [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
  [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
  [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
  [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
  [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
  [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
  [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
  [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
  [0x11, 0x11, 0x11, 0x15, 0x15, 0x1B, 0x11],
  [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
  [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
  [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
];

fn glyph(c: char) -> [u8; 7] {
  match c {
    '0'..='9' => GLYPHS_DIGITS[c as usize - '0' as usize],
    'A'..='Z' => GLYPHS_UPPER[c as usize - 'A' as usize],
    'a'..='z' => GLYPHS_UPPER[c as usize - 'a' as usize],
    ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
    '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
    '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
    '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
    '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
    '/' => [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
    _ => [0; 7],
  }
}

/// 标注选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationOptions {
  pub show_boxes: bool,
  pub show_labels: bool,
  pub show_confidence: bool,
  pub show_fps: bool,
  pub show_timestamp: bool,
  pub thickness: u32,
  pub font_size: f32,
  pub font_path: Option<PathBuf>,
}

impl Default for AnnotationOptions {
  fn default() -> Self {
    Self {
      show_boxes: true,
      show_labels: true,
      show_confidence: true,
      show_fps: true,
      show_timestamp: true,
      thickness: 2,
      font_size: 18.0,
      font_path: None,
    }
  }
}

/// 标注器：在图像上绘制检测框、标签、FPS 与时间戳
pub struct Annotator {
  options: AnnotationOptions,
  font: Option<FontArc>,
}

impl Annotator {
  pub fn new(options: AnnotationOptions) -> Self {
    let font = load_font(options.font_path.as_deref());
    if font.is_none() {
      warn!("未找到可用字体，使用内置点阵字体");
    }
    Self { options, font }
  }

  pub fn options(&self) -> &AnnotationOptions {
    &self.options
  }

  pub fn annotate(&self, image: &mut RgbImage, detections: &[Detection], fps: f32, timestamp: &str) {
    for detection in detections {
      self.draw_detection(image, detection);
    }
    if self.options.show_fps {
      let text = format!("FPS: {:.1}", fps);
      self.draw_panel(image, MARGIN, MARGIN, &text, FPS_COLOR, PANEL_COLOR);
    }
    if self.options.show_timestamp && !timestamp.is_empty() {
      let (tw, th) = self.text_extent(image, timestamp);
      let x = image.width() as i32 - tw as i32 - 2 * TEXT_PADDING - MARGIN;
      let y = image.height() as i32 - th as i32 - 2 * TEXT_PADDING - MARGIN;
      self.draw_panel(image, x, y, timestamp, TEXT_COLOR, PANEL_COLOR);
    }
  }

  fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let color = Rgb(CLASS_COLORS[detection.class_id % CLASS_COLORS.len()]);

    let x = (detection.bbox[0] * w).floor() as i32;
    let y = (detection.bbox[1] * h).floor() as i32;
    let bw = (detection.bbox[2] * w).round().max(1.0) as u32;
    let bh = (detection.bbox[3] * h).round().max(1.0) as u32;

    if self.options.show_boxes {
      for t in 0..self.options.thickness.max(1) {
        let inset = t as i32;
        let (iw, ih) = (bw.saturating_sub(2 * t), bh.saturating_sub(2 * t));
        if iw == 0 || ih == 0 {
          break;
        }
        draw_hollow_rect_mut(image, Rect::at(x + inset, y + inset).of_size(iw, ih), color);
      }
    }

    let text = match (self.options.show_labels, self.options.show_confidence) {
      (true, true) => format!("{} {:.0}%", detection.label, detection.confidence * 100.0),
      (true, false) => detection.label.clone(),
      (false, true) => format!("{:.0}%", detection.confidence * 100.0),
      (false, false) => return,
    };

    // 标签放在框上方，空间不足时放在框下方
    let (_, th) = self.text_extent(image, &text);
    let panel_h = th as i32 + 2 * TEXT_PADDING;
    let label_y = if y - panel_h >= 0 {
      y - panel_h
    } else {
      y + bh as i32
    };
    self.draw_panel(image, x.max(0), label_y, &text, TEXT_COLOR, color);
  }

  fn draw_panel(&self, image: &mut RgbImage, x: i32, y: i32, text: &str, fg: Rgb<u8>, bg: Rgb<u8>) {
    let (tw, th) = self.text_extent(image, text);
    let rect = Rect::at(x, y).of_size(
      tw + 2 * TEXT_PADDING as u32,
      th + 2 * TEXT_PADDING as u32,
    );
    draw_filled_rect_mut(image, rect, bg);
    self.draw_text(image, x + TEXT_PADDING, y + TEXT_PADDING, text, fg);
  }

  fn bitmap_scale(image: &RgbImage) -> i32 {
    (image.height() / 360).max(1) as i32
  }

  fn text_extent(&self, image: &RgbImage, text: &str) -> (u32, u32) {
    match &self.font {
      Some(font) => text_size(PxScale::from(self.options.font_size), font, text),
      None => {
        let scale = Self::bitmap_scale(image);
        let chars = text.chars().count() as i32;
        (
          (chars * (GLYPH_W + 1) * scale).max(0) as u32,
          (GLYPH_H * scale) as u32,
        )
      }
    }
  }

  fn draw_text(&self, image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    if let Some(font) = &self.font {
      draw_text_mut(image, color, x, y, PxScale::from(self.options.font_size), font, text);
      return;
    }

    let scale = Self::bitmap_scale(image);
    let (w, h) = (image.width() as i32, image.height() as i32);
    for (i, c) in text.chars().enumerate() {
      let origin_x = x + i as i32 * (GLYPH_W + 1) * scale;
      for (row, bits) in glyph(c).iter().enumerate() {
        for col in 0..GLYPH_W {
          if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
            continue;
          }
          for sy in 0..scale {
            for sx in 0..scale {
              let px = origin_x + col * scale + sx;
              let py = y + row as i32 * scale + sy;
              if px >= 0 && py >= 0 && px < w && py < h {
                image.put_pixel(px as u32, py as u32, color);
              }
            }
          }
        }
      }
    }
  }
}

impl Default for Annotator {
  fn default() -> Self {
    Self::new(AnnotationOptions::default())
  }
}

fn load_font(path: Option<&Path>) -> Option<FontArc> {
  let candidates: Vec<&Path> = match path {
    Some(path) => vec![path],
    None => SYSTEM_FONTS.iter().map(Path::new).collect(),
  };

  for candidate in candidates {
    let Ok(data) = std::fs::read(candidate) else {
      continue;
    };
    match FontArc::try_from_vec(data) {
      Ok(font) => {
        debug!("加载字体: {}", candidate.display());
        return Some(font);
      }
      Err(e) => warn!("字体文件无效 {}: {}", candidate.display(), e),
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(class_id: usize, bbox: [f32; 4]) -> Detection {
    Detection {
      class_id,
      label: "defect".into(),
      confidence: 0.87,
      bbox,
    }
  }

  fn bare_options() -> AnnotationOptions {
    AnnotationOptions {
      show_labels: false,
      show_confidence: false,
      show_fps: false,
      show_timestamp: false,
      ..AnnotationOptions::default()
    }
  }

  #[test]
  fn draws_box_edges_in_class_color() {
    let annotator = Annotator::new(bare_options());
    let mut image = RgbImage::new(100, 100);
    annotator.annotate(&mut image, &[detection(0, [0.2, 0.2, 0.5, 0.5])], 0.0, "");

    let color = Rgb(CLASS_COLORS[0]);
    assert_eq!(image.get_pixel(20, 20), &color);
    assert_eq!(image.get_pixel(21, 40), &color);
    assert_eq!(image.get_pixel(69, 69), &color);
    // 框内部保持不变
    assert_eq!(image.get_pixel(45, 45), &Rgb([0, 0, 0]));
  }

  #[test]
  fn fps_panel_is_drawn_top_left() {
    let options = AnnotationOptions {
      show_fps: true,
      ..bare_options()
    };
    let annotator = Annotator::new(options);
    let mut image = RgbImage::from_pixel(200, 100, Rgb([9, 9, 9]));
    annotator.annotate(&mut image, &[], 29.97, "");
    assert_eq!(image.get_pixel(MARGIN as u32, MARGIN as u32), &PANEL_COLOR);
    assert_eq!(image.get_pixel(150, 90), &Rgb([9, 9, 9]));
  }

  #[test]
  fn label_goes_below_when_box_touches_top() {
    let options = AnnotationOptions {
      show_labels: true,
      ..bare_options()
    };
    let annotator = Annotator::new(options);
    let mut image = RgbImage::new(200, 200);
    annotator.annotate(&mut image, &[detection(2, [0.1, 0.0, 0.3, 0.3])], 0.0, "");
    // 框底边在 y=60，标签背景紧随其后
    assert_eq!(image.get_pixel(21, 61), &Rgb(CLASS_COLORS[2]));
  }

  #[test]
  fn bitmap_glyphs_cover_label_alphabet() {
    assert_ne!(glyph('F'), [0; 7]);
    assert_eq!(glyph('f'), glyph('F'));
    assert_ne!(glyph('%'), [0; 7]);
    assert_eq!(glyph('~'), [0; 7]);
  }
}
