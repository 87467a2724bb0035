// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/draw.rs - 检测结果标注绘制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::info;

use crate::detector::Detection;

// 绘制常量
const ACCENT_COLOR: Rgb<u8> = Rgb([0, 96, 255]);
const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const OUTER_BORDER_WIDTH: i32 = 4;
const INNER_BORDER_WIDTH: i32 = 2;
const LABEL_OFFSET: i32 = 10;
// 文本宽度的测量参考字号
const MEASURE_SCALE: f32 = 16.0;
const FONT_SIZE_MIN: f32 = 8.0;
const FONT_SIZE_MAX: f32 = 36.0;
const FONT_SIZE_FACTOR: f32 = 30.0;

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("字体文件读取失败: {0}")]
  FontIo(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  FontInvalid(String),
}

/// 在图像副本上绘制检测框与标签。
///
/// 字体文件在启动时加载一次，缺失视为致命错误。
/// `annotate` 返回新图像，输入图像从不被原地修改。
pub struct Annotator {
  font: FontVec,
}

impl Annotator {
  pub fn load(font_path: impl AsRef<Path>) -> Result<Self, RenderError> {
    let font_path = font_path.as_ref();
    info!("加载标注字体: {}", font_path.display());

    let bytes = std::fs::read(font_path)?;
    let font = FontVec::try_from_vec(bytes)
      .map_err(|_| RenderError::FontInvalid(font_path.display().to_string()))?;

    Ok(Annotator { font })
  }

  /// 按列表顺序逐个绘制，后面的检测覆盖前面的检测。
  pub fn annotate(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    for detection in detections {
      self.draw_detection(&mut canvas, detection);
    }
    canvas
  }

  fn draw_detection(&self, canvas: &mut RgbImage, detection: &Detection) {
    let (w, h) = (canvas.width() as f32, canvas.height() as f32);

    // 归一化坐标换算为像素并截断取整
    let x0 = (detection.bbox.xmin * w) as i32;
    let y0 = (detection.bbox.ymin * h) as i32;
    let x1 = (detection.bbox.xmax * w) as i32;
    let y1 = (detection.bbox.ymax * h) as i32;

    let label = label_text(detection.score, &detection.label);

    // 字号同时取决于框高与文本长度
    let (text_width, _) = text_size(PxScale::from(MEASURE_SCALE), &self.font, &label);
    let font_size = label_scale((y1 - y0) as f32, text_width as f32);
    let scale = PxScale::from(font_size);

    // 先画 4px 黑色外框，再叠加 2px 强调色内框
    draw_rect_outline(canvas, x0, y0, x1, y1, OUTER_BORDER_WIDTH, OUTLINE_COLOR);
    draw_rect_outline(canvas, x0, y0, x1, y1, INNER_BORDER_WIDTH, ACCENT_COLOR);

    // 黑色 1px 描边效果：向四个方向各偏移一次
    let text_x = x0 + LABEL_OFFSET;
    let text_y = y0 + LABEL_OFFSET;
    for (dx, dy) in [(0, 0), (-1, 0), (1, 0), (0, -1), (0, 1)] {
      draw_text_mut(
        canvas,
        OUTLINE_COLOR,
        text_x + dx,
        text_y + dy,
        scale,
        &self.font,
        &label,
      );
    }
    draw_text_mut(canvas, ACCENT_COLOR, text_x, text_y, scale, &self.font, &label);
  }
}

/// 标签文本：`<评分百分比>% <词首大写的标签>`。
pub fn label_text(score: f32, label: &str) -> String {
  format!("{}% {}", (score * 100.0).round() as i32, title_case(label))
}

/// 字号启发式：`clamp(30 * 框高 / 文本宽, 8, 36)`。
/// 换字体或参考字号都会改变视觉结果，保持原样。
pub fn label_scale(box_height_px: f32, text_width_px: f32) -> f32 {
  let ratio = FONT_SIZE_FACTOR * box_height_px / text_width_px;
  if !ratio.is_finite() {
    return FONT_SIZE_MIN;
  }
  ratio.clamp(FONT_SIZE_MIN, FONT_SIZE_MAX)
}

/// 逐词首字母大写，其余小写。
pub fn title_case(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut word_start = true;
  for c in text.chars() {
    if c.is_alphabetic() {
      if word_start {
        out.extend(c.to_uppercase());
      } else {
        out.extend(c.to_lowercase());
      }
      word_start = false;
    } else {
      out.push(c);
      word_start = true;
    }
  }
  out
}

/// 以 (x0, y0)-(x1, y1) 为外沿向内收缩绘制 `width` 像素的空心矩形。
fn draw_rect_outline(
  canvas: &mut RgbImage,
  x0: i32,
  y0: i32,
  x1: i32,
  y1: i32,
  width: i32,
  color: Rgb<u8>,
) {
  for t in 0..width {
    let w = x1 - x0 - 2 * t;
    let h = y1 - y0 - 2 * t;
    if w <= 0 || h <= 0 {
      break;
    }
    let rect = Rect::at(x0 + t, y0 + t).of_size(w as u32, h as u32);
    draw_hollow_rect_mut(canvas, rect, color);
  }
}
