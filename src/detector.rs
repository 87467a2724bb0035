// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/detector.rs - 检测器与后处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Mutex;
use std::time::Instant;

use image::RgbImage;
use image::imageops::{self, FilterType};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{BackendError, InputShape, OutputLayout, TensorBackend};
use crate::draw::Annotator;
use crate::labels::LabelTable;

pub const DEFAULT_THRESHOLD: f32 = 0.1;
pub const DEFAULT_TOP_K: usize = 3;

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[source] BackendError),
  #[error("输入形状不符: {0}")]
  InputShape(String),
  #[error("推理错误: {0}")]
  Inference(#[source] BackendError),
}

/// 归一化包围框，已按 [0,1] 裁剪。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
  pub xmin: f32,
  pub ymin: f32,
  pub xmax: f32,
  pub ymax: f32,
}

/// 一条过滤后的检测记录。
/// 线上字段名沿用既有接口：id / id_str / score / bbox。
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
  #[serde(rename = "id")]
  pub class_id: u32,
  #[serde(rename = "id_str")]
  pub label: String,
  pub score: f32,
  pub bbox: BBox,
}

/// 一次 analyze 调用的完整结果，调用方持有，随响应丢弃。
#[derive(Debug)]
pub struct Analysis {
  pub objects: Vec<Detection>,
  pub inference_time_ms: f64,
  pub annotated_image: Option<RgbImage>,
}

/// analyze 的调用参数。`annotator` 为 Some 时在原始（未缩放）
/// 图像上绘制标注并附带在结果中。
#[derive(Clone, Copy)]
pub struct AnalyzeOptions<'a> {
  pub threshold: f32,
  pub top_k: usize,
  pub resample: FilterType,
  pub annotator: Option<&'a Annotator>,
}

impl Default for AnalyzeOptions<'_> {
  fn default() -> Self {
    AnalyzeOptions {
      threshold: DEFAULT_THRESHOLD,
      top_k: DEFAULT_TOP_K,
      resample: FilterType::Nearest,
      annotator: None,
    }
  }
}

/// 检测器：持有加载完成的后端句柄与标签表。
///
/// 初始化失败视为进程级致命错误，没有重载或重试路径。
/// 后端内部缓冲非只读，跨线程共享时由互斥锁串行化推理，
/// 与单模型单实例的资源模型一致。
pub struct Detector {
  backend: Mutex<Box<dyn TensorBackend>>,
  labels: LabelTable,
  layout: OutputLayout,
  shape: InputShape,
  capacity: usize,
}

impl std::fmt::Debug for Detector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Detector")
      .field("labels", &self.labels)
      .field("layout", &self.layout)
      .field("shape", &self.shape)
      .field("capacity", &self.capacity)
      .finish_non_exhaustive()
  }
}

impl Detector {
  pub fn new(backend: Box<dyn TensorBackend>, labels: LabelTable) -> Result<Self, DetectError> {
    let shape = backend.input_shape();
    if shape.channels != 3 {
      return Err(DetectError::ModelLoad(BackendError::ModelInvalid(format!(
        "期望 3 通道 RGB 输入, 模型声明 {} 通道",
        shape.channels
      ))));
    }
    if shape.width == 0 || shape.height == 0 {
      return Err(DetectError::ModelLoad(BackendError::ModelInvalid(
        "模型输入尺寸为零".to_string(),
      )));
    }

    // 加载时解析一次角色到下标的映射，失败则快速退出
    let layout = OutputLayout::resolve(backend.as_ref()).map_err(DetectError::ModelLoad)?;
    let capacity = backend.capacity();

    info!(
      "检测器就绪: 输入 {}x{}x{}, 槽位容量 {}",
      shape.width, shape.height, shape.channels, capacity
    );

    Ok(Detector {
      backend: Mutex::new(backend),
      labels,
      layout,
      shape,
      capacity,
    })
  }

  pub fn input_shape(&self) -> InputShape {
    self.shape
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  /// 对一张图像执行检测。
  ///
  /// 图像先按 `opts.resample`（默认最近邻）缩放到模型输入尺寸，
  /// 推理后按阈值与 top_k 过滤输出槽位。`top_k` 会被钳制到后端
  /// 槽位容量，后端报告的检测数作为额外过滤条件。
  pub fn analyze(&self, image: &RgbImage, opts: &AnalyzeOptions) -> Result<Analysis, DetectError> {
    let shape = self.shape;
    let resized = imageops::resize(image, shape.width, shape.height, opts.resample);
    let input = resized.into_raw();
    if input.len() != shape.byte_len() {
      return Err(DetectError::InputShape(format!(
        "缩放后 {} 字节, 模型期望 {} 字节",
        input.len(),
        shape.byte_len()
      )));
    }

    let (inference_time_ms, boxes, class_ids, scores, count) = {
      let mut backend = self.backend.lock().unwrap();

      let started = Instant::now();
      backend.run(&input).map_err(|e| match e {
        e @ BackendError::InputSize { .. } => DetectError::InputShape(e.to_string()),
        e => DetectError::Inference(e),
      })?;
      let inference_time_ms = started.elapsed().as_secs_f64() * 1000.0;

      let layout = self.layout;
      let boxes = backend
        .output(layout.boxes)
        .map_err(DetectError::Inference)?
        .values();
      let class_ids = backend
        .output(layout.class_ids)
        .map_err(DetectError::Inference)?
        .values();
      let scores = backend
        .output(layout.scores)
        .map_err(DetectError::Inference)?
        .values();
      let count = backend
        .output(layout.count)
        .map_err(DetectError::Inference)?
        .values()
        .first()
        .copied()
        .unwrap_or(0.0) as usize;

      (inference_time_ms, boxes, class_ids, scores, count)
    };

    info!("前向推理耗时 {:.2} ms", inference_time_ms);

    // top_k 钳制到后端容量，避免越界读取固定大小的输出槽位
    let limit = opts.top_k.min(self.capacity).min(scores.len());
    debug!(
      "过滤槽位: top_k={} 容量={} 报告检测数={} 有效上限={}",
      opts.top_k, self.capacity, count, limit
    );

    let mut objects = Vec::new();
    for i in 0..limit {
      if i >= count || scores[i] < opts.threshold {
        continue;
      }
      let Some(raw) = boxes.get(4 * i..4 * i + 4) else {
        break;
      };
      let class_id = class_ids.get(i).copied().unwrap_or(0.0) as u32;

      // 槽位坐标顺序为 [ymin, xmin, ymax, xmax]
      objects.push(Detection {
        class_id,
        label: self.labels.lookup(class_id),
        score: scores[i],
        bbox: BBox {
          xmin: raw[1].max(0.0),
          ymin: raw[0].max(0.0),
          xmax: raw[3].min(1.0),
          ymax: raw[2].min(1.0),
        },
      });
    }

    debug!("检测到 {} 个物体", objects.len());

    let annotated_image = opts
      .annotator
      .map(|annotator| annotator.annotate(image, &objects));

    Ok(Analysis {
      objects,
      inference_time_ms,
      annotated_image,
    })
  }
}
