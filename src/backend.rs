// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/backend.rs - 推理后端抽象
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::{debug, warn};

#[cfg(feature = "edgetpu")]
pub mod edgetpu;
pub mod scripted;

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("模型加载错误: {0}")]
  ModelLoad(std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("输出张量 {0} 不存在")]
  NoSuchOutput(usize),
  #[error("无法确定输出张量布局: {0}")]
  OutputLayout(String),
  #[error("输入尺寸不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  InputSize { expected: usize, actual: usize },
  #[error("推理执行失败: {0}")]
  Run(String),
  #[error("本构建未链接加速委托, 无法选择设备 {0:?}")]
  DeviceUnsupported(String),
  #[error("本构建未启用任何推理运行时（edgetpu 特性未开启）")]
  NoRuntime,
}

impl From<std::io::Error> for BackendError {
  fn from(err: std::io::Error) -> Self {
    BackendError::ModelLoad(err)
  }
}

/// 模型输入张量的形状，NHWC 排布，批大小固定为 1。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
  pub width: u32,
  pub height: u32,
  pub channels: u32,
}

impl InputShape {
  pub fn byte_len(&self) -> usize {
    (self.width as usize) * (self.height as usize) * (self.channels as usize)
  }
}

/// 每张量量化参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
  pub scale: f32,
  pub zero_point: f32,
}

impl Quantization {
  /// 反量化单个原始值：scale 为 0 时只减去零点。
  pub fn dequantize(&self, raw: f32) -> f32 {
    if self.scale == 0.0 {
      raw - self.zero_point
    } else {
      self.scale * (raw - self.zero_point)
    }
  }
}

/// 一次推理产生的单个输出张量。
///
/// `data` 保存后端给出的原始数值，`quant` 存在时 `values`
/// 会按量化参数反量化；不存在时原样返回。
#[derive(Debug, Clone)]
pub struct RawTensor {
  pub data: Vec<f32>,
  pub quant: Option<Quantization>,
}

impl RawTensor {
  pub fn plain(data: Vec<f32>) -> Self {
    RawTensor { data, quant: None }
  }

  pub fn quantized(data: Vec<f32>, scale: f32, zero_point: f32) -> Self {
    RawTensor {
      data,
      quant: Some(Quantization { scale, zero_point }),
    }
  }

  pub fn values(&self) -> Vec<f32> {
    match self.quant {
      Some(q) => self.data.iter().map(|&raw| q.dequantize(raw)).collect(),
      None => self.data.clone(),
    }
  }
}

/// 推理后端能力接口。
///
/// 后端是外部协作者：加载编译好的网络并返回原始输出张量，
/// 本 crate 不关心其内部实现。检测语义全部位于 [`crate::detector`]。
pub trait TensorBackend: Send + Sync {
  /// 模型声明的输入形状。
  fn input_shape(&self) -> InputShape;

  /// 输出张量个数。
  fn output_count(&self) -> usize;

  /// 输出张量名称，后端不提供名称时返回 None。
  fn output_name(&self, index: usize) -> Option<&str>;

  /// 检测槽位容量，即 boxes 张量一次最多返回多少个框。
  fn capacity(&self) -> usize;

  /// 执行一次前向推理。`input` 为 NHWC 排布的 RGB 字节。
  fn run(&mut self, input: &[u8]) -> Result<(), BackendError>;

  /// 读取上一次推理的第 `index` 个输出张量。
  fn output(&self, index: usize) -> Result<RawTensor, BackendError>;
}

/// 输出张量在检测模型中的角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
  Boxes,
  ClassIds,
  Scores,
  Count,
}

impl TensorRole {
  /// 按名称识别该角色时使用的子串关键字。
  pub fn name_keys(self) -> &'static [&'static str] {
    match self {
      TensorRole::Boxes => &["box"],
      TensorRole::ClassIds => &["class"],
      TensorRole::Scores => &["score"],
      TensorRole::Count => &["count", "num_detection"],
    }
  }
}

/// 角色到输出下标的映射，在模型加载时解析并校验一次。
///
/// SSD 后处理算子的四个输出按惯例为 0=boxes、1=class ids、
/// 2=scores、3=count，但不同导出器会重排；优先按名称匹配，
/// 名称不可用且恰好有四个输出时退回惯例顺序。
#[derive(Debug, Clone, Copy)]
pub struct OutputLayout {
  pub boxes: usize,
  pub class_ids: usize,
  pub scores: usize,
  pub count: usize,
}

impl OutputLayout {
  pub fn resolve(backend: &dyn TensorBackend) -> Result<Self, BackendError> {
    let n = backend.output_count();
    let names: Vec<Option<String>> = (0..n)
      .map(|i| backend.output_name(i).map(|s| s.to_ascii_lowercase()))
      .collect();

    let find = |role: TensorRole| -> Option<usize> {
      names.iter().position(|name| {
        name
          .as_deref()
          .map(|n| role.name_keys().iter().any(|k| n.contains(k)))
          .unwrap_or(false)
      })
    };

    let by_name = (
      find(TensorRole::Boxes),
      find(TensorRole::ClassIds),
      find(TensorRole::Scores),
      find(TensorRole::Count),
    );

    if let (Some(boxes), Some(class_ids), Some(scores), Some(count)) = by_name {
      let mut indices = [boxes, class_ids, scores, count];
      indices.sort_unstable();
      if indices.windows(2).all(|w| w[0] != w[1]) {
        debug!(
          "按名称解析输出布局: boxes={} classes={} scores={} count={}",
          boxes, class_ids, scores, count
        );
        return Ok(OutputLayout {
          boxes,
          class_ids,
          scores,
          count,
        });
      }
    }

    // 名称不足以区分角色，仅在输出数量与惯例一致时退回固定顺序
    if n == 4 {
      warn!("输出名称无法区分角色，退回 SSD 惯例顺序 0..3");
      return Ok(OutputLayout {
        boxes: 0,
        class_ids: 1,
        scores: 2,
        count: 3,
      });
    }

    Err(BackendError::OutputLayout(format!(
      "模型有 {} 个输出且名称无法识别",
      n
    )))
  }
}

/// 拆分模型路径中的 `@<device>` 设备后缀。
/// 无后缀时选择默认设备。
pub fn split_device_hint(model_path: &str) -> (&str, Option<&str>) {
  match model_path.split_once('@') {
    Some((path, device)) if !device.is_empty() => (path, Some(device)),
    Some((path, _)) => (path, None),
    None => (model_path, None),
  }
}

/// 按构建特性加载进程唯一的推理后端。
pub fn load_backend(model_path: &str) -> Result<Box<dyn TensorBackend>, BackendError> {
  let (path, device) = split_device_hint(model_path);

  #[cfg(feature = "edgetpu")]
  {
    let backend = edgetpu::EdgeTpuBackend::load(path, device)?;
    return Ok(Box::new(backend));
  }

  #[cfg(not(feature = "edgetpu"))]
  {
    let _ = (path, device);
    Err(BackendError::NoRuntime)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::scripted::ScriptedBackend;

  #[test]
  fn dequantize_identity_under_unit_scale() {
    let tensor = RawTensor::quantized(vec![0.0, 0.5, 127.0], 1.0, 0.0);
    assert_eq!(tensor.values(), vec![0.0, 0.5, 127.0]);
  }

  #[test]
  fn dequantize_zero_scale_subtracts_zero_point() {
    let tensor = RawTensor::quantized(vec![10.0, 20.0], 0.0, 10.0);
    assert_eq!(tensor.values(), vec![0.0, 10.0]);
  }

  #[test]
  fn dequantize_scales_around_zero_point() {
    let tensor = RawTensor::quantized(vec![130.0], 0.5, 128.0);
    assert_eq!(tensor.values(), vec![1.0]);
  }

  #[test]
  fn plain_tensor_passes_through() {
    let tensor = RawTensor::plain(vec![0.25, 0.75]);
    assert_eq!(tensor.values(), vec![0.25, 0.75]);
  }

  #[test]
  fn split_device_hint_suffix() {
    assert_eq!(
      split_device_hint("model.tflite@usb:0"),
      ("model.tflite", Some("usb:0"))
    );
    assert_eq!(split_device_hint("model.tflite"), ("model.tflite", None));
    assert_eq!(split_device_hint("model.tflite@"), ("model.tflite", None));
  }

  #[test]
  fn layout_resolves_by_name_in_any_order() {
    let shape = InputShape {
      width: 4,
      height: 4,
      channels: 3,
    };
    let backend = ScriptedBackend::new(shape)
      .with_output("detection_scores", RawTensor::plain(vec![0.9]))
      .with_output("detection_boxes", RawTensor::plain(vec![0.0; 4]))
      .with_output("num_detections", RawTensor::plain(vec![1.0]))
      .with_output("detection_classes", RawTensor::plain(vec![0.0]));

    let layout = OutputLayout::resolve(&backend).unwrap();
    assert_eq!(layout.scores, 0);
    assert_eq!(layout.boxes, 1);
    assert_eq!(layout.count, 2);
    assert_eq!(layout.class_ids, 3);
  }

  #[test]
  fn role_keys_match_both_count_conventions() {
    let shape = InputShape {
      width: 4,
      height: 4,
      channels: 3,
    };
    // 不同导出器对计数张量的命名不同
    for count_name in ["count", "num_detections"] {
      let backend = ScriptedBackend::new(shape)
        .with_output("detection_boxes", RawTensor::plain(vec![0.0; 4]))
        .with_output("detection_classes", RawTensor::plain(vec![0.0]))
        .with_output("detection_scores", RawTensor::plain(vec![0.9]))
        .with_output(count_name, RawTensor::plain(vec![1.0]));

      let layout = OutputLayout::resolve(&backend).unwrap();
      assert_eq!(layout.count, 3, "{count_name}");
    }
    assert!(TensorRole::Count.name_keys().contains(&"num_detection"));
  }

  #[test]
  fn layout_falls_back_to_ssd_order() {
    let shape = InputShape {
      width: 4,
      height: 4,
      channels: 3,
    };
    // TFLite 后处理算子的输出名通常全部相同，无信息量
    let backend = ScriptedBackend::new(shape)
      .with_output("TFLite_Detection_PostProcess", RawTensor::plain(vec![0.0; 4]))
      .with_output("TFLite_Detection_PostProcess:1", RawTensor::plain(vec![0.0]))
      .with_output("TFLite_Detection_PostProcess:2", RawTensor::plain(vec![0.9]))
      .with_output("TFLite_Detection_PostProcess:3", RawTensor::plain(vec![1.0]));

    let layout = OutputLayout::resolve(&backend).unwrap();
    assert_eq!(
      (layout.boxes, layout.class_ids, layout.scores, layout.count),
      (0, 1, 2, 3)
    );
  }

  #[test]
  fn layout_rejects_unidentifiable_outputs() {
    let shape = InputShape {
      width: 4,
      height: 4,
      channels: 3,
    };
    let backend = ScriptedBackend::new(shape)
      .with_output("a", RawTensor::plain(vec![0.0]))
      .with_output("b", RawTensor::plain(vec![0.0]))
      .with_output("c", RawTensor::plain(vec![0.0]));

    assert!(OutputLayout::resolve(&backend).is_err());
  }
}
