// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/backend/scripted.rs - 脚本化回放后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::debug;

use crate::backend::{BackendError, InputShape, RawTensor, TensorBackend};

/// 回放固定输出张量的后端，用于离线测试与联调。
///
/// 每次 `run` 只校验输入字节数，之后 `output` 返回预先
/// 写好的张量副本。
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
  shape: InputShape,
  names: Vec<String>,
  outputs: Vec<RawTensor>,
  capacity: usize,
  runs: usize,
}

impl ScriptedBackend {
  pub fn new(shape: InputShape) -> Self {
    ScriptedBackend {
      shape,
      names: Vec::new(),
      outputs: Vec::new(),
      capacity: 0,
      runs: 0,
    }
  }

  pub fn with_output(mut self, name: &str, tensor: RawTensor) -> Self {
    self.names.push(name.to_string());
    self.outputs.push(tensor);
    self
  }

  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  /// 按 SSD 后处理惯例构造四个输出张量。
  /// `boxes` 的每项为 `[ymin, xmin, ymax, xmax]` 归一化坐标。
  pub fn coco(
    shape: InputShape,
    boxes: &[[f32; 4]],
    class_ids: &[f32],
    scores: &[f32],
    count: usize,
  ) -> Self {
    let flat: Vec<f32> = boxes.iter().flatten().copied().collect();
    let capacity = scores.len();
    Self::new(shape)
      .with_output("detection_boxes", RawTensor::plain(flat))
      .with_output("detection_classes", RawTensor::plain(class_ids.to_vec()))
      .with_output("detection_scores", RawTensor::plain(scores.to_vec()))
      .with_output("num_detections", RawTensor::plain(vec![count as f32]))
      .with_capacity(capacity)
  }

  pub fn runs(&self) -> usize {
    self.runs
  }
}

impl TensorBackend for ScriptedBackend {
  fn input_shape(&self) -> InputShape {
    self.shape
  }

  fn output_count(&self) -> usize {
    self.outputs.len()
  }

  fn output_name(&self, index: usize) -> Option<&str> {
    self.names.get(index).map(String::as_str)
  }

  fn capacity(&self) -> usize {
    self.capacity
  }

  fn run(&mut self, input: &[u8]) -> Result<(), BackendError> {
    let expected = self.shape.byte_len();
    if input.len() != expected {
      return Err(BackendError::InputSize {
        expected,
        actual: input.len(),
      });
    }
    self.runs += 1;
    debug!("脚本化后端第 {} 次回放", self.runs);
    Ok(())
  }

  fn output(&self, index: usize) -> Result<RawTensor, BackendError> {
    self
      .outputs
      .get(index)
      .cloned()
      .ok_or(BackendError::NoSuchOutput(index))
  }
}
