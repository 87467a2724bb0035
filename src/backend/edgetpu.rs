// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/backend/edgetpu.rs - TF-Lite / Edge TPU 后端
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

use tflite::ops::builtin::BuiltinOpResolver;
use tflite::{FlatBufferModel, Interpreter, InterpreterBuilder};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, InputShape, RawTensor, TensorBackend};

/// 基于 TF-Lite 解释器的真实推理后端。
///
/// 模型句柄为进程生命周期单例：启动时创建一次，进程退出时
/// 随解释器一起释放，不提供重载路径。当前构建只注册内建算子，
/// 未链接 libedgetpu 外部委托：带 `@<device>` 后缀的模型路径
/// 在启动时直接报错，而不是静默回退到 CPU；Edge TPU 编译的
/// 模型（含 edgetpu-custom-op）会在解释器构建阶段失败。
pub struct EdgeTpuBackend {
  interpreter: Interpreter<'static, BuiltinOpResolver>,
  shape: InputShape,
  input_index: i32,
  output_indices: Vec<i32>,
  output_names: Vec<String>,
  capacity: usize,
}

// 解释器内部缓冲只在 run/output 中访问，外层由调用方串行化
unsafe impl Send for EdgeTpuBackend {}
unsafe impl Sync for EdgeTpuBackend {}

impl EdgeTpuBackend {
  pub fn load(model_path: &str, device: Option<&str>) -> Result<Self, BackendError> {
    // 未链接委托时无法兑现设备选择，启动即失败
    if let Some(device) = device {
      return Err(BackendError::DeviceUnsupported(device.to_string()));
    }
    info!("加载模型文件: {}", model_path);
    debug!("未注册外部委托，使用内建算子在 CPU 上推理");

    let model = FlatBufferModel::build_from_file(model_path)
      .map_err(|e| BackendError::ModelInvalid(e.to_string()))?;
    let resolver = BuiltinOpResolver::default();
    let builder = InterpreterBuilder::new(model, resolver)
      .map_err(|e| BackendError::ModelInvalid(e.to_string()))?;
    let mut interpreter = builder
      .build()
      .map_err(|e| BackendError::ModelInvalid(format!("解释器构建失败, Edge TPU 编译的模型需要外部委托: {}", e)))?;

    interpreter
      .allocate_tensors()
      .map_err(|e| BackendError::ModelInvalid(format!("张量缓冲分配失败: {}", e)))?;

    let inputs = interpreter.inputs().to_vec();
    let input_index = *inputs
      .first()
      .ok_or_else(|| BackendError::ModelInvalid("模型没有输入张量".to_string()))?;

    let info = interpreter
      .tensor_info(input_index)
      .ok_or_else(|| BackendError::ModelInvalid("无法读取输入张量信息".to_string()))?;
    let dims = info.dims.clone();
    if dims.len() != 4 {
      return Err(BackendError::ModelInvalid(format!(
        "期望输入张量为 NHWC 四维, 实际 {} 维",
        dims.len()
      )));
    }
    let shape = InputShape {
      height: dims[1] as u32,
      width: dims[2] as u32,
      channels: dims[3] as u32,
    };
    debug!("模型输入形状: {:?}", shape);

    let output_indices = interpreter.outputs().to_vec();
    let mut output_names = Vec::with_capacity(output_indices.len());
    let mut capacity = 0usize;
    for &idx in &output_indices {
      let info = interpreter
        .tensor_info(idx)
        .ok_or_else(|| BackendError::ModelInvalid("无法读取输出张量信息".to_string()))?;
      // boxes 张量形状为 [1, N, 4]，N 即检测槽位容量
      if info.dims.len() == 3 && info.dims[2] == 4 {
        capacity = info.dims[1];
      }
      output_names.push(info.name.clone());
    }
    if capacity == 0 {
      warn!("未找到 [1, N, 4] 形状的 boxes 张量，容量未知");
    }
    debug!("模型输出: {:?}, 槽位容量: {}", output_names, capacity);

    info!("模型加载完成");
    Ok(EdgeTpuBackend {
      interpreter,
      shape,
      input_index,
      output_indices,
      output_names,
      capacity,
    })
  }
}

impl TensorBackend for EdgeTpuBackend {
  fn input_shape(&self) -> InputShape {
    self.shape
  }

  fn output_count(&self) -> usize {
    self.output_indices.len()
  }

  fn output_name(&self, index: usize) -> Option<&str> {
    self.output_names.get(index).map(String::as_str)
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

    let buffer: &mut [u8] = self
      .interpreter
      .tensor_data_mut(self.input_index)
      .map_err(|e| BackendError::Run(e.to_string()))?;
    buffer.copy_from_slice(input);

    self
      .interpreter
      .invoke()
      .map_err(|e| BackendError::Run(e.to_string()))
  }

  fn output(&self, index: usize) -> Result<RawTensor, BackendError> {
    let &tensor_index = self
      .output_indices
      .get(index)
      .ok_or(BackendError::NoSuchOutput(index))?;

    // SSD 后处理算子的输出均为 float32；量化模型的中间张量
    // 不会出现在这里，故不携带量化参数
    let data: Vec<f32> = self
      .interpreter
      .tensor_data::<f32>(tensor_index)
      .map_err(|e| BackendError::Run(e.to_string()))?
      .to_vec();

    Ok(RawTensor::plain(data))
  }
}
