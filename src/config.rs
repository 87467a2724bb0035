// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/config.rs - 服务配置
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

use std::path::PathBuf;

use clap::Parser;

/// 服务配置。每个选项都可以通过同名环境变量提供，
/// 命令行参数优先于环境变量。
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
  /// 模型文件路径，可带 `@<device>` 后缀在多个加速单元中选择
  #[arg(
    long,
    env = "model_path",
    default_value = "data/mobilenet_ssd_v2_coco_quant_postprocess_edgetpu.tflite",
    value_name = "FILE"
  )]
  pub model_path: String,

  /// 标签文件路径
  #[arg(
    long,
    env = "labels_path",
    default_value = "data/coco_labels.txt",
    value_name = "FILE"
  )]
  pub labels_path: String,

  /// 标注字体文件路径，缺失视为启动失败
  #[arg(
    long,
    env = "font_path",
    default_value = "assets/DejaVuSans.ttf",
    value_name = "FILE"
  )]
  pub font_path: String,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "threshold", default_value = "0.6", value_name = "THRESHOLD")]
  pub threshold: f32,

  /// 最多考虑的检测槽位数
  #[arg(long, env = "top_k", default_value = "5", value_name = "COUNT")]
  pub top_k: usize,

  /// 是否在 JSON 响应中附带 base64 编码的标注图
  #[arg(
    long,
    env = "return_image",
    default_value = "false",
    action = clap::ArgAction::Set,
    value_name = "BOOL"
  )]
  pub return_image: bool,

  /// 是否把进程钉在大核上以稳定推理延迟
  #[arg(
    long,
    env = "restrict_cores",
    default_value = "true",
    action = clap::ArgAction::Set,
    value_name = "BOOL"
  )]
  pub restrict_cores: bool,

  /// 调试帧输出目录；目录存在时每次分析都覆盖写 debug_frame.jpeg
  #[arg(long, env = "debug_image", value_name = "DIR")]
  pub debug_image: Option<PathBuf>,

  /// 调试上传表单的路由路径，未设置时不启用该路由
  #[arg(long, env = "debug_form_path", value_name = "PATH")]
  pub debug_form_path: Option<String>,

  /// HTTP 监听地址
  #[arg(long, env = "bind", default_value = "0.0.0.0:5000", value_name = "ADDR")]
  pub bind: String,
}
