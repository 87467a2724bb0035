// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/main.rs - 服务主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jiannan::backend::load_backend;
use jiannan::config::Config;
use jiannan::detector::Detector;
use jiannan::draw::Annotator;
use jiannan::labels::LabelTable;
use jiannan::server::{AppState, router};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::parse();

  info!("模型文件路径: {}", config.model_path);
  info!("标签文件路径: {}", config.labels_path);
  info!("置信度阈值: {}", config.threshold);
  info!("top_k: {}", config.top_k);

  if config.restrict_cores {
    restrict_cores();
  }

  // 启动阶段的失败不做捕获，直接中止进程
  let labels = LabelTable::load(&config.labels_path).context("标签加载失败")?;
  let annotator = Annotator::load(&config.font_path).context("标注字体加载失败")?;
  let backend = load_backend(&config.model_path).context("模型加载失败")?;
  let detector = Detector::new(backend, labels).context("检测器初始化失败")?;

  let bind = config.bind.clone();
  let state = AppState::new(detector, annotator, config);
  let app = router(state);

  let listener = TcpListener::bind(&bind)
    .await
    .with_context(|| format!("无法监听 {}", bind))?;
  info!("HTTP 服务监听 {}", bind);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务退出");
  Ok(())
}

// 在 Rock Pi 上钉到 4-5 号 A72 大核能稍微稳定推理延迟
fn restrict_cores() {
  info!("限制进程运行在 4-5 号大核");
  let pid = std::process::id().to_string();
  match Command::new("taskset").args(["-p", "-c", "4-5", &pid]).status() {
    Ok(status) if status.success() => {}
    Ok(status) => warn!("taskset 退出状态异常: {}", status),
    Err(err) => warn!("taskset 执行失败: {}", err),
  }
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，准备退出..."),
    Err(err) => warn!("无法安装 Ctrl-C 处理器: {}", err),
  }
}
