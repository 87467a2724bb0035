// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/server.rs - HTTP 前端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::io::Cursor;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::RgbImage;
use image::imageops::FilterType;
use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::detector::{Analysis, AnalyzeOptions, Detection, Detector};
use crate::draw::Annotator;

const DEBUG_FORM_HTML: &str = r#"<!doctype html>
<title>Edge Detection Test Form</title>
<h1>Upload new Image for analysis</h1>
<form method=post enctype=multipart/form-data>
  <input type=file name=file accept="image/*">
  <input type=submit value=Upload>
</form>
"#;

/// 进程启动时构造一次的共享状态，注入每个请求处理器。
#[derive(Clone)]
pub struct AppState {
  pub detector: Arc<Detector>,
  pub annotator: Arc<Annotator>,
  pub config: Arc<Config>,
}

impl AppState {
  pub fn new(detector: Detector, annotator: Annotator, config: Config) -> Self {
    AppState {
      detector: Arc::new(detector),
      annotator: Arc::new(annotator),
      config: Arc::new(config),
    }
  }
}

/// 组装路由。根路径与 favicon 一律 404；
/// 配置了 debug_form_path 时追加调试上传路由。
pub fn router(state: AppState) -> Router {
  let mut router = Router::new()
    .route("/analyse", post(analyse))
    .route("/", get(deny))
    .route("/favicon", get(deny));

  if let Some(path) = debug_form_route(&state.config) {
    info!("启用调试上传表单: {}", path);
    router = router.route(&path, get(debug_form).post(debug_upload));
  }

  router.with_state(state)
}

fn debug_form_route(config: &Config) -> Option<String> {
  let path = config.debug_form_path.as_ref()?;
  // 路由中的空格替换为连字符
  let mut path = path.replace(' ', "-");
  if !path.starts_with('/') {
    path.insert(0, '/');
  }
  Some(path)
}

/// 请求处理失败的统一出口：完整细节落服务端日志，
/// 客户端只收到不带正文的 500。
struct Failure(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for Failure {
  fn from(err: E) -> Self {
    Failure(err.into())
  }
}

impl IntoResponse for Failure {
  fn into_response(self) -> Response {
    error!("请求处理失败: {:#}", self.0);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
  }
}

async fn deny() -> StatusCode {
  StatusCode::NOT_FOUND
}

#[derive(Serialize)]
struct AnalyseResponse<'a> {
  objects: &'a [Detection],
  inference_time: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  labelled_image: Option<String>,
}

/// 同步的解码+推理+标注流程放进阻塞线程池执行，
/// 避免长推理阻塞异步运行时；不做排队与超时控制。
async fn run_analysis(
  state: AppState,
  bytes: Vec<u8>,
  force_annotate: bool,
) -> anyhow::Result<Analysis> {
  let analysis = tokio::task::spawn_blocking(move || -> anyhow::Result<Analysis> {
    let image = image::load_from_memory(&bytes)?.to_rgb8();

    let config = &state.config;
    let annotate = force_annotate || config.return_image || config.debug_image.is_some();
    let opts = AnalyzeOptions {
      threshold: config.threshold,
      top_k: config.top_k,
      resample: FilterType::Nearest,
      annotator: annotate.then(|| state.annotator.as_ref()),
    };

    let analysis = state.detector.analyze(&image, &opts)?;

    if let Some(dir) = &config.debug_image
      && dir.exists()
      && let Some(annotated) = &analysis.annotated_image
    {
      annotated.save(dir.join("debug_frame.jpeg"))?;
    }

    Ok(analysis)
  })
  .await??;

  Ok(analysis)
}

async fn analyse(State(state): State<AppState>, body: Bytes) -> Result<Response, Failure> {
  let analysis = run_analysis(state.clone(), body.to_vec(), false).await?;

  let labelled_image = if state.config.return_image {
    let annotated = analysis
      .annotated_image
      .as_ref()
      .ok_or_else(|| anyhow::anyhow!("标注图像缺失"))?;
    Some(BASE64.encode(encode_png(annotated)?))
  } else {
    None
  };

  let response = AnalyseResponse {
    objects: &analysis.objects,
    inference_time: analysis.inference_time_ms,
    labelled_image,
  };
  Ok(Json(&response).into_response())
}

async fn debug_form() -> Html<&'static str> {
  Html(DEBUG_FORM_HTML)
}

async fn debug_upload(
  State(state): State<AppState>,
  mut multipart: Multipart,
) -> Result<Response, Failure> {
  let mut file = None;
  while let Some(field) = multipart.next_field().await? {
    if field.name() == Some("file") {
      file = Some(field.bytes().await?.to_vec());
      break;
    }
  }
  let bytes = file.ok_or_else(|| anyhow::anyhow!("多部分表单缺少 file 字段"))?;
  info!("调试表单收到 {} 字节上传", bytes.len());

  let analysis = run_analysis(state, bytes, true).await?;
  let annotated = analysis
    .annotated_image
    .ok_or_else(|| anyhow::anyhow!("标注图像缺失"))?;
  let png = encode_png(&annotated)?;

  Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

fn encode_png(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, image::ImageFormat::Png)?;
  Ok(buffer.into_inner())
}
