// 该文件是 Jiannan （剑南春风） 项目的一部分。
// tests/http_api.rs - HTTP 接口集成测试
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::io::Cursor;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Parser as _;
use http_body_util::BodyExt;
use image::{Rgb, RgbImage};
use tower::util::ServiceExt;

use jiannan::backend::InputShape;
use jiannan::backend::scripted::ScriptedBackend;
use jiannan::config::Config;
use jiannan::detector::Detector;
use jiannan::draw::Annotator;
use jiannan::labels::LabelTable;
use jiannan::server::{AppState, router};

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

fn base_config(args: &[&str]) -> Config {
  let mut argv = vec!["jiannan-server"];
  argv.extend_from_slice(args);
  Config::parse_from(argv)
}

fn app_with(config: Config) -> Router {
  let shape = InputShape {
    width: 4,
    height: 4,
    channels: 3,
  };
  let backend = ScriptedBackend::coco(shape, &[[0.1, 0.1, 0.9, 0.9]], &[0.0], &[0.9], 1);
  let labels = LabelTable::parse("0  person\n").unwrap();
  let detector = Detector::new(Box::new(backend), labels).unwrap();
  let annotator =
    Annotator::load(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/DejaVuSans.ttf")).unwrap();
  router(AppState::new(detector, annotator, config))
}

fn png_bytes() -> Vec<u8> {
  let image = RgbImage::from_pixel(32, 32, Rgb([128, 64, 32]));
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
  buffer.into_inner()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
  response
    .into_body()
    .collect()
    .await
    .unwrap()
    .to_bytes()
    .to_vec()
}

#[tokio::test]
async fn analyse_returns_detection_json() {
  let app = app_with(base_config(&["--threshold", "0.5"]));

  let response = app
    .oneshot(
      Request::post("/analyse")
        .body(Body::from(png_bytes()))
        .unwrap(),
    )
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::OK);
  let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();

  let objects = json["objects"].as_array().unwrap();
  assert_eq!(objects.len(), 1);
  assert_eq!(objects[0]["id"], 0);
  assert_eq!(objects[0]["id_str"], "person");
  assert!(objects[0]["score"].as_f64().unwrap() >= 0.5);
  let bbox = &objects[0]["bbox"];
  for key in ["xmin", "ymin", "xmax", "ymax"] {
    let v = bbox[key].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&v));
  }
  assert!(json["inference_time"].as_f64().unwrap() >= 0.0);
  // 默认配置不回传标注图
  assert!(json.get("labelled_image").is_none());
}

#[tokio::test]
async fn analyse_rejects_garbage_with_opaque_500() {
  let app = app_with(base_config(&[]));

  let response = app
    .oneshot(
      Request::post("/analyse")
        .body(Body::from("这不是一张图片"))
        .unwrap(),
    )
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
  assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn root_and_favicon_are_denied() {
  let app = app_with(base_config(&[]));

  for path in ["/", "/favicon"] {
    let response = app
      .clone()
      .oneshot(Request::get(path).body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
  }
}

#[tokio::test]
async fn return_image_embeds_base64_png() {
  let app = app_with(base_config(&["--return-image", "true"]));

  let response = app
    .oneshot(
      Request::post("/analyse")
        .body(Body::from(png_bytes()))
        .unwrap(),
    )
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::OK);
  let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
  let encoded = json["labelled_image"].as_str().unwrap();
  let decoded = BASE64.decode(encoded).unwrap();
  assert_eq!(&decoded[..4], PNG_MAGIC);
}

#[tokio::test]
async fn debug_form_serves_upload_page_and_annotated_image() {
  // 路径中的空格应被替换为连字符
  let app = app_with(base_config(&["--debug-form-path", "/debug form"]));

  let response = app
    .clone()
    .oneshot(Request::get("/debug-form").body(Body::empty()).unwrap())
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  let page = String::from_utf8(body_bytes(response).await).unwrap();
  assert!(page.contains("Upload new Image for analysis"));

  let boundary = "X-JIANNAN-BOUNDARY";
  let mut body = Vec::new();
  body.extend_from_slice(
    format!(
      "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
       filename=\"frame.png\"\r\nContent-Type: image/png\r\n\r\n"
    )
    .as_bytes(),
  );
  body.extend_from_slice(&png_bytes());
  body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

  let response = app
    .oneshot(
      Request::post("/debug-form")
        .header(
          header::CONTENT_TYPE,
          format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap(),
    )
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
    "image/png"
  );
  let bytes = body_bytes(response).await;
  assert_eq!(&bytes[..4], PNG_MAGIC);
}

#[tokio::test]
async fn debug_image_directory_receives_overwritten_frame() {
  let dir = tempfile::tempdir().unwrap();
  let app = app_with(base_config(&[
    "--debug-image",
    dir.path().to_str().unwrap(),
  ]));

  let response = app
    .oneshot(
      Request::post("/analyse")
        .body(Body::from(png_bytes()))
        .unwrap(),
    )
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::OK);
  assert!(dir.path().join("debug_frame.jpeg").is_file());
}
