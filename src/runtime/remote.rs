// 该文件是 Shijue （视觉） 项目的一部分。
// src/runtime/remote.rs - 远程推理服务适配
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

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use reqwest::blocking::{
  Client,
  multipart::{Form, Part},
};
use serde_json::{Value, json};
use tracing::{debug, error, warn};
use url::Url;

use crate::{
  FromUrl,
  clock::as_millis_f64,
  config::RuntimeConfig,
  frame::rgb_image_from_raw,
  model::RawPrediction,
  runtime::{
    BackendError, BackendFactory, BackendOutput, ImagePayload, InferenceBackend, InferenceInput,
    RuntimeKind,
  },
};

const DETECT_PATH: &str = "v1/detect";
const META_SCHEMA_VERSION: u32 = 1;
const JPEG_QUALITY: u8 = 85;
const TIMING_KEYS: [&str; 4] = ["infer_ms", "inferMs", "inference_ms", "processing_ms"];

/// 推理服务地址与 HTTP 客户端
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
  base_url: Url,
  client: Client,
}

impl RemoteEndpoint {
  pub fn new(base_url: Url) -> Result<Self, BackendError> {
    let client = Client::builder().build()?;
    Ok(Self { base_url, client })
  }

  pub fn with_client(base_url: Url, client: Client) -> Self {
    Self { base_url, client }
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  pub fn detect_url(&self) -> String {
    format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), DETECT_PATH)
  }
}

impl FromUrl for RemoteEndpoint {
  type Error = BackendError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if !matches!(url.scheme(), "http" | "https") {
      error!("推理服务地址必须使用 http 或 https 方案: {}", url);
      return Err(BackendError::Configuration(format!(
        "unsupported server scheme '{}'",
        url.scheme()
      )));
    }
    RemoteEndpoint::new(url.clone())
  }
}

/// 通过 HTTP 调用推理服务的后端
///
/// 只接受图像输入；原始像素先编码为 JPEG 再上传。
pub struct RemoteBackend {
  endpoint: Option<RemoteEndpoint>,
  config: Arc<RuntimeConfig>,
}

impl RemoteBackend {
  pub fn new(endpoint: Option<RemoteEndpoint>, config: Arc<RuntimeConfig>) -> Self {
    Self { endpoint, config }
  }

  pub fn factory(endpoint: Option<RemoteEndpoint>) -> BackendFactory {
    Box::new(move |config: Arc<RuntimeConfig>| {
      Ok(Box::new(RemoteBackend::new(endpoint.clone(), config)) as Box<dyn InferenceBackend>)
    })
  }

  fn upload_part(&self, payload: &ImagePayload) -> Result<Part, BackendError> {
    let file_name = format!("frame-{}.jpg", Utc::now().timestamp_millis());
    let (bytes, mime) = match payload {
      ImagePayload::Encoded { bytes, mime } => (bytes.clone(), mime.as_str()),
      ImagePayload::Raw {
        width,
        height,
        pixel_format,
        bytes,
      } => {
        let image = rgb_image_from_raw(*width, *height, *pixel_format, bytes).ok_or_else(|| {
          BackendError::Configuration(format!(
            "cannot encode {}x{} {:?} frame for upload",
            width, height, pixel_format
          ))
        })?;
        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY).encode_image(&image)?;
        debug!("原始帧编码为 JPEG: {} 字节", encoded.len());
        (encoded, "image/jpeg")
      }
    };

    Ok(Part::bytes(bytes).file_name(file_name).mime_str(mime)?)
  }

  fn meta(&self) -> Value {
    json!({
      "schema_version": META_SCHEMA_VERSION,
      "score_threshold": self.config.confidence_threshold,
      "iou_threshold": self.config.nms_iou,
      "input_resolution": self.config.input_resolution.as_array(),
    })
  }

  fn map_send_error(&self, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
      warn!("推理服务请求超时: {} ms", self.config.server_timeout_ms);
      BackendError::Timeout(self.config.server_timeout_ms)
    } else {
      BackendError::Network(err)
    }
  }
}

fn error_detail(payload: Option<&Value>) -> Option<String> {
  payload?
    .get("detail")?
    .as_str()
    .map(str::trim)
    .filter(|detail| !detail.is_empty())
    .map(str::to_string)
}

fn reported_timing(payload: &Value) -> Option<f64> {
  TIMING_KEYS
    .iter()
    .find_map(|key| payload.get(*key).and_then(Value::as_f64))
    .filter(|ms| ms.is_finite())
}

impl InferenceBackend for RemoteBackend {
  fn runtime(&self) -> RuntimeKind {
    RuntimeKind::Server
  }

  fn available(&mut self) -> bool {
    self.endpoint.is_some()
  }

  fn is_loaded(&self) -> bool {
    // 无状态，只要配置了地址就视为已加载
    self.endpoint.is_some()
  }

  fn load(&mut self) -> Result<(), BackendError> {
    Ok(())
  }

  fn unload(&mut self) -> Result<(), BackendError> {
    Ok(())
  }

  fn infer(&mut self, input: &InferenceInput) -> Result<BackendOutput, BackendError> {
    let endpoint = self
      .endpoint
      .as_ref()
      .ok_or_else(|| BackendError::Configuration("server endpoint is not configured".into()))?;
    let payload = match input {
      InferenceInput::Image(payload) => payload,
      InferenceInput::Tensor(_) => {
        return Err(BackendError::Configuration(
          "server runtime requires an image buffer, got a tensor".into(),
        ));
      }
    };

    let form = Form::new()
      .part("file", self.upload_part(payload)?)
      .part("meta", Part::text(self.meta().to_string()).mime_str("application/json")?);

    let url = endpoint.detect_url();
    debug!("发送推理请求: {}", url);
    let started = Instant::now();
    let response = endpoint
      .client
      .post(&url)
      .timeout(self.config.server_timeout())
      .multipart(form)
      .send()
      .map_err(|e| self.map_send_error(e))?;

    let status = response.status();
    let body = response.text().map_err(|e| self.map_send_error(e))?;
    let measured = as_millis_f64(started.elapsed());
    let payload: Option<Value> = serde_json::from_str(&body).ok();

    if !status.is_success() {
      let message = error_detail(payload.as_ref())
        .unwrap_or_else(|| format!("server inference failed with status {}", status.as_u16()));
      warn!("推理服务返回错误 {}: {}", status, message);
      return Err(BackendError::Server(message));
    }

    let payload = payload.ok_or_else(|| {
      BackendError::InvalidResponse(format!("response body is not JSON ({} bytes)", body.len()))
    })?;

    Ok(BackendOutput {
      predictions: RawPrediction::from_response(&payload),
      infer_ms: reported_timing(&payload).unwrap_or(measured),
    })
  }

  fn apply_config(&mut self, config: Arc<RuntimeConfig>) {
    self.config = config;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{PixelFormat, Rotation, Tensor, TensorLayout};
  use std::time::Duration;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn config(timeout_ms: u64) -> Arc<RuntimeConfig> {
    Arc::new(RuntimeConfig {
      server_timeout_ms: timeout_ms,
      ..RuntimeConfig::default()
    })
  }

  fn raw_input() -> InferenceInput {
    InferenceInput::Image(ImagePayload::Raw {
      width: 2,
      height: 2,
      pixel_format: PixelFormat::Rgb,
      bytes: vec![128; 12],
    })
  }

  /// 阻塞客户端必须在运行时之外创建和销毁
  async fn infer_blocking(
    base: String,
    timeout_ms: u64,
    input: InferenceInput,
  ) -> Result<BackendOutput, BackendError> {
    tokio::task::spawn_blocking(move || {
      let endpoint = RemoteEndpoint::from_url(&Url::parse(&base).unwrap())?;
      let mut backend = RemoteBackend::new(Some(endpoint), config(timeout_ms));
      backend.infer(&input)
    })
    .await
    .unwrap()
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_infer_posts_multipart_and_parses_predictions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/detect"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "predictions": [
          { "class": "person", "score": 0.91, "bbox": [1.0, 2.0, 30.0, 40.0] },
          { "bbox": [1, 2] }
        ],
        "infer_ms": 17.5
      })))
      .expect(1)
      .mount(&server)
      .await;

    let output = infer_blocking(server.uri(), 2_000, raw_input()).await.expect("infer");
    assert_eq!(output.predictions.len(), 2);
    assert_eq!(output.infer_ms, 17.5);

    let requests = server.received_requests().await.expect("recorded requests");
    let body = String::from_utf8_lossy(&requests[0].body).to_string();
    assert!(body.contains("name=\"file\""));
    assert!(body.contains("filename=\"frame-"));
    assert!(body.contains("image/jpeg"));
    assert!(body.contains("name=\"meta\""));
    assert!(body.contains("\"schema_version\":1"));
    assert!(body.contains("\"input_resolution\":[640,640]"));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_objects_field_and_measured_timing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/detect"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "objects": [{ "label": "cup", "confidence": 0.5, "box": [0, 0, 5, 5] }]
      })))
      .mount(&server)
      .await;

    let input = InferenceInput::Image(ImagePayload::Encoded {
      bytes: vec![0xff, 0xd8, 0xff],
      mime: "image/png".to_string(),
    });
    let output = infer_blocking(server.uri(), 2_000, input).await.expect("infer");
    assert_eq!(output.predictions.len(), 1);
    assert!(output.infer_ms >= 0.0);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_non_success_surfaces_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "detail": "Model is not loaded." })))
      .mount(&server)
      .await;

    let err = infer_blocking(server.uri(), 2_000, raw_input()).await.unwrap_err();
    assert!(matches!(&err, BackendError::Server(message) if message == "Model is not loaded."));
    assert!(err.is_transient());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_non_success_without_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
      .mount(&server)
      .await;

    let err = infer_blocking(server.uri(), 2_000, raw_input()).await.unwrap_err();
    assert!(
      matches!(&err, BackendError::Server(message) if message == "server inference failed with status 500")
    );
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_timeout_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({ "predictions": [] }))
          .set_delay(Duration::from_millis(800)),
      )
      .mount(&server)
      .await;

    let err = infer_blocking(server.uri(), 50, raw_input()).await.unwrap_err();
    assert!(matches!(err, BackendError::Timeout(50)));
    assert!(err.is_transient());
  }

  #[test]
  fn test_tensor_input_is_a_configuration_error() {
    let endpoint = RemoteEndpoint::from_url(&Url::parse("http://127.0.0.1:9").unwrap()).unwrap();
    let mut backend = RemoteBackend::new(Some(endpoint), config(350));
    let tensor = InferenceInput::Tensor(Tensor {
      data: vec![0.0; 3],
      shape: [1, 1, 1, 3],
      layout: TensorLayout::Nhwc,
      source_width: 1,
      source_height: 1,
      rotation: Rotation::Deg0,
      pixel_format: PixelFormat::Rgb,
    });

    let err = backend.infer(&tensor).unwrap_err();
    assert!(matches!(err, BackendError::Configuration(_)));
    assert!(!err.is_transient());
  }

  #[test]
  fn test_availability_and_endpoint() {
    let mut missing = RemoteBackend::new(None, config(350));
    assert!(!missing.available());
    assert!(matches!(
      missing.infer(&raw_input()),
      Err(BackendError::Configuration(_))
    ));

    assert!(RemoteEndpoint::from_url(&Url::parse("ftp://example.com").unwrap()).is_err());
    let endpoint = RemoteEndpoint::from_url(&Url::parse("http://example.com/api/").unwrap()).unwrap();
    assert_eq!(endpoint.detect_url(), "http://example.com/api/v1/detect");
  }
}
