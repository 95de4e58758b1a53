//! HTTP client for the embedding service (`GET /health`, `POST /register`).

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use rollcall_core::Embedding;
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::retry::RetryPolicy;
use crate::{EmbedError, Embedder};

/// Connection settings for the embedding service.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Bound on a single extraction request.
    pub timeout: Duration,
    /// Bound on a health probe.
    pub health_timeout: Duration,
    /// How long a successful probe is trusted.
    pub health_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".into(),
            timeout: Duration::from_secs(60),
            health_timeout: Duration::from_secs(5),
            health_ttl: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// The only accepted response shape; other fields are ignored.
#[derive(Deserialize)]
struct RegisterResponse {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    config: ClientConfig,
    /// When the service last answered a health probe successfully.
    last_healthy: Mutex<Option<Instant>>,
}

impl EmbeddingClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            last_healthy: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn register_once(&self, image: &[u8], subject: &str) -> Result<Embedding, EmbedError> {
        let part = Part::bytes(image.to_vec())
            .file_name("face.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| EmbedError::BadInput(e.to_string()))?;
        let form = Form::new()
            .part("image", part)
            .text("regNo", subject.to_string());

        let response = self
            .http
            .post(self.url("/register"))
            .multipart(form)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body, "embedding service returned an error");
            return Err(classify_status(status, &body));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, self.config.timeout))?;
        parse_register_response(&body)
    }

    fn cached_health(&self) -> bool {
        self.last_healthy
            .lock()
            .is_some_and(|at| at.elapsed() < self.config.health_ttl)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn extract_embedding(
        &self,
        image: &[u8],
        subject: &str,
    ) -> Result<Embedding, EmbedError> {
        if image.is_empty() {
            return Err(EmbedError::BadInput("empty image".into()));
        }

        let started = Instant::now();
        let embedding = self
            .config
            .retry
            .run(|attempt| {
                tracing::debug!(attempt, subject, bytes = image.len(), "requesting embedding");
                self.register_once(image, subject)
            })
            .await?;

        tracing::info!(
            subject,
            dim = embedding.dim(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding extracted"
        );
        Ok(embedding)
    }

    async fn is_healthy(&self) -> bool {
        if self.cached_health() {
            return true;
        }

        let healthy = match self
            .http
            .get(self.url("/health"))
            .timeout(self.config.health_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::warn!(error = %err, "embedding service health probe failed");
                false
            }
        };

        // Only successes are cached so a waking service is noticed promptly.
        *self.last_healthy.lock() = healthy.then(Instant::now);
        healthy
    }
}

fn classify_transport(err: &reqwest::Error, timeout: Duration) -> EmbedError {
    if err.is_timeout() {
        EmbedError::Timeout(format!("no response within {timeout:?}"))
    } else if err.is_decode() || err.is_body() {
        EmbedError::MalformedResponse(err.to_string())
    } else {
        EmbedError::ServiceUnavailable(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> EmbedError {
    if status == StatusCode::REQUEST_TIMEOUT {
        EmbedError::Timeout(format!("HTTP {status}"))
    } else if status.is_server_error() {
        EmbedError::ServiceUnavailable(format!("HTTP {status}"))
    } else if status.is_client_error() {
        EmbedError::BadInput(format!("HTTP {status}: {body}"))
    } else {
        EmbedError::MalformedResponse(format!("unexpected HTTP {status}"))
    }
}

fn parse_register_response(body: &[u8]) -> Result<Embedding, EmbedError> {
    let parsed: RegisterResponse = serde_json::from_slice(body)
        .map_err(|e| EmbedError::MalformedResponse(e.to_string()))?;
    Embedding::from_raw(parsed.embedding).ok_or(EmbedError::NoFaceDetected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(url: String) -> EmbeddingClient {
        EmbeddingClient::new(ClientConfig {
            base_url: url,
            timeout: Duration::from_secs(5),
            health_timeout: Duration::from_secs(1),
            health_ttl: Duration::from_secs(30),
            retry: RetryPolicy::new(2, vec![Duration::ZERO]),
        })
    }

    #[test]
    fn test_parse_normalizes() {
        let e = parse_register_response(br#"{"embedding":[3.0,4.0],"regNo":"21CS001"}"#).unwrap();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_parse_empty_or_zero_is_no_face() {
        assert_eq!(
            parse_register_response(br#"{"embedding":[],"message":"No face detected"}"#),
            Err(EmbedError::NoFaceDetected)
        );
        assert_eq!(
            parse_register_response(br#"{"embedding":[0.0,0.0]}"#),
            Err(EmbedError::NoFaceDetected)
        );
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for body in [
            &br#"{"data":{"embedding":[1.0]}}"#[..],
            br#"{"embedding":"1,2,3"}"#,
            br#"{"embedding":[1.0,null]}"#,
            b"<html>",
        ] {
            assert!(matches!(
                parse_register_response(body),
                Err(EmbedError::MalformedResponse(_))
            ));
        }
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_status(StatusCode::REQUEST_TIMEOUT, ""), EmbedError::Timeout(_)));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            EmbedError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            EmbedError::ServiceUnavailable(_)
        ));
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST, "bad"), EmbedError::BadInput(_)));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            EmbedError::BadInput(_)
        ));
    }

    #[tokio::test]
    async fn test_extract_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/register")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"regNo":"21CS001","embedding":[0.0,2.0,0.0],"message":"ok"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(server.url());
        let e = client.extract_embedding(b"jpeg-bytes", "21CS001").await.unwrap();
        assert_eq!(e.values, vec![0.0, 1.0, 0.0]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_extract_retries_5xx_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/register")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(server.url());
        let err = client.extract_embedding(b"jpeg-bytes", "scan").await.unwrap_err();
        assert!(matches!(err, EmbedError::ServiceUnavailable(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_extract_4xx_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/register")
            .with_status(400)
            .with_body("Invalid image file")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(server.url());
        let err = client.extract_embedding(b"jpeg-bytes", "scan").await.unwrap_err();
        assert!(matches!(err, EmbedError::BadInput(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_extract_408_is_timeout_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/register")
            .with_status(408)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(server.url());
        let err = client.extract_embedding(b"jpeg-bytes", "scan").await.unwrap_err();
        assert!(matches!(err, EmbedError::Timeout(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_silent_service_times_out_without_retry() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let client = EmbeddingClient::new(ClientConfig {
            base_url: format!("http://{addr}"),
            timeout: Duration::from_millis(200),
            health_timeout: Duration::from_millis(200),
            health_ttl: Duration::from_secs(30),
            retry: RetryPolicy::new(2, vec![Duration::ZERO]),
        });
        let err = client.extract_embedding(b"jpeg-bytes", "scan").await.unwrap_err();
        assert!(matches!(err, EmbedError::Timeout(_)), "got {err:?}");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extract_empty_image_skips_network() {
        let client = client_for("http://127.0.0.1:9".into());
        let err = client.extract_embedding(b"", "scan").await.unwrap_err();
        assert!(matches!(err, EmbedError::BadInput(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let client = client_for("http://127.0.0.1:9".into());
        let err = client.extract_embedding(b"jpeg-bytes", "scan").await.unwrap_err();
        assert!(matches!(err, EmbedError::ServiceUnavailable(_)));
        assert!(!client.is_healthy().await);
    }

    #[tokio::test]
    async fn test_health_success_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(server.url());
        assert!(client.is_healthy().await);
        assert!(client.is_healthy().await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_failure_is_not_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(server.url());
        assert!(!client.is_healthy().await);
        assert!(!client.is_healthy().await);
        mock.assert_async().await;
    }
}
