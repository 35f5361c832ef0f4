//! HTTP client for a remote model inference gateway.
//!
//! Speaks plain JSON over HTTP to the fleet endpoint named in
//! `endpoints.model_gateway`:
//!
//! - `POST /v1/models/{model}/opinions` with the opinion request; the
//!   response body is the model's raw opinion document
//! - `POST /v1/embeddings` with `{"text": ...}`; responds
//!   `{"vector": [...]}`
//! - `GET /health` for probes
//!
//! The underlying connector and client are lazily initialized once and
//! reused for every request; per-call deadlines are owned by the calling
//! stage.

use std::sync::OnceLock;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;

use claimguard_core::gateway::{BoxFuture, GatewayError, ModelGateway, OpinionRequest};

/// Response body cap, to bound memory per call.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

type PlainHttpClient = Client<HttpConnector, Full<Bytes>>;

/// Remote model gateway client.
pub struct HttpModelGateway {
    base_url: String,
    client: OnceLock<PlainHttpClient>,
}

impl std::fmt::Debug for HttpModelGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpModelGateway")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    vector: Vec<f32>,
}

impl HttpModelGateway {
    /// Creates a client for the given base URL.
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &PlainHttpClient {
        self.client
            .get_or_init(|| Client::builder(TokioExecutor::new()).build(HttpConnector::new()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Bytes, GatewayError> {
        let unavailable = |message: String| GatewayError::Unavailable { message };

        let request = http::Request::builder()
            .method(method)
            .uri(self.url(path))
            .header("Content-Type", "application/json")
            .header("User-Agent", "claimguard-daemon/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| unavailable(format!("request build failed: {e}")))?;

        let response = self
            .client()
            .request(request)
            .await
            .map_err(|e| unavailable(format!("gateway request failed: {e}")))?;

        let status = response.status();
        let collected = Limited::new(response.into_body(), MAX_RESPONSE_BYTES)
            .collect()
            .await
            .map_err(|e| unavailable(format!("gateway response read failed: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(unavailable(format!(
                "gateway returned {status} for {path}"
            )));
        }
        Ok(collected)
    }
}

impl ModelGateway for HttpModelGateway {
    fn opine<'a>(
        &'a self,
        model_id: &'a str,
        request: &'a OpinionRequest,
    ) -> BoxFuture<'a, Result<String, GatewayError>> {
        Box::pin(async move {
            let body = serde_json::to_vec(request).map_err(|e| GatewayError::Rejected {
                model_id: model_id.to_string(),
                message: format!("request serialization failed: {e}"),
            })?;
            let path = format!("/v1/models/{model_id}/opinions");
            let raw = self.request("POST", &path, body).await?;
            String::from_utf8(raw.to_vec()).map_err(|e| GatewayError::Rejected {
                model_id: model_id.to_string(),
                message: format!("non-UTF-8 response: {e}"),
            })
        })
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, GatewayError>> {
        Box::pin(async move {
            let body = serde_json::json!({ "text": text }).to_string().into_bytes();
            let raw = self.request("POST", "/v1/embeddings", body).await?;
            let parsed: EmbeddingResponse =
                serde_json::from_slice(&raw).map_err(|e| GatewayError::Unavailable {
                    message: format!("malformed embedding response: {e}"),
                })?;
            Ok(parsed.vector)
        })
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), GatewayError>> {
        Box::pin(async move {
            self.request("GET", "/health", Vec::new()).await?;
            Ok(())
        })
    }
}
