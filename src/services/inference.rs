use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Semaphore;

/// Longest candidate the pipeline will persist, in bytes.
pub const MAX_ALT_BYTES: usize = 1024;

/// Vision-language inference capability.
///
/// Produces `k` candidate alt strings for one image. Implementations must be
/// safe to call sequentially on one slot; thread safety is not required of
/// the backing model.
#[async_trait]
pub trait Inferencer: Send + Sync {
    async fn generate(
        &self,
        image: &[u8],
        context: &str,
        k: usize,
    ) -> Result<Vec<String>, InferenceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference backend out of GPU memory")]
    Oom,

    #[error("inference timed out")]
    Timeout,

    #[error("model produced undecodable output: {0}")]
    Decode(String),

    #[error("inference backend error: {0}")]
    Internal(String),
}

impl InferenceError {
    /// Transient failures go to the DLQ for budgeted re-drive; deterministic
    /// ones settle the task to FAILED on first sight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InferenceError::Oom | InferenceError::Timeout | InferenceError::Internal(_)
        )
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    description: String,
}

/// Client for a LLaVA serving endpoint.
///
/// Owns the process's single inference slot: a one-permit semaphore ensures
/// at most one in-flight generation per worker, which is what keeps the
/// 4-bit-quantized model inside its VRAM budget.
pub struct LlavaClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
    slot: Semaphore,
}

/// Decoding variants used to make the candidate pair observably different:
/// variant 1 asks for a full subject/action/background sentence at a lower
/// temperature, variant 2 for the shortest essential sentence at a higher one.
const VARIANTS: [(&str, f32); 2] = [
    (
        "Describe this image for web accessibility in ONE natural sentence \
         including subject, action or state, and background. Describe only \
         what is visually observable; use the context as a hint, never quote \
         it. Output only the sentence.",
        0.7,
    ),
    (
        "Describe this image for web accessibility in ONE sentence, as short \
         and essential as possible. Describe only what is visually \
         observable; use the context as a hint, never quote it. Output only \
         the sentence.",
        0.9,
    ),
];

impl LlavaClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Internal(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
            slot: Semaphore::new(1),
        })
    }

    /// Ping the serving endpoint so the model is resident before the first
    /// message is consumed. Failure is logged by the caller, not fatal.
    pub async fn warmup(&self) -> Result<(), InferenceError> {
        self.http
            .get(format!("{}/health", self.endpoint))
            .send()
            .await
            .map_err(classify_http_error)?
            .error_for_status()
            .map_err(classify_http_error)?;
        Ok(())
    }

    async fn generate_one(
        &self,
        image: &[u8],
        context: &str,
        variant: usize,
    ) -> Result<String, InferenceError> {
        let (instruction, temperature) = VARIANTS[variant % VARIANTS.len()];
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
            "prompt": format!(
                "{instruction}\nContext (supporting hint, do not quote): {context}"
            ),
            "temperature": temperature,
            "max_new_tokens": 60,
        });

        let request = self
            .http
            .post(format!("{}/generate", self.endpoint))
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| InferenceError::Timeout)?
            .map_err(classify_http_error)?;

        if response.status() == reqwest::StatusCode::INSUFFICIENT_STORAGE {
            return Err(InferenceError::Oom);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if text.to_ascii_lowercase().contains("out of memory") {
                return Err(InferenceError::Oom);
            }
            return Err(InferenceError::Internal(format!("{status}: {text}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;

        let tidied = tidy_candidate(&parsed.description);
        if tidied.is_empty() {
            return Err(InferenceError::Decode("empty candidate".to_string()));
        }
        Ok(tidied)
    }
}

#[async_trait]
impl Inferencer for LlavaClient {
    async fn generate(
        &self,
        image: &[u8],
        context: &str,
        k: usize,
    ) -> Result<Vec<String>, InferenceError> {
        let _permit = self
            .slot
            .acquire()
            .await
            .map_err(|_| InferenceError::Internal("inference slot closed".to_string()))?;

        let mut candidates = Vec::with_capacity(k);
        for variant in 0..k {
            candidates.push(self.generate_one(image, context, variant).await?);
        }
        Ok(candidates)
    }
}

fn classify_http_error(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout
    } else if err.is_decode() {
        InferenceError::Decode(err.to_string())
    } else {
        InferenceError::Internal(err.to_string())
    }
}

/// Flatten to one line, keep the first sentence, cap at [`MAX_ALT_BYTES`].
pub fn tidy_candidate(raw: &str) -> String {
    let mut text = raw.replace('\n', " ").trim().to_string();

    for sep in ['.', '!', '?'] {
        if let Some(pos) = text.find(sep) {
            text.truncate(pos + sep.len_utf8());
            break;
        }
    }

    if text.len() > MAX_ALT_BYTES {
        let mut cut = MAX_ALT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text.trim().to_string()
}
