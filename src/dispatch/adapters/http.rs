//! HTTP adapter for hosted text-generation APIs.
//!
//! One adapter type covers the supported API flavors; each flavor only
//! differs in URL layout, authentication, request body and where the
//! generated text sits in the response. Every failure is classified into a
//! [`ProviderError`]; the adapter never retries on its own.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dispatch::provider::{
    Credential, GenerationRequest, GenerationResponse, ProviderAdapter,
};
use crate::error::ProviderError;

/// Longest error body kept in a classified error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Wire format spoken by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFlavor {
    /// `POST {endpoint}` with an OpenAI chat-completions body (Groq, OpenRouter, ...).
    #[default]
    OpenAiCompatible,
    /// Cohere v1 chat.
    Cohere,
    /// Hugging Face serverless inference, `POST {endpoint}/{model}`.
    HuggingFace,
    /// Google Gemini `generateContent`.
    Gemini,
}

/// reqwest-backed [`ProviderAdapter`].
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    client: Client,
    flavor: ApiFlavor,
    endpoint: String,
    model: String,
    timeout: Option<Duration>,
    default_max_tokens: Option<u32>,
    default_temperature: Option<f64>,
}

impl HttpAdapter {
    /// Creates an adapter for one provider endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (TLS backend
    /// initialisation failure).
    pub fn new(
        flavor: ApiFlavor,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("hive-forge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            flavor,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout: None,
            default_max_tokens: None,
            default_temperature: None,
        })
    }

    /// Overrides the executor's call timeout for this provider. The limit is
    /// also set on every HTTP request the adapter sends.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Generation parameters used when a request leaves them unset.
    pub fn with_defaults(mut self, max_tokens: Option<u32>, temperature: Option<f64>) -> Self {
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }

    /// Target URL for a call.
    pub fn url(&self) -> String {
        match self.flavor {
            ApiFlavor::OpenAiCompatible | ApiFlavor::Cohere => self.endpoint.clone(),
            ApiFlavor::HuggingFace => format!("{}/{}", self.endpoint, self.model),
            ApiFlavor::Gemini => format!("{}/{}:generateContent", self.endpoint, self.model),
        }
    }

    /// Request body in the provider's wire format.
    pub fn body(&self, request: &GenerationRequest) -> Value {
        let max_tokens = request.max_tokens.or(self.default_max_tokens);
        let temperature = request.temperature.or(self.default_temperature);

        let mut body = match self.flavor {
            ApiFlavor::OpenAiCompatible => json!({
                "model": self.model,
                "messages": request.messages,
            }),
            ApiFlavor::Cohere => json!({
                "model": self.model,
                "message": request.flattened_prompt(),
            }),
            ApiFlavor::HuggingFace => json!({
                "inputs": request.flattened_prompt(),
                "parameters": { "return_full_text": false },
            }),
            ApiFlavor::Gemini => json!({
                "contents": [{ "parts": [{ "text": request.flattened_prompt() }] }],
            }),
        };

        // Each flavor names the sampling parameters differently.
        let (target, tokens_key) = match self.flavor {
            ApiFlavor::OpenAiCompatible | ApiFlavor::Cohere => (&mut body, "max_tokens"),
            ApiFlavor::HuggingFace => (&mut body["parameters"], "max_new_tokens"),
            ApiFlavor::Gemini => {
                body["generationConfig"] = json!({});
                (&mut body["generationConfig"], "maxOutputTokens")
            }
        };
        if let Some(max_tokens) = max_tokens {
            target[tokens_key] = json!(max_tokens);
        }
        if let Some(temperature) = temperature {
            target["temperature"] = json!(temperature);
        }
        body
    }

    fn authorize(&self, builder: RequestBuilder, credential: &Credential) -> RequestBuilder {
        let key = credential.secret.expose();
        match self.flavor {
            ApiFlavor::Gemini => builder.header("x-goog-api-key", key),
            _ => builder.bearer_auth(key),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    async fn invoke(
        &self,
        credential: &Credential,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let builder = self
            .client
            .post(self.url())
            .header("Content-Type", "application/json")
            .json(&self.body(request));
        let mut builder = self.authorize(builder, credential);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                error_message(&body),
                retry_after,
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let text = extract_text(self.flavor, &body).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "no generated text in {:?} response",
                self.flavor
            ))
        })?;
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("empty generated text".to_string()));
        }

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(self.model.clone()));
        Ok(GenerationResponse { text, model })
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Maps a send failure. Only a request-level `timeout` can expire inside
/// reqwest; the executor's own limit surfaces from its timer instead.
fn classify_transport(err: &reqwest::Error, timeout: Option<Duration>) -> ProviderError {
    match timeout {
        Some(limit) if err.is_timeout() => ProviderError::Timeout(limit),
        _ => ProviderError::Transient(err.to_string()),
    }
}

/// Parses a delta-seconds `Retry-After` value. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Best human-readable message from an error body.
fn error_message(body: &str) -> String {
    let structured = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let message = structured.unwrap_or_else(|| body.to_string());
    message.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Generated text from a successful response body.
pub fn extract_text(flavor: ApiFlavor, body: &Value) -> Option<String> {
    let text = match flavor {
        ApiFlavor::OpenAiCompatible => body.pointer("/choices/0/message/content"),
        ApiFlavor::Cohere => body.get("text"),
        ApiFlavor::HuggingFace => body
            .pointer("/0/generated_text")
            .or_else(|| body.get("generated_text")),
        ApiFlavor::Gemini => body.pointer("/candidates/0/content/parts/0/text"),
    };
    text.and_then(Value::as_str).map(|s| s.trim().to_string())
}
