//! Provider, credential and request types shared by the dispatch layer.
//!
//! A [`Provider`] is static configuration; all mutable health state lives in
//! the credential pool, the rate limiter and the circuit breaker.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProviderError;

/// Kind of text-generation work a provider can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Article body generation.
    Write,
    /// Short headline generation.
    Headline,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::Write, TaskKind::Headline];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Write => "write",
            TaskKind::Headline => "headline",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external AI backend.
#[derive(Debug, Clone)]
pub struct Provider {
    /// Unique provider name.
    pub name: String,
    /// Base endpoint of the provider API.
    pub endpoint: String,
    /// Model requested from the provider.
    pub model: String,
    /// Lower values are tried first.
    pub priority: u32,
    /// Relative weight for weighted-random routing.
    pub weight: u32,
    /// Task kinds this provider can serve.
    pub capabilities: Vec<TaskKind>,
}

impl Provider {
    /// Creates a provider that serves every task kind.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            priority: 0,
            weight: 1,
            capabilities: TaskKind::ALL.to_vec(),
        }
    }

    /// Sets the routing priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the weighted-random weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Restricts the provider to the given task kinds.
    pub fn with_capabilities(mut self, capabilities: Vec<TaskKind>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Returns whether this provider can serve `kind`.
    pub fn supports(&self, kind: TaskKind) -> bool {
        self.capabilities.contains(&kind)
    }
}

/// An API key whose value never appears in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw key for building a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }

    /// Masked form showing only the first characters of the key.
    pub fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        if self.0.chars().count() <= 8 {
            "*".repeat(self.0.chars().count())
        } else {
            format!("{}...", prefix)
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.fingerprint())
    }
}

/// Stable identifier of a credential: provider name plus slot index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialId {
    pub provider: String,
    pub index: usize,
}

impl CredentialId {
    pub fn new(provider: impl Into<String>, index: usize) -> Self {
        Self {
            provider: provider.into(),
            index,
        }
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.provider, self.index)
    }
}

impl Serialize for CredentialId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CredentialId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let (provider, index) = raw
            .rsplit_once('#')
            .ok_or_else(|| serde::de::Error::custom("expected `provider#index`"))?;
        let index = index.parse().map_err(serde::de::Error::custom)?;
        Ok(Self::new(provider, index))
    }
}

/// A single API key bound to one provider.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: CredentialId,
    pub secret: Secret,
}

impl Credential {
    pub fn new(provider: impl Into<String>, index: usize, secret: impl Into<String>) -> Self {
        Self {
            id: CredentialId::new(provider, index),
            secret: Secret::new(secret),
        }
    }

    /// Name of the owning provider.
    pub fn provider(&self) -> &str {
        &self.id.provider
    }
}

/// A message in a generation prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender ("system", "user" or "assistant").
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Provider-neutral text-generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Which kind of work this is; drives candidate selection.
    pub kind: TaskKind,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(kind: TaskKind, messages: Vec<Message>) -> Self {
        Self {
            kind,
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Single user-message request.
    pub fn prompt(kind: TaskKind, prompt: impl Into<String>) -> Self {
        Self::new(kind, vec![Message::user(prompt)])
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// All message contents joined, for APIs that take a single prompt.
    pub fn flattened_prompt(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Text returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    /// Model reported by the provider, if any.
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerationResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }
}

/// Provider-specific network adapter.
///
/// Implementations translate the neutral request into the provider's wire
/// format and classify every failure into a [`ProviderError`]. Adapters must
/// not retry internally; retries are routing decisions.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Calls the provider with `credential`.
    async fn invoke(
        &self,
        credential: &Credential,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError>;

    /// Per-call timeout override; the executor default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}
