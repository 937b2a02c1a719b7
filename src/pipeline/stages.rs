//! Stage handlers.
//!
//! Each stage is a narrow trait so the orchestrator never depends on how a
//! page is scraped or where an article ends up. The write stage is the only
//! one that talks to AI providers, and it does so exclusively through the
//! [`DispatchExecutor`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::dispatch::{DispatchExecutor, GenerationRequest, Message, TaskKind};
use crate::error::StageError;
use crate::scheduler::task::{Article, ContentItem, ScrapeRequest};

/// Finds content items at a source.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, request: &ScrapeRequest) -> Result<Vec<ContentItem>, StageError>;
}

/// Turns a content item into an article.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, item: &ContentItem) -> Result<Article, StageError>;
}

/// Delivers an article to its sink.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, article: &Article) -> Result<(), StageError>;
}

/// Scraper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub timeout_secs: u64,
    /// Maximum items taken from one page.
    pub max_items: usize,
    /// Links with shorter text are navigation, not content.
    pub min_title_chars: usize,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_items: 3,
            min_title_chars: 20,
        }
    }
}

/// Writer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Articles shorter than this are rejected and the stage retried.
    pub min_words: usize,
    /// Target length of each of the four sections.
    pub section_words: usize,
    /// Ask for a headline instead of reusing the scraped title.
    pub generate_headline: bool,
    /// Optional output language hint added to every prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            min_words: 800,
            section_words: 200,
            generate_headline: false,
            language: None,
        }
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Articles are POSTed here as JSON. Without it they are only logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Settings of the three stage handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub scraper: ScraperConfig,
    pub writer: WriterConfig,
    pub publisher: PublisherConfig,
}

/// Classifies an HTTP status from a scrape or publish target.
fn status_error(status: StatusCode, target: &str) -> StageError {
    let message = format!("{} returned {}", target, status);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        StageError::Retryable(message)
    } else {
        StageError::NonRetryable(message)
    }
}

fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("hive-forge/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Scrapes article links from an HTML page.
pub struct PageScraper {
    client: Client,
    config: ScraperConfig,
    anchor: Regex,
    tag: Regex,
}

impl PageScraper {
    pub fn new(config: ScraperConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http_client(Duration::from_secs(config.timeout_secs))?,
            config,
            anchor: pattern(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"'#]+)["'][^>]*>(.*?)</a>"#)?,
            tag: pattern(r"(?s)<[^>]*>")?,
        })
    }

    /// Extracts content items from `html` fetched at `base`.
    pub fn extract(&self, base: &Url, html: &str, query: Option<&str>) -> Vec<ContentItem> {
        let terms: Vec<String> = query
            .map(|q| q.split_whitespace().map(str::to_lowercase).collect())
            .unwrap_or_default();
        let mut items: Vec<ContentItem> = Vec::new();

        for cap in self.anchor.captures_iter(html) {
            let text = self.tag.replace_all(&cap[2], " ");
            let title = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if title.chars().count() < self.config.min_title_chars {
                continue;
            }
            let Ok(url) = base.join(&cap[1]) else {
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            let lowered = title.to_lowercase();
            if !terms.is_empty() && !terms.iter().any(|t| lowered.contains(t.as_str())) {
                continue;
            }
            if items.iter().any(|i| i.url == url.as_str()) {
                continue;
            }

            items.push(ContentItem {
                title,
                url: url.to_string(),
                source_type: "news".to_string(),
                summary: String::new(),
            });
            if items.len() >= self.config.max_items {
                break;
            }
        }

        items
    }
}

fn pattern(source: &str) -> Result<Regex, ConfigError> {
    Regex::new(source).map_err(|e| ConfigError::InvalidValue {
        key: "scraper pattern".to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl Scraper for PageScraper {
    async fn scrape(&self, request: &ScrapeRequest) -> Result<Vec<ContentItem>, StageError> {
        let base = Url::parse(&request.source_url)
            .map_err(|e| StageError::NonRetryable(format!("invalid source url: {}", e)))?;

        let response = self
            .client
            .get(base.clone())
            .send()
            .await
            .map_err(|e| StageError::Retryable(format!("fetching {}: {}", base, e)))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), base.as_str()));
        }
        let html = response
            .text()
            .await
            .map_err(|e| StageError::Retryable(format!("reading {}: {}", base, e)))?;

        let items = self.extract(&base, &html, request.query.as_deref());
        debug!(source = %base, items = items.len(), "Scraped source");
        Ok(items)
    }
}

const SECTIONS: [(&str, &str); 4] = [
    (
        "introduction",
        "Write an engaging introduction that opens with a short anecdote or an intriguing question.",
    ),
    (
        "explanation",
        "Explain the topic technically but in plain, conversational language for a general audience.",
    ),
    (
        "analysis",
        "Give an opinionated analysis of the topic backed by concrete examples.",
    ),
    (
        "conclusion",
        "Write a conclusion that sums up the key points and ends with a practical takeaway.",
    ),
];

/// Writes articles section by section through the dispatch layer.
pub struct DispatchWriter {
    executor: Arc<DispatchExecutor>,
    config: WriterConfig,
}

impl DispatchWriter {
    pub fn new(executor: Arc<DispatchExecutor>, config: WriterConfig) -> Self {
        Self { executor, config }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = "You are a human columnist. Write natural, varied prose without \
                          headings, lists or boilerplate phrases."
            .to_string();
        if let Some(language) = &self.config.language {
            prompt.push_str(&format!(" Write in {}.", language));
        }
        prompt
    }

    fn section_request(&self, instruction: &str, item: &ContentItem) -> GenerationRequest {
        let prompt = format!(
            "{} Aim for about {} words. Topic: {}{}",
            instruction,
            self.config.section_words,
            item.title,
            source_hint(item),
        );
        GenerationRequest::new(
            TaskKind::Write,
            vec![Message::system(self.system_prompt()), Message::user(prompt)],
        )
        .with_max_tokens(section_tokens(self.config.section_words))
    }

    async fn headline(&self, item: &ContentItem) -> Result<String, StageError> {
        let request = GenerationRequest::prompt(
            TaskKind::Headline,
            format!(
                "Write one catchy headline, under 90 characters, for an article about: {}. \
                 Reply with the headline only.",
                item.title
            ),
        )
        .with_max_tokens(40);
        let result = self.executor.execute(&request).await?;
        let headline = result.response.text.trim().trim_matches('"').trim().to_string();
        Ok(if headline.is_empty() {
            item.title.clone()
        } else {
            headline
        })
    }
}

fn source_hint(item: &ContentItem) -> String {
    if item.summary.is_empty() {
        format!(" (source: {})", item.url)
    } else {
        format!(" (source: {}; summary: {})", item.url, item.summary)
    }
}

fn section_tokens(words: usize) -> u32 {
    u32::try_from(words.saturating_mul(2)).unwrap_or(u32::MAX)
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[async_trait]
impl Writer for DispatchWriter {
    async fn write(&self, item: &ContentItem) -> Result<Article, StageError> {
        let mut sections = Vec::with_capacity(SECTIONS.len());
        let mut provider = None;

        for (name, instruction) in SECTIONS {
            let result = self
                .executor
                .execute(&self.section_request(instruction, item))
                .await?;
            debug!(
                section = name,
                provider = %result.provider,
                attempts = result.attempts.len(),
                "Section written"
            );
            sections.push(result.response.text.trim().to_string());
            provider.get_or_insert(result.provider);
        }

        let content = sections.join("\n\n");
        let words = word_count(&content);
        if words < self.config.min_words {
            return Err(StageError::Retryable(format!(
                "article too short: {} words, expected {}+",
                words, self.config.min_words
            )));
        }

        let title = if self.config.generate_headline {
            self.headline(item).await?
        } else {
            item.title.clone()
        };

        Ok(Article {
            title,
            content,
            source_url: item.url.clone(),
            source_type: item.source_type.clone(),
            provider,
        })
    }
}

/// URL-friendly slug of a title.
pub fn slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

#[derive(Serialize)]
struct PublishBody<'a> {
    title: &'a str,
    slug: String,
    content: &'a str,
    excerpt: String,
    source_url: &'a str,
    source_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<&'a str>,
}

impl<'a> PublishBody<'a> {
    fn new(article: &'a Article) -> Self {
        let excerpt: String = article.content.chars().take(150).collect();
        Self {
            title: &article.title,
            slug: slug(&article.title),
            content: &article.content,
            excerpt,
            source_url: &article.source_url,
            source_type: &article.source_type,
            provider: article.provider.as_deref(),
        }
    }
}

/// POSTs articles as JSON to a webhook.
pub struct WebhookPublisher {
    client: Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, article: &Article) -> Result<(), StageError> {
        let response = self
            .client
            .post(&self.url)
            .json(&PublishBody::new(article))
            .send()
            .await
            .map_err(|e| StageError::Retryable(format!("publishing to webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), "publish webhook"));
        }
        info!(title = %article.title, "Article published");
        Ok(())
    }
}

/// Publisher that only logs, used when no sink is configured.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, article: &Article) -> Result<(), StageError> {
        info!(
            title = %article.title,
            slug = %slug(&article.title),
            words = word_count(&article.content),
            source = %article.source_url,
            "Article ready (no publish sink configured)"
        );
        Ok(())
    }
}

/// Builds the configured publisher.
pub fn build_publisher(config: &PublisherConfig) -> Result<Arc<dyn Publisher>, reqwest::Error> {
    Ok(match &config.webhook_url {
        Some(url) => Arc::new(WebhookPublisher::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs.unwrap_or(30)),
        )?),
        None => Arc::new(LogPublisher),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::clock::system_clock;
    use crate::dispatch::{
        BreakerConfig, CircuitBreaker, Credential, CredentialPolicy, CredentialPool,
        DispatchConfig, GenerationResponse, Provider, ProviderAdapter, ProviderRouter,
        RateLimitScope, RateLimiter, RoutingStrategy,
    };
    use crate::error::ProviderError;

    struct Canned {
        replies: Mutex<VecDeque<String>>,
        kinds: Mutex<Vec<TaskKind>>,
    }

    #[async_trait]
    impl ProviderAdapter for Canned {
        async fn invoke(
            &self,
            _credential: &Credential,
            request: &GenerationRequest,
        ) -> Result<GenerationResponse, ProviderError> {
            self.kinds.lock().expect("lock").push(request.kind);
            let reply = self
                .replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| "word ".repeat(250));
            Ok(GenerationResponse::new(reply))
        }
    }

    fn writer(replies: Vec<String>, config: WriterConfig) -> (DispatchWriter, Arc<Canned>) {
        let clock = system_clock();
        let adapter = Arc::new(Canned {
            replies: Mutex::new(replies.into()),
            kinds: Mutex::new(Vec::new()),
        });
        let router = ProviderRouter::new(
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone())),
            Arc::new(RateLimiter::new(
                RateLimitScope::Provider,
                Default::default(),
                clock.clone(),
            )),
            Arc::new(CredentialPool::new(
                CredentialPolicy::default(),
                vec![Credential::new("groq", 0, "gsk-test")],
                clock.clone(),
            )),
            RoutingStrategy::Priority,
        );
        let executor = DispatchExecutor::new(
            Arc::new(router),
            vec![(
                Provider::new("groq", "https://api.groq.test", "llama"),
                adapter.clone() as Arc<dyn ProviderAdapter>,
            )],
            DispatchConfig::default(),
            clock,
        );
        (DispatchWriter::new(Arc::new(executor), config), adapter)
    }

    fn item() -> ContentItem {
        ContentItem {
            title: "Sliding windows in practice".to_string(),
            url: "https://example.com/windows".to_string(),
            source_type: "news".to_string(),
            summary: String::new(),
        }
    }

    #[test]
    fn test_extract_links() {
        let scraper = PageScraper::new(ScraperConfig::default()).expect("client");
        let base = Url::parse("https://news.example.com/tech/").expect("url");
        let html = r#"
            <a href="/">Home</a>
            <a href="/2026/rust-async">Why async <b>Rust</b> won the backend wars</a>
            <a href="https://other.example.org/ai">AI providers are rationing tokens again</a>
            <a href="mailto:x@example.com">Write to the editors of this fine site</a>
            <a href="/2026/rust-async">Why async Rust won the backend wars</a>
        "#;

        let items = scraper.extract(&base, html, None);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Why async Rust won the backend wars");
        assert_eq!(items[0].url, "https://news.example.com/2026/rust-async");

        let filtered = scraper.extract(&base, html, Some("tokens"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].url, "https://other.example.org/ai");
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("  Rust 2024: What's New? "), "rust-2024-whats-new");
        assert_eq!(slug("a -- b"), "a-b");
    }

    #[test]
    fn test_status_error_classification() {
        assert!(status_error(StatusCode::BAD_GATEWAY, "x").is_retryable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x").is_retryable());
        assert!(!status_error(StatusCode::NOT_FOUND, "x").is_retryable());
    }

    #[tokio::test]
    async fn test_writer_assembles_sections() {
        let (writer, adapter) = writer(Vec::new(), WriterConfig::default());
        let article = writer.write(&item()).await.expect("article");

        assert_eq!(article.title, "Sliding windows in practice");
        assert_eq!(article.content.split("\n\n").count(), 4);
        assert_eq!(article.provider.as_deref(), Some("groq"));
        assert_eq!(adapter.kinds.lock().expect("lock").len(), 4);
    }

    #[tokio::test]
    async fn test_short_article_is_retryable() {
        let short = vec!["too short".to_string(); 4];
        let (writer, _) = writer(short, WriterConfig::default());

        let err = writer.write(&item()).await.expect_err("too short");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("too short"));
    }

    #[tokio::test]
    async fn test_generated_headline() {
        let mut replies = vec!["word ".repeat(250); 4];
        replies.push("\"Windows That Slide\"".to_string());
        let config = WriterConfig {
            generate_headline: true,
            ..Default::default()
        };
        let (writer, adapter) = writer(replies, config);

        let article = writer.write(&item()).await.expect("article");
        assert_eq!(article.title, "Windows That Slide");
        assert_eq!(
            adapter.kinds.lock().expect("lock").last(),
            Some(&TaskKind::Headline)
        );
    }

    #[tokio::test]
    async fn test_log_publisher_accepts() {
        let publisher = build_publisher(&PublisherConfig::default()).expect("publisher");
        let article = Article {
            title: "t".to_string(),
            content: "c".to_string(),
            source_url: "https://example.com".to_string(),
            source_type: "news".to_string(),
            provider: None,
        };
        assert!(publisher.publish(&article).await.is_ok());
    }
}
