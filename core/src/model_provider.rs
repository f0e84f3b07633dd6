//! Model providers: the capability behind every explanation.
//!
//! A [`TextGenerator`] turns a prompt into text, either whole or as a
//! stream of chunks. A [`ModelProvider`] wraps one generator with the data
//! the orchestrator needs to build the fallback chain: name, tier,
//! priority and health.
//!
//! Health is updated by the orchestrator after each call. A failure puts
//! the provider in a cool-down window during which the chain skips it; the
//! first call after the window is a normal attempt.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{InferenceConfig, MAX_DURATION};

/// Default number of chunks a whole response is split into when a
/// generator has no native streaming.
pub const DEFAULT_STREAM_CHUNKS: usize = 10;

/// Why a provider call failed. Never escapes the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The model is not loaded or the endpoint is unreachable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The call exceeded its per-call timeout.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    /// The model returned an error or an unusable answer.
    #[error("provider call failed: {0}")]
    Failed(String),
}

/// Sampling parameters forwarded to every provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Generation budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling.
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&InferenceConfig::default())
    }
}

impl From<&InferenceConfig> for GenerationParams {
    fn from(cfg: &InferenceConfig) -> Self {
        Self {
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
        }
    }
}

/// Ordered, finite, non-restartable sequence of text chunks.
pub type ChunkStream = BoxStream<'static, Result<String, ProviderError>>;

/// Anything that can phrase an explanation.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generates the whole response.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, ProviderError>;

    /// Generates the response as a stream of chunks.
    ///
    /// The default generates the whole text and splits it into
    /// [`DEFAULT_STREAM_CHUNKS`] word-aligned pieces.
    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<ChunkStream, ProviderError> {
        let text = self.generate(prompt, params).await?;
        let chunks = split_chunks(&text, DEFAULT_STREAM_CHUNKS);
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// Splits `text` into at most `parts` word-aligned chunks whose
/// concatenation is exactly `text`.
#[must_use]
pub fn split_chunks(text: &str, parts: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_inclusive(char::is_whitespace).collect();
    if words.is_empty() {
        return Vec::new();
    }
    let per_chunk = words.len().div_ceil(parts.max(1));
    words.chunks(per_chunk).map(|group| group.concat()).collect()
}

/// Position of a provider in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderTier {
    /// The main local model.
    LocalPrimary,
    /// Secondary local models.
    LocalFallback,
    /// Remote model, tried after the whole local tier.
    Cloud,
}

impl ProviderTier {
    /// Label used in status reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LocalPrimary => "local-primary",
            Self::LocalFallback => "local-fallback",
            Self::Cloud => "cloud",
        }
    }

    /// `true` for the two local tiers.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        !matches!(self, Self::Cloud)
    }
}

impl fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct Health {
    unhealthy_until: Option<Instant>,
    consecutive_failures: u32,
    total_calls: u64,
    total_failures: u64,
    last_error: Option<String>,
}

/// Health report for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    /// Provider name.
    pub name: String,
    /// Tier.
    pub tier: ProviderTier,
    /// Priority; lower is tried first.
    pub priority: i32,
    /// `false` while in cool-down.
    pub healthy: bool,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Calls attempted.
    pub total_calls: u64,
    /// Calls failed.
    pub total_failures: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

/// A generator plus its place and health in the fallback chain.
pub struct ModelProvider {
    name: String,
    tier: ProviderTier,
    priority: i32,
    generator: Arc<dyn TextGenerator>,
    health: Mutex<Health>,
}

impl fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelProvider")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl ModelProvider {
    /// Wraps `generator`; starts healthy.
    pub fn new(
        name: impl Into<String>,
        tier: ProviderTier,
        priority: i32,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            name: name.into(),
            tier,
            priority,
            generator,
            health: Mutex::new(Health::default()),
        }
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider tier.
    #[must_use]
    pub const fn tier(&self) -> ProviderTier {
        self.tier
    }

    /// Priority; lower is tried first.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// The wrapped capability.
    #[must_use]
    pub fn generator(&self) -> &dyn TextGenerator {
        self.generator.as_ref()
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` unless inside a cool-down window at `now`.
    #[must_use]
    pub fn is_healthy_at(&self, now: Instant) -> bool {
        self.health().unhealthy_until.map_or(true, |until| now >= until)
    }

    /// [`ModelProvider::is_healthy_at`] for the current instant.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    /// Records a successful call.
    pub fn mark_success(&self) {
        let mut h = self.health();
        h.total_calls = h.total_calls.saturating_add(1);
        h.consecutive_failures = 0;
        h.unhealthy_until = None;
    }

    /// Records a failed call and starts a cool-down window.
    pub fn mark_failure(&self, error: &ProviderError, cooldown: Duration, now: Instant) {
        let mut h = self.health();
        h.total_calls = h.total_calls.saturating_add(1);
        h.total_failures = h.total_failures.saturating_add(1);
        h.consecutive_failures = h.consecutive_failures.saturating_add(1);
        h.unhealthy_until = Some(now + cooldown.min(MAX_DURATION));
        h.last_error = Some(error.to_string());
    }

    /// Current health report.
    #[must_use]
    pub fn status(&self) -> ProviderStatus {
        let now = Instant::now();
        let h = self.health();
        ProviderStatus {
            name: self.name.clone(),
            tier: self.tier,
            priority: self.priority,
            healthy: h.unhealthy_until.map_or(true, |until| now >= until),
            consecutive_failures: h.consecutive_failures,
            total_calls: h.total_calls,
            total_failures: h.total_failures,
            last_error: h.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    struct Fixed(&'static str);

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String, ProviderError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn split_chunks_preserves_text() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let chunks = split_chunks(text, 10);
        assert!(chunks.len() <= 10);
        assert_eq!(chunks.concat(), text);
        assert!(split_chunks("", 10).is_empty());
        assert_eq!(split_chunks("single", 10), vec!["single"]);
    }

    #[tokio::test]
    async fn default_stream_reassembles_whole_text() {
        let generator = Fixed("Great news! You can list this item.");
        let chunks: Vec<String> = generator
            .generate_stream("p", &GenerationParams::default())
            .await
            .expect("stream")
            .try_collect()
            .await
            .expect("chunks");
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), "Great news! You can list this item.");
    }

    #[test]
    fn failure_starts_cooldown() {
        let provider = ModelProvider::new("local", ProviderTier::LocalPrimary, 0, Arc::new(Fixed("x")));
        let t0 = Instant::now();
        assert!(provider.is_healthy_at(t0));

        provider.mark_failure(&ProviderError::Failed("boom".into()), Duration::from_secs(30), t0);
        assert!(!provider.is_healthy_at(t0 + Duration::from_secs(29)));
        assert!(provider.is_healthy_at(t0 + Duration::from_secs(30)));

        let status = provider.status();
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.last_error.as_deref(), Some("provider call failed: boom"));

        provider.mark_success();
        assert_eq!(provider.status().consecutive_failures, 0);
        assert!(provider.is_healthy_at(t0));
    }

    #[test]
    fn oversized_cooldown_is_clamped() {
        let provider = ModelProvider::new("local", ProviderTier::LocalPrimary, 0, Arc::new(Fixed("x")));
        let t0 = Instant::now();
        provider.mark_failure(&ProviderError::Failed("boom".into()), Duration::MAX, t0);
        assert!(!provider.is_healthy_at(t0 + MAX_DURATION - Duration::from_secs(1)));
        assert!(provider.is_healthy_at(t0 + MAX_DURATION));
    }

    #[test]
    fn tiers_order_local_before_cloud() {
        assert!(ProviderTier::LocalPrimary < ProviderTier::Cloud);
        assert!(ProviderTier::LocalFallback.is_local());
        assert!(!ProviderTier::Cloud.is_local());
        assert_eq!(ProviderTier::Cloud.to_string(), "cloud");
    }
}
