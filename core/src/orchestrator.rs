//! Inference Orchestrator.
//!
//! Phrases an explanation for a decision that is already final.
//!
//! # Fallback chain
//!
//! Providers are tried in ascending priority: every local provider first,
//! then cloud providers when cloud fallback is enabled. Providers in
//! cool-down are skipped. A call that errors, returns nothing or exceeds
//! the per-call timeout marks its provider unhealthy and the chain moves
//! on. When the chain is exhausted the explanation is the deterministic
//! template built from the decision's reason.
//!
//! # Admission
//!
//! Every explanation holds one [`AdmissionPermit`] for the whole time any
//! provider is being called. For streams the permit lives inside the
//! producer task and is dropped as soon as the consumer goes away.
//!
//! # Streaming
//!
//! [`InferenceOrchestrator::explain_stream`] returns a finite stream of
//! [`ExplanationEvent::Chunk`] followed by exactly one
//! [`ExplanationEvent::Completed`]. If a provider fails before its first
//! chunk the next provider is tried; if it fails after chunks were
//! delivered, the stream completes with the partial text, which is not
//! cached.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::{duration_to_ms, AdmissionController, AdmissionPermit, AdmissionStats};
use crate::config::InferenceConfig;
use crate::conversation::Turn;
use crate::error::ComplianceError;
use crate::extractor::Entities;
use crate::model_provider::{
    split_chunks, GenerationParams, ModelProvider, ProviderError, ProviderStatus, DEFAULT_STREAM_CHUNKS,
};
use crate::policy_core::Decision;
use crate::prompt::{build_prompt, template_explanation, Role};
use crate::response_cache::{Fingerprint, ResponseCache};

const STREAM_BUFFER: usize = 16;

/// Where an explanation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationSource {
    /// A model provider phrased it.
    Provider,
    /// Served from the response cache.
    Cache,
    /// Deterministic template.
    Template,
    /// Fixed reply to an empty question.
    EmptyQuestion,
}

impl ExplanationSource {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Cache => "cache",
            Self::Template => "template",
            Self::EmptyQuestion => "empty_question",
        }
    }
}

/// A finished explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Explanation {
    /// Explanation text.
    pub text: String,
    /// Where it came from.
    pub source: ExplanationSource,
    /// Name of the provider that produced it, if any.
    pub provider: Option<String>,
    /// `true` if the provider failed mid-stream and `text` is incomplete.
    pub partial: bool,
}

impl Explanation {
    fn template(decision: &Decision, entities: &Entities) -> Self {
        Self {
            text: template_explanation(decision, entities),
            source: ExplanationSource::Template,
            provider: None,
            partial: false,
        }
    }
}

/// Everything needed to phrase one explanation.
#[derive(Debug, Clone)]
pub struct ExplainRequest {
    /// Question as asked.
    pub question: String,
    /// Asker's role; selects the tone.
    pub role: Role,
    /// The final decision.
    pub decision: Decision,
    /// Entities extracted from the question.
    pub entities: Entities,
    /// Recent session turns, oldest first.
    pub history: Vec<Turn>,
    /// Cache key for the finished explanation; `None` skips caching.
    pub fingerprint: Option<Fingerprint>,
}

/// One item of an explanation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplanationEvent {
    /// Next piece of text.
    Chunk(String),
    /// Final event; carries the assembled explanation.
    Completed(Explanation),
}

/// Stream of [`ExplanationEvent`]s. Dropping it cancels the provider call.
pub type ExplanationStream = BoxStream<'static, ExplanationEvent>;

/// Orchestrator status for `status()` and health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    /// Admission pool snapshot.
    pub admission: AdmissionStats,
    /// Providers in chain order.
    pub providers: Vec<ProviderStatus>,
    /// Whether cloud providers are part of the chain.
    pub cloud_fallback: bool,
}

/// Arbitrates explanation requests across the provider chain.
#[derive(Debug)]
pub struct InferenceOrchestrator {
    providers: Vec<Arc<ModelProvider>>,
    admission: AdmissionController,
    cache: Arc<ResponseCache>,
    params: GenerationParams,
    provider_timeout: Duration,
    cooldown: Duration,
    use_cloud_fallback: bool,
}

impl InferenceOrchestrator {
    /// Builds an orchestrator over `providers`, in any order.
    #[must_use]
    pub fn new(mut providers: Vec<Arc<ModelProvider>>, cache: Arc<ResponseCache>, config: &InferenceConfig) -> Self {
        providers.sort_by_key(|p| (!p.tier().is_local(), p.priority()));
        Self {
            providers,
            admission: AdmissionController::from_config(config),
            cache,
            params: GenerationParams::from(config),
            provider_timeout: config.provider_timeout(),
            cooldown: config.provider_cooldown(),
            use_cloud_fallback: config.use_cloud_fallback,
        }
    }

    /// Providers that take part in the chain, in order.
    fn chain(&self) -> impl Iterator<Item = &Arc<ModelProvider>> {
        self.providers
            .iter()
            .filter(move |p| p.tier().is_local() || self.use_cloud_fallback)
    }

    fn record_failure(&self, provider: &ModelProvider, error: &ProviderError) {
        warn!(provider = provider.name(), tier = %provider.tier(), error = %error, "provider call failed");
        provider.mark_failure(error, self.cooldown, Instant::now());
    }

    fn store(&self, fingerprint: Option<&Fingerprint>, decision: &Decision, text: &str) {
        if let Some(fp) = fingerprint {
            self.cache
                .put(fp.clone(), decision.clone(), text.to_string(), self.cache.default_ttl());
        }
    }

    /// Whole-response explanation.
    ///
    /// # Errors
    ///
    /// Only capacity errors from admission control. Provider failures end
    /// in the template explanation instead.
    pub async fn explain(&self, request: &ExplainRequest) -> Result<Explanation, ComplianceError> {
        let permit = self.admission.acquire().await?;
        let prompt = build_prompt(
            &request.question,
            &request.decision,
            &request.entities,
            request.role,
            &request.history,
        );

        for provider in self.chain() {
            if !provider.is_healthy() {
                debug!(provider = provider.name(), "skipping provider in cool-down");
                continue;
            }
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.provider_timeout, provider.generator().generate(&prompt, &self.params))
                .await
                .unwrap_or(Err(ProviderError::Timeout(self.provider_timeout)));
            match outcome {
                Ok(text) if !text.trim().is_empty() => {
                    provider.mark_success();
                    drop(permit);
                    info!(
                        provider = provider.name(),
                        latency_ms = duration_to_ms(started.elapsed()),
                        "explanation generated"
                    );
                    self.store(request.fingerprint.as_ref(), &request.decision, &text);
                    return Ok(Explanation {
                        text,
                        source: ExplanationSource::Provider,
                        provider: Some(provider.name().to_string()),
                        partial: false,
                    });
                }
                Ok(_) => self.record_failure(provider, &ProviderError::Failed("empty response".into())),
                Err(error) => self.record_failure(provider, &error),
            }
        }

        drop(permit);
        warn!("provider chain exhausted; using template explanation");
        Ok(Explanation::template(&request.decision, &request.entities))
    }

    /// Streamed explanation.
    ///
    /// Admission happens before this returns, so capacity errors surface
    /// here rather than inside the stream.
    ///
    /// # Errors
    ///
    /// Only capacity errors from admission control.
    pub async fn explain_stream(self: &Arc<Self>, request: ExplainRequest) -> Result<ExplanationStream, ComplianceError> {
        let permit = self.admission.acquire().await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.produce_stream(request, permit, tx).await;
        });
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }

    async fn produce_stream(&self, request: ExplainRequest, permit: AdmissionPermit, tx: mpsc::Sender<ExplanationEvent>) {
        let prompt = build_prompt(
            &request.question,
            &request.decision,
            &request.entities,
            request.role,
            &request.history,
        );

        for provider in self.chain() {
            if !provider.is_healthy() {
                debug!(provider = provider.name(), "skipping provider in cool-down");
                continue;
            }

            let opened = until_closed(
                &tx,
                tokio::time::timeout(self.provider_timeout, provider.generator().generate_stream(&prompt, &self.params)),
            )
            .await;
            let mut chunks = match opened {
                None => {
                    debug!("stream consumer went away before the provider answered");
                    return;
                }
                Some(Ok(Ok(chunks))) => chunks,
                Some(Ok(Err(error))) => {
                    self.record_failure(provider, &error);
                    continue;
                }
                Some(Err(_elapsed)) => {
                    self.record_failure(provider, &ProviderError::Timeout(self.provider_timeout));
                    continue;
                }
            };

            let mut delivered = String::new();
            loop {
                let next = match until_closed(&tx, tokio::time::timeout(self.provider_timeout, chunks.next())).await {
                    None => {
                        debug!(provider = provider.name(), "stream cancelled by consumer");
                        return;
                    }
                    Some(Ok(item)) => item,
                    Some(Err(_elapsed)) => Some(Err(ProviderError::Timeout(self.provider_timeout))),
                };
                match next {
                    Some(Ok(chunk)) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        delivered.push_str(&chunk);
                        if tx.send(ExplanationEvent::Chunk(chunk)).await.is_err() {
                            return;
                        }
                    }
                    None if delivered.trim().is_empty() => {
                        self.record_failure(provider, &ProviderError::Failed("empty stream".into()));
                        break;
                    }
                    None => {
                        provider.mark_success();
                        drop(permit);
                        self.store(request.fingerprint.as_ref(), &request.decision, &delivered);
                        let _ = tx
                            .send(ExplanationEvent::Completed(Explanation {
                                text: delivered,
                                source: ExplanationSource::Provider,
                                provider: Some(provider.name().to_string()),
                                partial: false,
                            }))
                            .await;
                        return;
                    }
                    Some(Err(error)) => {
                        self.record_failure(provider, &error);
                        if delivered.is_empty() {
                            break;
                        }
                        drop(permit);
                        warn!(provider = provider.name(), "stream ended early; returning partial explanation");
                        let _ = tx
                            .send(ExplanationEvent::Completed(Explanation {
                                text: delivered,
                                source: ExplanationSource::Provider,
                                provider: Some(provider.name().to_string()),
                                partial: true,
                            }))
                            .await;
                        return;
                    }
                }
            }
        }

        drop(permit);
        warn!("provider chain exhausted; streaming template explanation");
        let explanation = Explanation::template(&request.decision, &request.entities);
        for chunk in split_chunks(&explanation.text, DEFAULT_STREAM_CHUNKS) {
            if tx.send(ExplanationEvent::Chunk(chunk)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(ExplanationEvent::Completed(explanation)).await;
    }

    /// Stops admitting new explanation requests.
    pub fn shutdown(&self) {
        self.admission.close();
        info!("inference orchestrator closed");
    }

    /// `true` once [`InferenceOrchestrator::shutdown`] ran.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.admission.is_closed()
    }

    /// `true` if at least one local provider is outside its cool-down.
    #[must_use]
    pub fn has_healthy_local(&self) -> bool {
        self.providers.iter().any(|p| p.tier().is_local() && p.is_healthy())
    }

    /// `true` if cloud fallback is enabled and a cloud provider is healthy.
    #[must_use]
    pub fn cloud_available(&self) -> bool {
        self.use_cloud_fallback && self.providers.iter().any(|p| !p.tier().is_local() && p.is_healthy())
    }

    /// Admission pool snapshot.
    #[must_use]
    pub fn admission_stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    /// Full status report.
    #[must_use]
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            admission: self.admission.stats(),
            providers: self.providers.iter().map(|p| p.status()).collect(),
            cloud_fallback: self.use_cloud_fallback,
        }
    }
}

/// Runs `fut` unless the stream consumer goes away first.
async fn until_closed<F: Future>(tx: &mpsc::Sender<ExplanationEvent>, fut: F) -> Option<F::Output> {
    tokio::select! {
        () = tx.closed() => None,
        out = fut => Some(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_provider::{ChunkStream, ProviderTier, TextGenerator};
    use crate::policy_core::DecisionStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Scripted {
        reply: Option<&'static str>,
        fail_after_chunks: Option<usize>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply
                .map(str::to_string)
                .ok_or_else(|| ProviderError::Unavailable("model not loaded".into()))
        }

        async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<ChunkStream, ProviderError> {
            let Some(limit) = self.fail_after_chunks else {
                let text = self.generate(prompt, params).await?;
                return Ok(stream::iter(split_chunks(&text, 4).into_iter().map(Ok)).boxed());
            };
            self.calls.fetch_add(1, Ordering::SeqCst);
            let good = (0..limit).map(|i| Ok(format!("part{i} ")));
            let bad = std::iter::once(Err(ProviderError::Failed("connection reset".into())));
            Ok(stream::iter(good.chain(bad)).boxed())
        }
    }

    fn provider(name: &str, tier: ProviderTier, priority: i32, generator: Arc<Scripted>) -> Arc<ModelProvider> {
        Arc::new(ModelProvider::new(name, tier, priority, generator))
    }

    fn request(fingerprint: Option<Fingerprint>) -> ExplainRequest {
        let decision = Decision {
            status: DecisionStatus::Restricted,
            matched_rules: Vec::new(),
            reason: "Brand 'Nike' is restricted in NG. Authorization required".into(),
            snapshot_version: 1,
        };
        ExplainRequest {
            question: "Can I sell Nike shoes in Nigeria?".into(),
            role: Role::Seller,
            decision,
            entities: Entities::default(),
            history: Vec::new(),
            fingerprint,
        }
    }

    fn config() -> InferenceConfig {
        InferenceConfig {
            provider_timeout_secs: 1,
            ..InferenceConfig::default()
        }
    }

    fn cache() -> Arc<ResponseCache> {
        Arc::new(ResponseCache::new(16, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn falls_back_in_priority_order() {
        let broken = Arc::new(Scripted::default());
        let backup = Arc::new(Scripted {
            reply: Some("backup answer"),
            ..Scripted::default()
        });
        let orch = InferenceOrchestrator::new(
            vec![
                provider("backup", ProviderTier::LocalFallback, 2, Arc::clone(&backup)),
                provider("primary", ProviderTier::LocalPrimary, 1, Arc::clone(&broken)),
            ],
            cache(),
            &config(),
        );

        let out = orch.explain(&request(None)).await.expect("explanation");
        assert_eq!(out.text, "backup answer");
        assert_eq!(out.provider.as_deref(), Some("backup"));
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);

        // primary is cooling down and is skipped
        orch.explain(&request(None)).await.expect("explanation");
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 2);
        assert!(!orch.status().providers[0].healthy);
    }

    #[tokio::test]
    async fn cloud_is_skipped_when_disabled() {
        let cloud = Arc::new(Scripted {
            reply: Some("cloud answer"),
            ..Scripted::default()
        });
        let orch = InferenceOrchestrator::new(
            vec![provider("cloud", ProviderTier::Cloud, 0, Arc::clone(&cloud))],
            cache(),
            &InferenceConfig {
                use_cloud_fallback: false,
                ..config()
            },
        );
        let out = orch.explain(&request(None)).await.expect("explanation");
        assert_eq!(out.source, ExplanationSource::Template);
        assert!(out.text.starts_with("This item has some restrictions."));
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_provider_times_out_to_next() {
        let slow = Arc::new(Scripted {
            reply: Some("too late"),
            delay: Duration::from_secs(5),
            ..Scripted::default()
        });
        let cloud = Arc::new(Scripted {
            reply: Some("cloud answer"),
            ..Scripted::default()
        });
        let orch = InferenceOrchestrator::new(
            vec![
                provider("slow", ProviderTier::LocalPrimary, 0, slow),
                provider("cloud", ProviderTier::Cloud, 0, cloud),
            ],
            cache(),
            &config(),
        );
        let out = orch.explain(&request(None)).await.expect("explanation");
        assert_eq!(out.provider.as_deref(), Some("cloud"));
        let slow_status = &orch.status().providers[0];
        assert!(slow_status.last_error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn provider_answers_are_cached() {
        let cache = cache();
        let local = Arc::new(Scripted {
            reply: Some("cached answer"),
            ..Scripted::default()
        });
        let orch = InferenceOrchestrator::new(
            vec![provider("local", ProviderTier::LocalPrimary, 0, local)],
            Arc::clone(&cache),
            &config(),
        );
        let fp = Fingerprint::compute("can i sell nike", "seller", crate::extractor::Locale::En, 1);
        orch.explain(&request(Some(fp.clone()))).await.expect("explanation");
        assert_eq!(cache.get(&fp).map(|e| e.explanation), Some("cached answer".into()));
    }

    #[tokio::test]
    async fn stream_delivers_chunks_then_completion() {
        let local = Arc::new(Scripted {
            reply: Some("You can list it with authorization."),
            ..Scripted::default()
        });
        let orch = Arc::new(InferenceOrchestrator::new(
            vec![provider("local", ProviderTier::LocalPrimary, 0, local)],
            cache(),
            &config(),
        ));
        let events: Vec<ExplanationEvent> = orch.explain_stream(request(None)).await.expect("stream").collect().await;
        let (last, chunks) = events.split_last().expect("events");
        let text: String = chunks
            .iter()
            .map(|e| match e {
                ExplanationEvent::Chunk(c) => c.as_str(),
                ExplanationEvent::Completed(_) => "",
            })
            .collect();
        assert_eq!(text, "You can list it with authorization.");
        assert!(matches!(last, ExplanationEvent::Completed(e) if !e.partial && e.text == text));
        assert_eq!(orch.admission_stats().active, 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_returns_partial_text_uncached() {
        let cache = cache();
        let flaky = Arc::new(Scripted {
            fail_after_chunks: Some(2),
            ..Scripted::default()
        });
        let orch = Arc::new(InferenceOrchestrator::new(
            vec![provider("flaky", ProviderTier::LocalPrimary, 0, flaky)],
            Arc::clone(&cache),
            &config(),
        ));
        let fp = Fingerprint::compute("q", "seller", crate::extractor::Locale::En, 1);
        let events: Vec<ExplanationEvent> = orch
            .explain_stream(request(Some(fp.clone())))
            .await
            .expect("stream")
            .collect()
            .await;
        match events.last() {
            Some(ExplanationEvent::Completed(e)) => {
                assert!(e.partial);
                assert_eq!(e.text, "part0 part1 ");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(cache.get(&fp).is_none());
    }

    #[tokio::test]
    async fn failure_before_first_chunk_falls_through() {
        let flaky = Arc::new(Scripted {
            fail_after_chunks: Some(0),
            ..Scripted::default()
        });
        let backup = Arc::new(Scripted {
            reply: Some("backup"),
            ..Scripted::default()
        });
        let orch = Arc::new(InferenceOrchestrator::new(
            vec![
                provider("flaky", ProviderTier::LocalPrimary, 0, flaky),
                provider("backup", ProviderTier::LocalFallback, 1, backup),
            ],
            cache(),
            &config(),
        ));
        let events: Vec<ExplanationEvent> = orch.explain_stream(request(None)).await.expect("stream").collect().await;
        assert!(matches!(
            events.last(),
            Some(ExplanationEvent::Completed(e)) if e.provider.as_deref() == Some("backup") && !e.partial
        ));
    }

    #[tokio::test]
    async fn dropping_stream_releases_permit() {
        let slow = Arc::new(Scripted {
            reply: Some("eventually"),
            delay: Duration::from_millis(500),
            ..Scripted::default()
        });
        let orch = Arc::new(InferenceOrchestrator::new(
            vec![provider("slow", ProviderTier::LocalPrimary, 0, slow)],
            cache(),
            &config(),
        ));
        let stream = orch.explain_stream(request(None)).await.expect("stream");
        assert_eq!(orch.admission_stats().active, 1);
        drop(stream);
        for _ in 0..100 {
            if orch.admission_stats().active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(orch.admission_stats().active, 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let orch = InferenceOrchestrator::new(Vec::new(), cache(), &config());
        orch.shutdown();
        assert!(orch.is_shut_down());
        assert!(matches!(
            orch.explain(&request(None)).await,
            Err(ComplianceError::ShuttingDown { .. })
        ));
    }
}
