//! The compliance node: one process-wide instance of the request pipeline.
//!
//! ```text
//! question ─▶ extract ─▶ fingerprint ─▶ cache hit? ──yes──▶ cached answer
//!                                          │ no
//!                                          ▼
//!                               evaluate (deterministic)
//!                                          ▼
//!                         orchestrator: admission + provider chain
//!                                          ▼
//!                          cache write, session append, metrics
//! ```
//!
//! The node owns every piece of shared state (policy store, response
//! cache, sessions, metrics). It is built once at startup, reset through
//! explicit admin calls and torn down by [`ComplianceNode::shutdown`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::conversation::ConversationManager;
use crate::error::ComplianceError;
use crate::extractor::{extract, Entities, Locale};
use crate::meta_observer::{render_prometheus, Gauges, MetaObserver, MetricsSnapshot};
use crate::model_provider::ModelProvider;
use crate::orchestrator::{
    ExplainRequest, Explanation, ExplanationEvent, ExplanationSource, InferenceOrchestrator, OrchestratorStatus,
};
use crate::policy_core::{evaluate, Decision};
use crate::policy_store::{PolicyDocument, PolicySnapshot, PolicyStats, PolicyStore, UploadCounts};
use crate::prompt::{Role, EMPTY_QUESTION_REPLY};
use crate::response_cache::{CacheStats, Fingerprint, ResponseCache};

const SERVICE_NAME: &str = "compliance-assistant";

fn default_session() -> String {
    "default".to_string()
}

fn default_role() -> String {
    Role::Seller.as_str().to_string()
}

/// One compliance question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskRequest {
    /// Free-text question.
    pub question: String,
    /// Conversation to attach the turn to.
    #[serde(default = "default_session")]
    pub session_id: String,
    /// `seller`, `admin` or `legal`; anything else is treated as `seller`.
    #[serde(default = "default_role")]
    pub role: String,
    /// Locale tag such as `fr-FR`; the configured default when absent.
    #[serde(default)]
    pub locale: Option<String>,
}

impl AskRequest {
    /// Question in the default session, asked as a seller.
    #[must_use]
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: default_session(),
            role: default_role(),
            locale: None,
        }
    }

    /// Same request in another session.
    #[must_use]
    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Same request with another role.
    #[must_use]
    pub fn as_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Same request with an explicit locale.
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Whole-response answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AskResponse {
    /// The deterministic decision.
    pub decision: Decision,
    /// Copy of `decision.reason`.
    pub reason: String,
    /// Explanation text.
    pub explanation: String,
    /// Entities detected in the question.
    pub entities: Entities,
    /// Where the explanation came from.
    pub explanation_source: ExplanationSource,
    /// `true` when served from the response cache.
    pub cached: bool,
}

/// Event of a streamed answer. Serializes as a JSON object tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AskStreamEvent {
    /// Always first.
    Decision {
        /// The deterministic decision.
        decision: Decision,
        /// Entities detected in the question.
        entities: Entities,
        /// `true` when served from the response cache.
        cached: bool,
    },
    /// A piece of the explanation.
    Content {
        /// Text to append.
        chunk: String,
    },
    /// Always last.
    Done {
        /// Where the explanation came from.
        explanation_source: ExplanationSource,
        /// `true` if the provider failed mid-stream.
        partial: bool,
    },
}

/// Streamed answer.
pub type AskStream = BoxStream<'static, AskStreamEvent>;

/// Result of a policy upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Version of the newly published snapshot.
    pub snapshot_version: u64,
    /// Rows loaded per sheet provided.
    pub counts: UploadCounts,
}

/// Liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    /// Always `healthy` while the process answers.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Crate version.
    pub version: &'static str,
}

/// Per-component readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthComponents {
    /// A local provider is outside its cool-down.
    pub model_loaded: bool,
    /// Cloud fallback is enabled and a cloud provider is healthy.
    pub cloud_fallback_available: bool,
    /// Response cache is active.
    pub cache_enabled: bool,
    /// Current policy snapshot version.
    pub snapshot_version: u64,
    /// Admission load level.
    pub load_level: String,
}

/// Readiness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailedHealth {
    /// `healthy`, or `degraded` when no provider can answer, the node is
    /// shedding load or shutting down.
    pub status: &'static str,
    /// Component details.
    pub components: HealthComponents,
}

/// Node-wide status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    /// Instance id, fixed for the process lifetime.
    pub node_id: String,
    /// Seconds since construction.
    pub uptime_secs: u64,
    /// Current policy snapshot version.
    pub snapshot_version: u64,
    /// Rule counts of the current snapshot.
    pub policy: PolicyStats,
    /// Admission pool and provider chain.
    pub orchestrator: OrchestratorStatus,
    /// Response cache counters.
    pub cache: CacheStats,
    /// Live conversation sessions.
    pub sessions: usize,
    /// Whether `ask_stream` streams provider output.
    pub streaming_enabled: bool,
}

// Everything a request needs after extraction.
struct Prepared {
    question: String,
    session_id: String,
    role: Role,
    snapshot: Arc<PolicySnapshot>,
    entities: Entities,
    fingerprint: Fingerprint,
}

/// Process-wide compliance pipeline.
#[derive(Debug)]
pub struct ComplianceNode {
    id: Uuid,
    config: ServiceConfig,
    policies: PolicyStore,
    cache: Arc<ResponseCache>,
    conversations: Arc<ConversationManager>,
    orchestrator: Arc<InferenceOrchestrator>,
    observer: Arc<Mutex<MetaObserver>>,
    started: Instant,
}

impl ComplianceNode {
    /// Builds a node over an existing policy store and provider chain.
    #[must_use]
    pub fn new(config: ServiceConfig, policies: PolicyStore, providers: Vec<Arc<ModelProvider>>) -> Self {
        let cache = Arc::new(ResponseCache::from_config(&config.cache));
        let orchestrator = Arc::new(InferenceOrchestrator::new(providers, Arc::clone(&cache), &config.inference));
        let id = Uuid::new_v4();
        info!(
            node_id = %id,
            snapshot_version = policies.current().version(),
            max_concurrent = config.inference.max_concurrent_requests,
            cache_enabled = config.cache.enabled,
            "compliance node ready"
        );
        Self {
            id,
            conversations: Arc::new(ConversationManager::from_config(&config.conversation)),
            config,
            policies,
            cache,
            orchestrator,
            observer: Arc::new(Mutex::new(MetaObserver::new())),
            started: Instant::now(),
        }
    }

    /// Builds a node from configuration, loading `policy_path` if set.
    ///
    /// # Errors
    ///
    /// Unreadable or invalid policy file.
    pub fn bootstrap(config: ServiceConfig, providers: Vec<Arc<ModelProvider>>) -> Result<Self> {
        let policies = match &config.policy_path {
            Some(path) => Self::load_policies(path)?,
            None => {
                warn!("no policy file configured; starting with empty rule tables");
                PolicyStore::default()
            }
        };
        Ok(Self::new(config, policies, providers))
    }

    fn load_policies(path: &Path) -> Result<PolicyStore> {
        let doc = PolicyDocument::load(path)?;
        PolicyStore::from_document(&doc).with_context(|| format!("Invalid policy file {}", path.display()))
    }

    fn observer(&self) -> MutexGuard<'_, MetaObserver> {
        self.observer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prepare(&self, request: AskRequest) -> Prepared {
        let locale = request
            .locale
            .as_deref()
            .map_or(self.config.default_locale, Locale::parse);
        let role = Role::parse(&request.role);
        let snapshot = self.policies.current();
        let entities = extract(&request.question, locale, &snapshot);
        let fingerprint = Fingerprint::compute(&entities.text.key, role.as_str(), locale, snapshot.version());
        Prepared {
            question: request.question,
            session_id: request.session_id,
            role,
            snapshot,
            entities,
            fingerprint,
        }
    }

    fn explain_request(&self, prepared: &Prepared, decision: &Decision) -> ExplainRequest {
        ExplainRequest {
            question: prepared.question.clone(),
            role: prepared.role,
            decision: decision.clone(),
            entities: prepared.entities.clone(),
            history: self
                .conversations
                .recent(&prepared.session_id, self.config.conversation.context_turns),
            fingerprint: Some(prepared.fingerprint.clone()),
        }
    }

    /// Answers one question with a whole explanation.
    ///
    /// # Errors
    ///
    /// [`ComplianceError::Overloaded`] or [`ComplianceError::ShuttingDown`]
    /// when the explanation step could not be admitted. Both carry the
    /// decision, which is final regardless.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse, ComplianceError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask", %request_id, session = %request.session_id);
        self.ask_inner(request).instrument(span).await
    }

    async fn ask_inner(&self, request: AskRequest) -> Result<AskResponse, ComplianceError> {
        let started = Instant::now();
        let prepared = self.prepare(request);

        if prepared.entities.text.is_empty() {
            let decision = Decision::allowed(prepared.snapshot.version());
            self.observer()
                .observe_request(decision.status, ExplanationSource::EmptyQuestion, started.elapsed());
            return Ok(AskResponse {
                reason: decision.reason.clone(),
                decision,
                explanation: EMPTY_QUESTION_REPLY.to_string(),
                entities: prepared.entities,
                explanation_source: ExplanationSource::EmptyQuestion,
                cached: false,
            });
        }

        if let Some(hit) = self.cache.get(&prepared.fingerprint) {
            info!(
                fingerprint = %prepared.fingerprint,
                snapshot_version = hit.decision.snapshot_version,
                status = %hit.decision.status,
                "served from cache"
            );
            self.conversations
                .append(&prepared.session_id, &prepared.question, &hit.decision, &hit.explanation);
            self.observer()
                .observe_request(hit.decision.status, ExplanationSource::Cache, started.elapsed());
            return Ok(AskResponse {
                reason: hit.decision.reason.clone(),
                decision: hit.decision,
                explanation: hit.explanation,
                entities: prepared.entities,
                explanation_source: ExplanationSource::Cache,
                cached: true,
            });
        }

        let decision = evaluate(&prepared.entities, &prepared.snapshot);
        info!(
            snapshot_version = decision.snapshot_version,
            status = %decision.status,
            matched = decision.matched_rules.len(),
            "decision computed"
        );

        let explanation = match self.orchestrator.explain(&self.explain_request(&prepared, &decision)).await {
            Ok(explanation) => explanation,
            Err(err) => {
                warn!(error = %err, "explanation not admitted; returning decision only");
                self.observer().observe_failure(&err, started.elapsed());
                return Err(err.with_decision(decision));
            }
        };

        self.conversations
            .append(&prepared.session_id, &prepared.question, &decision, &explanation.text);
        self.observer()
            .observe_request(decision.status, explanation.source, started.elapsed());
        info!(
            source = explanation.source.as_str(),
            provider = explanation.provider.as_deref().unwrap_or("-"),
            latency_ms = started.elapsed().as_millis(),
            "answer ready"
        );

        Ok(AskResponse {
            reason: decision.reason.clone(),
            decision,
            explanation: explanation.text,
            entities: prepared.entities,
            explanation_source: explanation.source,
            cached: false,
        })
    }

    /// Answers one question as a stream: a `decision` event, `content`
    /// chunks, then `done`. Dropping the stream cancels the provider call.
    ///
    /// # Errors
    ///
    /// Same capacity errors as [`ComplianceNode::ask`], raised before the
    /// stream starts.
    pub async fn ask_stream(&self, request: AskRequest) -> Result<AskStream, ComplianceError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask_stream", %request_id, session = %request.session_id);
        self.ask_stream_inner(request).instrument(span).await
    }

    async fn ask_stream_inner(&self, request: AskRequest) -> Result<AskStream, ComplianceError> {
        let started = Instant::now();
        let prepared = self.prepare(request);

        if prepared.entities.text.is_empty() {
            let decision = Decision::allowed(prepared.snapshot.version());
            self.observer()
                .observe_request(decision.status, ExplanationSource::EmptyQuestion, started.elapsed());
            return Ok(whole_answer(
                decision,
                prepared.entities,
                EMPTY_QUESTION_REPLY.to_string(),
                ExplanationSource::EmptyQuestion,
            ));
        }

        if let Some(hit) = self.cache.get(&prepared.fingerprint) {
            info!(fingerprint = %prepared.fingerprint, status = %hit.decision.status, "served from cache");
            self.conversations
                .append(&prepared.session_id, &prepared.question, &hit.decision, &hit.explanation);
            self.observer()
                .observe_request(hit.decision.status, ExplanationSource::Cache, started.elapsed());
            return Ok(whole_answer(hit.decision, prepared.entities, hit.explanation, ExplanationSource::Cache));
        }

        let decision = evaluate(&prepared.entities, &prepared.snapshot);
        info!(
            snapshot_version = decision.snapshot_version,
            status = %decision.status,
            "decision computed"
        );
        let explain = self.explain_request(&prepared, &decision);

        if !self.config.inference.streaming_enabled {
            let explanation = match self.orchestrator.explain(&explain).await {
                Ok(explanation) => explanation,
                Err(err) => {
                    self.observer().observe_failure(&err, started.elapsed());
                    return Err(err.with_decision(decision));
                }
            };
            self.conversations
                .append(&prepared.session_id, &prepared.question, &decision, &explanation.text);
            self.observer()
                .observe_request(decision.status, explanation.source, started.elapsed());
            return Ok(whole_answer(decision, prepared.entities, explanation.text, explanation.source));
        }

        let events = match self.orchestrator.explain_stream(explain).await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "explanation stream not admitted; returning decision only");
                self.observer().observe_failure(&err, started.elapsed());
                return Err(err.with_decision(decision));
            }
        };

        let head = AskStreamEvent::Decision {
            decision: decision.clone(),
            entities: prepared.entities,
            cached: false,
        };
        let conversations = Arc::clone(&self.conversations);
        let observer = Arc::clone(&self.observer);
        let Prepared {
            question, session_id, ..
        } = prepared;
        let tail = events.map(move |event| match event {
            ExplanationEvent::Chunk(chunk) => AskStreamEvent::Content { chunk },
            ExplanationEvent::Completed(Explanation {
                text, source, partial, ..
            }) => {
                conversations.append(&session_id, &question, &decision, &text);
                observer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .observe_request(decision.status, source, started.elapsed());
                info!(source = source.as_str(), partial, "stream completed");
                AskStreamEvent::Done {
                    explanation_source: source,
                    partial,
                }
            }
        });
        Ok(stream::once(async move { head }).chain(tail).boxed())
    }

    /// Parses and publishes an uploaded policy file, then drops every
    /// cached answer.
    ///
    /// # Errors
    ///
    /// Unsupported extension, unparseable body or a row failing
    /// validation. The current snapshot stays in place.
    pub fn upload_policy(&self, filename: &str, contents: &[u8]) -> Result<UploadReport, ComplianceError> {
        let doc = PolicyDocument::parse(filename, contents)?;
        self.publish_policy(&doc)
    }

    /// Publishes an already-parsed policy document.
    ///
    /// # Errors
    ///
    /// A row failing validation; the current snapshot stays in place.
    pub fn publish_policy(&self, doc: &PolicyDocument) -> Result<UploadReport, ComplianceError> {
        let (snapshot, counts) = self.policies.publish(doc)?;
        self.cache.invalidate_all();
        info!(snapshot_version = snapshot.version(), "policy uploaded; response cache cleared");
        Ok(UploadReport {
            snapshot_version: snapshot.version(),
            counts,
        })
    }

    /// Rule counts of the current snapshot.
    #[must_use]
    pub fn policy_stats(&self) -> PolicyStats {
        self.policies.current().stats()
    }

    /// Current policy snapshot version.
    #[must_use]
    pub fn snapshot_version(&self) -> u64 {
        self.policies.current().version()
    }

    /// Drops every cached answer. Returns how many were dropped.
    pub fn clear_cache(&self) -> usize {
        let dropped = self.cache.size();
        self.cache.invalidate_all();
        info!(dropped, "response cache cleared by admin");
        dropped
    }

    /// Forgets one conversation. Returns `true` if it existed.
    pub fn clear_session(&self, session_id: &str) -> bool {
        self.conversations.clear(session_id)
    }

    /// Liveness check.
    #[must_use]
    pub const fn health(&self) -> Health {
        Health {
            status: "healthy",
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Readiness check.
    #[must_use]
    pub fn health_detailed(&self) -> DetailedHealth {
        let load_level = self.orchestrator.admission_stats().load_level;
        let components = HealthComponents {
            model_loaded: self.orchestrator.has_healthy_local(),
            cloud_fallback_available: self.orchestrator.cloud_available(),
            cache_enabled: self.cache.is_enabled(),
            snapshot_version: self.snapshot_version(),
            load_level: load_level.to_string(),
        };
        let ready = (components.model_loaded || components.cloud_fallback_available)
            && load_level.admits()
            && !self.orchestrator.is_shut_down();
        DetailedHealth {
            status: if ready { "healthy" } else { "degraded" },
            components,
        }
    }

    /// Full status report.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let snapshot = self.policies.current();
        NodeStatus {
            node_id: self.id.to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            snapshot_version: snapshot.version(),
            policy: snapshot.stats(),
            orchestrator: self.orchestrator.status(),
            cache: self.cache.stats(),
            sessions: self.conversations.session_count(),
            streaming_enabled: self.config.inference.streaming_enabled,
        }
    }

    /// Metric snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.observer().snapshot()
    }

    /// Metrics in the Prometheus text format, gauges included.
    #[must_use]
    pub fn metrics_prometheus(&self) -> String {
        let admission = self.orchestrator.admission_stats();
        let cache = self.cache.stats();
        let gauges = Gauges {
            active_requests: admission.active,
            queue_depth: admission.queue_depth,
            cache_size: cache.size,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            model_loaded: self.orchestrator.has_healthy_local(),
            snapshot_version: self.snapshot_version(),
        };
        render_prometheus(&self.metrics(), &gauges)
    }

    /// Zeroes request metrics.
    pub fn reset_metrics(&self) {
        self.observer().reset();
    }

    /// Stops admitting explanation work and drops cached state. Requests
    /// already holding a slot finish normally.
    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
        self.cache.invalidate_all();
        self.conversations.clear_all();
        info!(node_id = %self.id, "compliance node shut down");
    }
}

fn whole_answer(decision: Decision, entities: Entities, text: String, source: ExplanationSource) -> AskStream {
    let cached = source == ExplanationSource::Cache;
    stream::iter([
        AskStreamEvent::Decision {
            decision,
            entities,
            cached,
        },
        AskStreamEvent::Content { chunk: text },
        AskStreamEvent::Done {
            explanation_source: source,
            partial: false,
        },
    ])
    .boxed()
}
