//! Compliance assistant core library.
//!
//! Answers natural-language compliance questions about marketplace
//! listings. The **decision** is always computed by deterministic rule
//! evaluation over an immutable policy snapshot; a language model is only
//! ever asked to phrase an explanation of a decision already made.
//!
//! - `extractor` turns question text into brands, products and countries;
//! - `policy_core` evaluates those entities against a `PolicySnapshot`;
//! - `response_cache` serves repeated questions without a model call;
//! - `orchestrator` arbitrates between local and cloud providers under a
//!   fixed concurrency limit, with load shedding and a template fallback;
//! - `conversation` keeps a bounded per-session history for prompts;
//! - `meta_observer` collects request metrics.
//!
//! [`ComplianceNode`] wires them into one process-wide pipeline.
//!
//! # Overview
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               ComplianceNode               │
//! │ ┌──────────────┐      ┌──────────────────┐ │
//! │ │  Extractor   │ ───▶ │  ResponseCache   │ │  fingerprint lookup
//! │ └──────────────┘      └──────────────────┘ │
//! │ ┌──────────────┐      ┌──────────────────┐ │
//! │ │ PolicyStore  │ ───▶ │   PolicyCore     │ │  deterministic decision
//! │ └──────────────┘      └──────────────────┘ │
//! │ ┌──────────────────────────────────────┐   │
//! │ │ InferenceOrchestrator                │   │  admission + fallback
//! │ │   local-primary ▶ local-fallback ▶   │   │
//! │ │   cloud ▶ template                   │   │
//! │ └──────────────────────────────────────┘   │
//! │ ┌──────────────┐      ┌──────────────────┐ │
//! │ │ Conversation │      │  MetaObserver    │ │  context + metrics
//! │ └──────────────┘      └──────────────────┘ │
//! └────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

/// Per-call admission pool with queue bound and load shedding.
pub mod admission;
/// Service configuration (YAML + environment overrides).
pub mod config;
/// Bounded per-session conversation history.
pub mod conversation;
/// Error types surfaced by the node.
pub mod error;
/// Entity and intent extraction from question text.
pub mod extractor;
/// Request metrics and Prometheus rendering.
pub mod meta_observer;
/// Provider capability, health and tiers.
pub mod model_provider;
/// The process-wide request pipeline.
pub mod node;
/// Explanation orchestration across the provider chain.
pub mod orchestrator;
/// Deterministic policy decision engine.
pub mod policy_core;
/// Versioned policy snapshots and uploads.
pub mod policy_store;
/// Prompt construction and template explanations.
pub mod prompt;
/// Fingerprint-keyed LRU cache with TTL.
pub mod response_cache;
/// Text folding and phrase matching.
pub mod text;

pub use config::ServiceConfig;
pub use error::{ComplianceError, OverloadReason};
pub use extractor::{Entities, Locale};
pub use model_provider::{GenerationParams, ModelProvider, ProviderError, ProviderTier, TextGenerator};
pub use node::{AskRequest, AskResponse, AskStream, AskStreamEvent, ComplianceNode};
pub use orchestrator::ExplanationSource;
pub use policy_core::{Decision, DecisionStatus};
pub use policy_store::{PolicyDocument, PolicyRule, PolicySnapshot, PolicyStore};
pub use prompt::Role;
