//! Configuration for a compliance node.
//!
//! Settings come from an optional YAML file and are then overlaid by
//! environment variables. Every variable also accepts a `COMPLIANCE_`
//! prefixed alias, which takes precedence over the bare name:
//!
//! | Variable                    | Default | Meaning                                 |
//! |-----------------------------|---------|-----------------------------------------|
//! | `MAX_CONCURRENT_REQUESTS`   | 5       | admission pool size                     |
//! | `REQUEST_TIMEOUT_SECONDS`   | 60      | max wait for a pool slot                |
//! | `OVERLOAD_THRESHOLD`        | 80      | queue depth at which requests are shed  |
//! | `PROVIDER_TIMEOUT_SECONDS`  | 30      | per-call provider timeout               |
//! | `PROVIDER_COOLDOWN_SECONDS` | 30      | how long a failed provider is skipped   |
//! | `USE_CLOUD_FALLBACK`        | true    | try the cloud tier after local models   |
//! | `STREAMING_ENABLED`         | true    | stream explanations chunk by chunk      |
//! | `LLM_CACHE_ENABLED`         | true    | response cache on/off                   |
//! | `LLM_CACHE_TTL`             | 60      | cache entry lifetime, minutes           |
//! | `LLM_CACHE_CAPACITY`        | 1000    | max cache entries                       |
//! | `MAX_TOKENS`                | 300     | generation budget                       |
//! | `TEMPERATURE`               | 0.7     | sampling temperature                    |
//! | `TOP_P`                     | 0.9     | nucleus sampling                        |
//! | `SESSION_MAX_TURNS`         | 10      | turns kept per session                  |
//! | `SESSION_IDLE_SECONDS`      | 1800    | idle time before a session is evicted   |
//! | `SESSION_CONTEXT_TURNS`     | 3       | turns passed to the prompt              |
//! | `DEFAULT_LOCALE`            | en      | locale when a request names none        |
//! | `POLICY_PATH`               | unset   | policy document loaded at startup       |
//!
//! Booleans accept `1`, `true`, `yes`, `on` (case-insensitive) as true and
//! anything else as false. Malformed numbers and zero sizes are errors.
//! Every duration is capped at [`MAX_DURATION`].

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::extractor::Locale;

/// Longest timeout, cool-down, TTL or idle window accepted (30 days).
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Admission control, fallback chain and generation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Admission pool size.
    pub max_concurrent_requests: usize,
    /// How long a request may wait for a pool slot, seconds.
    pub request_timeout_secs: u64,
    /// Queue depth at which new requests are shed immediately.
    pub overload_threshold: usize,
    /// Timeout for a single provider call, seconds.
    pub provider_timeout_secs: u64,
    /// Cool-down after a provider failure, seconds.
    pub provider_cooldown_secs: u64,
    /// Whether the cloud tier is tried after local providers.
    pub use_cloud_fallback: bool,
    /// Whether `ask_stream` streams chunk by chunk.
    pub streaming_enabled: bool,
    /// Generation budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling.
    pub top_p: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            request_timeout_secs: 60,
            overload_threshold: 80,
            provider_timeout_secs: 30,
            provider_cooldown_secs: 30,
            use_cloud_fallback: true,
            streaming_enabled: true,
            max_tokens: 300,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

impl InferenceConfig {
    /// Max wait for a pool slot.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Per-call provider timeout.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Provider cool-down window.
    #[must_use]
    pub const fn provider_cooldown(&self) -> Duration {
        Duration::from_secs(self.provider_cooldown_secs)
    }
}

/// Response cache knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache on/off.
    pub enabled: bool,
    /// Entry lifetime, minutes.
    pub ttl_minutes: u64,
    /// Max entries.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_minutes: 60,
            capacity: 1_000,
        }
    }
}

impl CacheConfig {
    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }
}

/// Conversation window knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Turns kept per session; oldest dropped first.
    pub max_turns: usize,
    /// Idle time before a session is evicted, seconds.
    pub idle_secs: u64,
    /// Turns included in explanation prompts.
    pub context_turns: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            idle_secs: 1_800,
            context_turns: 3,
        }
    }
}

impl ConversationConfig {
    /// Idle eviction window.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Orchestrator and admission settings.
    pub inference: InferenceConfig,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Conversation window settings.
    pub conversation: ConversationConfig,
    /// Locale used when a request does not name one.
    pub default_locale: Locale,
    /// Policy document loaded at startup.
    pub policy_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            cache: CacheConfig::default(),
            conversation: ConversationConfig::default(),
            default_locale: Locale::En,
            policy_path: None,
        }
    }
}

impl ServiceConfig {
    /// Parses a YAML document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// YAML syntax/type errors and any [`ServiceConfig::validate`] failure.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(raw).context("Invalid YAML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overlaid by the process environment.
    ///
    /// # Errors
    ///
    /// Malformed or zero values.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid by an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Malformed or zero values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_overrides(&lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads `path` as YAML (if given) and overlays the process environment.
    ///
    /// # Errors
    ///
    /// IO, parse and validation errors, with the file path in context.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Unable to read config file {}", p.display()))?;
                Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_overrides(&|key: &str| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies environment-style overrides on top of the current values.
    ///
    /// # Errors
    ///
    /// Malformed numbers, naming the variable.
    pub fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        let inf = &mut self.inference;
        set_parsed(lookup, "MAX_CONCURRENT_REQUESTS", &mut inf.max_concurrent_requests)?;
        set_parsed(lookup, "REQUEST_TIMEOUT_SECONDS", &mut inf.request_timeout_secs)?;
        set_parsed(lookup, "OVERLOAD_THRESHOLD", &mut inf.overload_threshold)?;
        set_parsed(lookup, "PROVIDER_TIMEOUT_SECONDS", &mut inf.provider_timeout_secs)?;
        set_parsed(lookup, "PROVIDER_COOLDOWN_SECONDS", &mut inf.provider_cooldown_secs)?;
        set_bool(lookup, "USE_CLOUD_FALLBACK", &mut inf.use_cloud_fallback);
        set_bool(lookup, "STREAMING_ENABLED", &mut inf.streaming_enabled);
        set_parsed(lookup, "MAX_TOKENS", &mut inf.max_tokens)?;
        set_parsed(lookup, "TEMPERATURE", &mut inf.temperature)?;
        set_parsed(lookup, "TOP_P", &mut inf.top_p)?;

        set_bool(lookup, "LLM_CACHE_ENABLED", &mut self.cache.enabled);
        set_parsed(lookup, "LLM_CACHE_TTL", &mut self.cache.ttl_minutes)?;
        set_parsed(lookup, "LLM_CACHE_CAPACITY", &mut self.cache.capacity)?;

        set_parsed(lookup, "SESSION_MAX_TURNS", &mut self.conversation.max_turns)?;
        set_parsed(lookup, "SESSION_IDLE_SECONDS", &mut self.conversation.idle_secs)?;
        set_parsed(lookup, "SESSION_CONTEXT_TURNS", &mut self.conversation.context_turns)?;

        if let Some(raw) = first_env(lookup, "DEFAULT_LOCALE") {
            self.default_locale = Locale::parse(&raw);
        }
        if let Some(raw) = first_env(lookup, "POLICY_PATH") {
            let trimmed = raw.trim();
            self.policy_path = (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
        }
        Ok(())
    }

    /// Rejects sizes and timeouts that would make the node unusable.
    ///
    /// # Errors
    ///
    /// The first offending field.
    pub fn validate(&self) -> Result<()> {
        let inf = &self.inference;
        let positive = [
            ("max_concurrent_requests", inf.max_concurrent_requests as u64),
            ("request_timeout_secs", inf.request_timeout_secs),
            ("overload_threshold", inf.overload_threshold as u64),
            ("provider_timeout_secs", inf.provider_timeout_secs),
            ("max_tokens", u64::from(inf.max_tokens)),
            ("cache.capacity", self.cache.capacity as u64),
            ("cache.ttl_minutes", self.cache.ttl_minutes),
            ("conversation.max_turns", self.conversation.max_turns as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0, got {value}"));
            }
        }
        let durations = [
            ("request_timeout_secs", inf.request_timeout()),
            ("provider_timeout_secs", inf.provider_timeout()),
            ("provider_cooldown_secs", inf.provider_cooldown()),
            ("cache.ttl_minutes", self.cache.ttl()),
            ("conversation.idle_secs", self.conversation.idle_timeout()),
        ];
        for (name, value) in durations {
            if value > MAX_DURATION {
                return Err(anyhow!(
                    "{name} must not exceed {} seconds, got {} seconds",
                    MAX_DURATION.as_secs(),
                    value.as_secs()
                ));
            }
        }
        if !(0.0..=2.0).contains(&inf.temperature) {
            return Err(anyhow!("temperature must be within 0.0..=2.0, got {}", inf.temperature));
        }
        if !(0.0..=1.0).contains(&inf.top_p) || inf.top_p == 0.0 {
            return Err(anyhow!("top_p must be within (0.0, 1.0], got {}", inf.top_p));
        }
        Ok(())
    }
}

/// Returns `COMPLIANCE_<name>` if set, else `<name>`.
fn first_env(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(&format!("COMPLIANCE_{name}")).or_else(|| lookup(name))
}

fn set_parsed<T>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = first_env(lookup, name) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {name}: {raw}"))?;
    }
    Ok(())
}

fn set_bool(lookup: &dyn Fn(&str) -> Option<String>, name: &str, slot: &mut bool) {
    if let Some(raw) = first_env(lookup, name) {
        *slot = parse_bool(&raw);
    }
}

/// Parses a loose boolean value.
///
/// `"1"`, `"true"`, `"yes"`, `"on"` are true; anything else is false.
fn parse_bool(raw: &str) -> bool {
    let v = raw.trim().to_ascii_lowercase();
    matches!(v.as_str(), "1" | "true" | "yes" | "on")
}
