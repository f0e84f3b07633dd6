//! Conversation Context Manager.
//!
//! Keeps a bounded window of recent turns per session so explanations can
//! refer back to earlier answers. History is only ever fed into prompts; the
//! decision engine never sees it.
//!
//! All sessions live behind one mutex, so appends for the same session are
//! serialized in call order. Sessions idle for longer than the configured
//! window are swept on every append and ignored on lookup.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ConversationConfig;
use crate::policy_core::Decision;

/// One answered question.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Question as asked.
    pub question: String,
    /// Decision returned.
    pub decision: Decision,
    /// Explanation returned.
    pub explanation: String,
    /// When the turn was recorded.
    pub at: Instant,
}

#[derive(Debug)]
struct Session {
    turns: VecDeque<Turn>,
    last_accessed: Instant,
}

/// Bounded per-session history with idle eviction.
#[derive(Debug)]
pub struct ConversationManager {
    sessions: Mutex<HashMap<String, Session>>,
    max_turns: usize,
    idle_timeout: Duration,
}

impl ConversationManager {
    /// Keeps at most `max_turns` per session; evicts sessions idle longer
    /// than `idle_timeout`.
    #[must_use]
    pub fn new(max_turns: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_turns: max_turns.max(1),
            idle_timeout,
        }
    }

    /// Builds a manager from configuration.
    #[must_use]
    pub fn from_config(config: &ConversationConfig) -> Self {
        Self::new(config.max_turns, config.idle_timeout())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a turn, dropping the oldest one beyond the cap.
    pub fn append(&self, session_id: &str, question: &str, decision: &Decision, explanation: &str) {
        self.append_at(session_id, question, decision, explanation, Instant::now());
    }

    /// [`ConversationManager::append`] with an explicit clock.
    pub fn append_at(&self, session_id: &str, question: &str, decision: &Decision, explanation: &str, now: Instant) {
        let mut sessions = self.sessions();
        let idle = self.idle_timeout;
        let before = sessions.len();
        sessions.retain(|_, s| now.saturating_duration_since(s.last_accessed) < idle);
        let swept = before - sessions.len();
        if swept > 0 {
            debug!(swept, "evicted idle conversation sessions");
        }

        let session = sessions.entry(session_id.to_string()).or_insert_with(|| Session {
            turns: VecDeque::with_capacity(self.max_turns),
            last_accessed: now,
        });
        session.turns.push_back(Turn {
            question: question.to_string(),
            decision: decision.clone(),
            explanation: explanation.to_string(),
            at: now,
        });
        while session.turns.len() > self.max_turns {
            session.turns.pop_front();
        }
        session.last_accessed = now;
    }

    /// Up to `max_turns` most recent turns, oldest first.
    #[must_use]
    pub fn recent(&self, session_id: &str, max_turns: usize) -> Vec<Turn> {
        self.recent_at(session_id, max_turns, Instant::now())
    }

    /// [`ConversationManager::recent`] with an explicit clock.
    #[must_use]
    pub fn recent_at(&self, session_id: &str, max_turns: usize, now: Instant) -> Vec<Turn> {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(session_id) else {
            return Vec::new();
        };
        if now.saturating_duration_since(session.last_accessed) >= self.idle_timeout {
            sessions.remove(session_id);
            return Vec::new();
        }
        session.last_accessed = now;
        let skip = session.turns.len().saturating_sub(max_turns);
        session.turns.iter().skip(skip).cloned().collect()
    }

    /// Forgets one session. Returns `true` if it existed.
    pub fn clear(&self, session_id: &str) -> bool {
        self.sessions().remove(session_id).is_some()
    }

    /// Forgets every session.
    pub fn clear_all(&self) {
        self.sessions().clear();
    }

    /// Sessions currently held.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }
}

impl Default for ConversationManager {
    fn default() -> Self {
        Self::from_config(&ConversationConfig::default())
    }
}
