//! Error taxonomy for the compliance pipeline.
//!
//! Only two families ever reach a caller:
//!
//! - **capacity** errors ([`ComplianceError::Overloaded`],
//!   [`ComplianceError::ShuttingDown`]), which always carry the decision that
//!   was already computed for the question;
//! - **policy store** errors, raised by uploads that fail validation before
//!   any snapshot swap.
//!
//! Provider failures are recovered inside the orchestrator and never appear
//! here.

use std::time::Duration;

use thiserror::Error;

use crate::policy_core::Decision;

/// Why a request was refused admission to the inference pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadReason {
    /// The wait queue already held `depth` requests, at or above the
    /// configured overload threshold; the request was shed immediately.
    QueueFull {
        /// Queue depth observed at admission time.
        depth: usize,
    },
    /// The request waited for a slot longer than the request timeout and
    /// was never dispatched to a provider.
    QueueTimeout {
        /// How long the request waited.
        waited: Duration,
    },
}

impl std::fmt::Display for OverloadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull { depth } => write!(f, "queue full ({depth} waiting)"),
            Self::QueueTimeout { waited } => write!(f, "queued for {waited:?} without a free slot"),
        }
    }
}

/// Errors surfaced by [`crate::node::ComplianceNode`] and the policy store.
#[derive(Debug, Error)]
pub enum ComplianceError {
    /// Admission control rejected the explanation step.
    ///
    /// The decision is final and is returned anyway; callers may retry with
    /// backoff to obtain a model-phrased explanation.
    #[error("service overloaded: {reason}")]
    Overloaded {
        /// What tripped the load shedder.
        reason: OverloadReason,
        /// The decision computed before admission was attempted.
        decision: Option<Box<Decision>>,
    },

    /// The node is shutting down and no longer admits requests.
    #[error("service is shutting down")]
    ShuttingDown {
        /// The decision computed before admission was attempted.
        decision: Option<Box<Decision>>,
    },

    /// An uploaded policy table failed validation. No snapshot was published.
    #[error("policy validation failed in table `{table}`, row {row}: {message}")]
    PolicyValidation {
        /// Sheet name, e.g. `Restricted Brands`.
        table: &'static str,
        /// 1-based row number inside the sheet.
        row: usize,
        /// What was wrong with the row.
        message: String,
    },

    /// The policy document could not be parsed at all.
    #[error("malformed policy document: {0}")]
    MalformedDocument(String),

    /// The policy file extension is not one we know how to read.
    #[error("unsupported policy file format: {0}")]
    UnsupportedFormat(String),
}

impl ComplianceError {
    /// `true` for capacity errors a caller should retry with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded { .. })
    }

    /// The decision carried by a capacity error, if any.
    #[must_use]
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Overloaded { decision, .. } | Self::ShuttingDown { decision } => {
                decision.as_deref()
            }
            _ => None,
        }
    }

    /// Attaches the already-computed decision to a capacity error.
    #[must_use]
    pub fn with_decision(self, decision: Decision) -> Self {
        match self {
            Self::Overloaded { reason, .. } => Self::Overloaded {
                reason,
                decision: Some(Box::new(decision)),
            },
            Self::ShuttingDown { .. } => Self::ShuttingDown {
                decision: Some(Box::new(decision)),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_core::{Decision, DecisionStatus};

    #[test]
    fn overload_is_retryable_validation_is_not() {
        let overload = ComplianceError::Overloaded {
            reason: OverloadReason::QueueFull { depth: 3 },
            decision: None,
        };
        assert!(overload.is_retryable());

        let invalid = ComplianceError::PolicyValidation {
            table: "Restricted Brands",
            row: 4,
            message: "empty Brand".into(),
        };
        assert!(!invalid.is_retryable());
        assert!(invalid.to_string().contains("Restricted Brands"));
        assert!(invalid.to_string().contains("row 4"));
    }

    #[test]
    fn with_decision_attaches_to_capacity_errors_only() {
        let decision = Decision::allowed(7);
        let err = ComplianceError::Overloaded {
            reason: OverloadReason::QueueTimeout {
                waited: Duration::from_millis(10),
            },
            decision: None,
        }
        .with_decision(decision.clone());
        assert_eq!(err.decision().map(|d| d.status), Some(DecisionStatus::Allowed));

        let other = ComplianceError::MalformedDocument("x".into()).with_decision(decision);
        assert!(other.decision().is_none());
    }
}
