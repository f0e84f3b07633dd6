//! Policy Decision Engine.
//!
//! `evaluate` is a pure function of `(Entities, PolicySnapshot)`:
//!
//! 1. blacklist terms found in the normalized question, filtered by scope;
//! 2. brand rows for each detected brand;
//! 3. category rows for each detected product keyword.
//!
//! For brands and categories a row applies when its country is empty or
//! equals a detected country. When both a country-scoped row and a global
//! row apply to the same brand (or keyword), the country-scoped row wins.
//!
//! Precedence is `Blocked > Prohibited > Restricted > Allowed`; only a
//! high-severity blacklist hit can block. The reason cites the rules that
//! produced the winning status, ordered blacklist, then brand, then
//! category, each in table insertion order.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::extractor::Entities;
use crate::policy_store::{PolicyRule, PolicySnapshot, RuleStatus, Severity};

const MAX_REASON_ISSUES: usize = 5;
const COMPLIANT_REASON: &str = "No policy violations found. This listing appears to be compliant.";

/// Final compliance verdict. Ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DecisionStatus {
    /// No rule matched.
    Allowed,
    /// Allowed with conditions.
    Restricted,
    /// Not allowed.
    Prohibited,
    /// High-severity blacklist hit.
    Blocked,
}

impl DecisionStatus {
    /// Label used in responses and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "Allowed",
            Self::Restricted => "Restricted",
            Self::Prohibited => "Prohibited",
            Self::Blocked => "Blocked",
        }
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RuleStatus> for DecisionStatus {
    fn from(status: RuleStatus) -> Self {
        match status {
            RuleStatus::Restricted => Self::Restricted,
            RuleStatus::Prohibited => Self::Prohibited,
        }
    }
}

/// Deterministic verdict for one question against one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Winning status.
    pub status: DecisionStatus,
    /// Every matched rule: blacklist, then brand, then category.
    pub matched_rules: Vec<PolicyRule>,
    /// Human-readable reason built from the rules behind `status`.
    pub reason: String,
    /// Snapshot this decision was computed against.
    pub snapshot_version: u64,
}

impl Decision {
    /// The decision for a question that matched nothing.
    #[must_use]
    pub fn allowed(snapshot_version: u64) -> Self {
        Self {
            status: DecisionStatus::Allowed,
            matched_rules: Vec::new(),
            reason: COMPLIANT_REASON.to_string(),
            snapshot_version,
        }
    }

    /// Brand names (as written in the sheet) of matched brand rules.
    pub fn matched_brands(&self) -> impl Iterator<Item = &str> {
        self.matched_rules.iter().filter_map(|rule| match rule {
            PolicyRule::RestrictedBrand(b) => Some(b.brand.as_str()),
            _ => None,
        })
    }
}

struct Candidate {
    status: DecisionStatus,
    rule: PolicyRule,
    issue: String,
}

fn blacklist_candidates(entities: &Entities, snapshot: &PolicySnapshot, out: &mut Vec<Candidate>) {
    for (term, phrase) in snapshot.blacklist() {
        if !term.scope.applies_to(&entities.countries) || !entities.text.contains(phrase) {
            continue;
        }
        let (status, issue) = if term.severity == Severity::High {
            (DecisionStatus::Blocked, format!("Contains prohibited keyword '{}'", term.keyword))
        } else {
            (DecisionStatus::Restricted, format!("Contains restricted keyword '{}'", term.keyword))
        };
        out.push(Candidate {
            status,
            rule: PolicyRule::BlacklistedTerm(term.clone()),
            issue,
        });
    }
}

/// Picks the applicable rows for one entity: country-scoped rows that match
/// a detected country if any, otherwise the global rows.
fn most_specific<'a, T: 'a>(
    rows: impl Iterator<Item = (usize, &'a T)>,
    country_of: impl Fn(&T) -> Option<&str>,
    countries: &BTreeSet<String>,
) -> Vec<(usize, &'a T)> {
    let (scoped, global): (Vec<_>, Vec<_>) = rows
        .filter(|(_, row)| country_of(*row).map_or(true, |c| countries.contains(c)))
        .partition(|(_, row)| country_of(*row).is_some());
    if scoped.is_empty() {
        global
    } else {
        scoped
    }
}

fn in_country(country: Option<&str>) -> String {
    country.map(|c| format!(" in {c}")).unwrap_or_default()
}

fn brand_candidates(entities: &Entities, snapshot: &PolicySnapshot, out: &mut Vec<Candidate>) {
    let mut picked = Vec::new();
    for key in &entities.brands {
        picked.extend(most_specific(
            snapshot.brand_rows(key),
            |row| row.country.as_deref(),
            &entities.countries,
        ));
    }
    picked.sort_by_key(|(idx, _)| *idx);
    for (_, row) in picked {
        let condition = row.condition.as_deref().unwrap_or("Authorization required");
        out.push(Candidate {
            status: row.status.into(),
            rule: PolicyRule::RestrictedBrand(row.clone()),
            issue: format!(
                "Brand '{}' is {}{}. {condition}",
                row.brand,
                row.status.as_str(),
                in_country(row.country.as_deref())
            ),
        });
    }
}

fn category_candidates(entities: &Entities, snapshot: &PolicySnapshot, out: &mut Vec<Candidate>) {
    let mut picked = Vec::new();
    for key in &entities.products {
        picked.extend(most_specific(
            snapshot.category_rows(key),
            |row| row.country.as_deref(),
            &entities.countries,
        ));
    }
    picked.sort_by_key(|(idx, _)| *idx);
    for (_, row) in picked {
        let notes = row.notes.as_deref().map(|n| format!(" - {n}")).unwrap_or_default();
        out.push(Candidate {
            status: row.status.into(),
            rule: PolicyRule::ProhibitedCategory(row.clone()),
            issue: format!(
                "Product '{}' is {}{}{notes}",
                row.keyword,
                row.status.as_str(),
                in_country(row.country.as_deref())
            ),
        });
    }
}

/// Joins issue texts into the reason line.
#[must_use]
pub fn format_reason(issues: &[String]) -> String {
    match issues {
        [] => COMPLIANT_REASON.to_string(),
        [only] => only.clone(),
        _ if issues.len() > MAX_REASON_ISSUES => format!(
            "Found {} policy issues. Key concerns: {}; (+ {} more issues)",
            issues.len(),
            issues[..MAX_REASON_ISSUES].join("; "),
            issues.len() - MAX_REASON_ISSUES
        ),
        _ => format!("Found {} policy issues: {}", issues.len(), issues.join("; ")),
    }
}

/// Evaluates extracted entities against a snapshot.
#[must_use]
pub fn evaluate(entities: &Entities, snapshot: &PolicySnapshot) -> Decision {
    let mut candidates = Vec::new();
    blacklist_candidates(entities, snapshot, &mut candidates);
    brand_candidates(entities, snapshot, &mut candidates);
    category_candidates(entities, snapshot, &mut candidates);

    let Some(status) = candidates.iter().map(|c| c.status).max() else {
        return Decision::allowed(snapshot.version());
    };

    let issues: Vec<String> = candidates
        .iter()
        .filter(|c| c.status == status)
        .map(|c| c.issue.clone())
        .collect();

    Decision {
        status,
        matched_rules: candidates.into_iter().map(|c| c.rule).collect(),
        reason: format_reason(&issues),
        snapshot_version: snapshot.version(),
    }
}
