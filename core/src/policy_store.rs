//! Policy Store: versioned, immutable snapshots of the three rule tables.
//!
//! Rules arrive as a [`PolicyDocument`] whose sheet and column names are
//! fixed by the ingestion contract:
//!
//! | Sheet                   | Columns                                          |
//! |-------------------------|--------------------------------------------------|
//! | `Blacklisted Words`     | `Keyword`, `Severity`, `Scope`, `Description`    |
//! | `Restricted Brands`     | `Brand`, `Category`, `Country`, `Status`, `Condition` |
//! | `Prohibited Categories` | `Keyword`, `Category`, `Country`, `Status`, `Notes`   |
//!
//! An empty `Country` means global scope.
//!
//! # Publication
//!
//! A new [`PolicySnapshot`] is built completely, off to the side, and then
//! published with a single pointer swap inside [`PolicyStore::publish`].
//! Readers clone an `Arc` and keep evaluating against the version they
//! grabbed; nobody ever sees a half-built rule set. Rows are never mutated
//! after load.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ComplianceError;
use crate::extractor::country_code;
use crate::text::Phrase;

const BLACKLIST_SHEET: &str = "Blacklisted Words";
const BRANDS_SHEET: &str = "Restricted Brands";
const CATEGORIES_SHEET: &str = "Prohibited Categories";

// ───────────────────────────────────────────────────────────────────────────
// Rule rows
// ───────────────────────────────────────────────────────────────────────────

/// Severity of a blacklisted term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; still restricts.
    Low,
    /// Restricts the listing.
    Medium,
    /// Blocks the listing outright.
    High,
}

impl Severity {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Where a blacklisted term applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "countries", rename_all = "lowercase")]
pub enum TermScope {
    /// Everywhere.
    Global,
    /// Only when one of the listed countries is detected in the question.
    /// An empty list means "any detected country".
    Regional(Vec<String>),
}

impl TermScope {
    /// Parses `global`, `regional`, `regional:NG,KE` or a bare `NG,KE`.
    fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.is_empty() || lower == "global" || lower == "international" {
            return Some(Self::Global);
        }
        if lower == "regional" {
            return Some(Self::Regional(Vec::new()));
        }
        let list = lower
            .strip_prefix("regional:")
            .map_or(trimmed, |_| &trimmed["regional:".len()..]);
        let codes: Vec<String> = list
            .split(',')
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        if codes.is_empty() || codes.iter().any(|c| !c.chars().all(|ch| ch.is_ascii_alphabetic())) {
            return None;
        }
        Some(Self::Regional(codes))
    }

    /// `true` if a term with this scope applies given the detected countries.
    #[must_use]
    pub fn applies_to(&self, detected: &BTreeSet<String>) -> bool {
        match self {
            Self::Global => true,
            Self::Regional(codes) if codes.is_empty() => !detected.is_empty(),
            Self::Regional(codes) => codes.iter().any(|c| detected.contains(c)),
        }
    }
}

/// Status carried by brand and category rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// Allowed with conditions (authorization, QC, ...).
    Restricted,
    /// Not allowed.
    Prohibited,
}

impl RuleStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "restricted" => Some(Self::Restricted),
            "prohibited" | "forbidden" => Some(Self::Prohibited),
            _ => None,
        }
    }

    /// Lowercase label used in reason text.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Prohibited => "prohibited",
        }
    }
}

/// Free-text term that must not appear in a listing question.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlacklistedTerm {
    /// Term as written in the sheet.
    pub keyword: String,
    /// How hard the term hits.
    pub severity: Severity,
    /// Where the term applies.
    pub scope: TermScope,
    /// Optional description.
    pub description: Option<String>,
}

/// Brand with selling restrictions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestrictedBrand {
    /// Brand name as written in the sheet.
    pub brand: String,
    /// Optional category label.
    pub category: Option<String>,
    /// ISO country code; `None` means global.
    pub country: Option<String>,
    /// Restricted or prohibited.
    pub status: RuleStatus,
    /// Condition to comply, e.g. "Authorization required".
    pub condition: Option<String>,
}

/// Product keyword that is prohibited or restricted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProhibitedCategory {
    /// Product keyword as written in the sheet.
    pub keyword: String,
    /// Optional category label.
    pub category: Option<String>,
    /// ISO country code; `None` means global.
    pub country: Option<String>,
    /// Prohibited or restricted.
    pub status: RuleStatus,
    /// Optional notes.
    pub notes: Option<String>,
}

/// Any rule row, as cited by a [`crate::policy_core::Decision`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum PolicyRule {
    /// Row from `Blacklisted Words`.
    BlacklistedTerm(BlacklistedTerm),
    /// Row from `Restricted Brands`.
    RestrictedBrand(RestrictedBrand),
    /// Row from `Prohibited Categories`.
    ProhibitedCategory(ProhibitedCategory),
}

// ───────────────────────────────────────────────────────────────────────────
// Upload document
// ───────────────────────────────────────────────────────────────────────────

/// Raw `Blacklisted Words` row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlacklistRow {
    /// `Keyword` column.
    #[serde(rename = "Keyword", default)]
    pub keyword: Option<String>,
    /// `Severity` column (default `high`).
    #[serde(rename = "Severity", default)]
    pub severity: Option<String>,
    /// `Scope` column (default `global`).
    #[serde(rename = "Scope", default)]
    pub scope: Option<String>,
    /// `Description` column.
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
}

/// Raw `Restricted Brands` row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrandRow {
    /// `Brand` column.
    #[serde(rename = "Brand", default)]
    pub brand: Option<String>,
    /// `Category` column.
    #[serde(rename = "Category", default)]
    pub category: Option<String>,
    /// `Country` column; empty means global.
    #[serde(rename = "Country", default)]
    pub country: Option<String>,
    /// `Status` column (default `restricted`).
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
    /// `Condition` column.
    #[serde(rename = "Condition", default)]
    pub condition: Option<String>,
}

/// Raw `Prohibited Categories` row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryRow {
    /// `Keyword` column.
    #[serde(rename = "Keyword", default)]
    pub keyword: Option<String>,
    /// `Category` column.
    #[serde(rename = "Category", default)]
    pub category: Option<String>,
    /// `Country` column; empty means global.
    #[serde(rename = "Country", default)]
    pub country: Option<String>,
    /// `Status` column (default `prohibited`).
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
    /// `Notes` column.
    #[serde(rename = "Notes", default)]
    pub notes: Option<String>,
}

/// A policy upload as produced by the ingestion collaborator.
///
/// A sheet set to `None` is absent from the upload and leaves the current
/// table untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// `Blacklisted Words` sheet.
    #[serde(rename = "Blacklisted Words", default, skip_serializing_if = "Option::is_none")]
    pub blacklisted_words: Option<Vec<BlacklistRow>>,
    /// `Restricted Brands` sheet.
    #[serde(rename = "Restricted Brands", default, skip_serializing_if = "Option::is_none")]
    pub restricted_brands: Option<Vec<BrandRow>>,
    /// `Prohibited Categories` sheet.
    #[serde(rename = "Prohibited Categories", default, skip_serializing_if = "Option::is_none")]
    pub prohibited_categories: Option<Vec<CategoryRow>>,
}

impl PolicyDocument {
    /// Parses an uploaded file, picking the format from the file extension.
    ///
    /// # Errors
    ///
    /// [`ComplianceError::UnsupportedFormat`] for anything but `.json`,
    /// `.yaml`, `.yml`; [`ComplianceError::MalformedDocument`] when the
    /// content does not deserialize.
    pub fn parse(filename: &str, contents: &[u8]) -> Result<Self, ComplianceError> {
        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".json") {
            serde_json::from_slice(contents)
                .map_err(|e| ComplianceError::MalformedDocument(e.to_string()))
        } else if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            serde_yaml::from_slice(contents)
                .map_err(|e| ComplianceError::MalformedDocument(e.to_string()))
        } else {
            Err(ComplianceError::UnsupportedFormat(filename.to_string()))
        }
    }

    /// Reads and parses a policy file from disk (startup path).
    ///
    /// # Errors
    ///
    /// IO errors and any [`PolicyDocument::parse`] failure, with context.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Unable to read policy file {}", path.display()))?;
        let name = path.to_string_lossy();
        Self::parse(&name, &bytes)
            .with_context(|| format!("Unable to parse policy file {}", path.display()))
    }

    /// Validates every present sheet into typed rule tables.
    ///
    /// # Errors
    ///
    /// [`ComplianceError::PolicyValidation`] naming the first bad row.
    pub fn validate(&self) -> Result<PolicyTables, ComplianceError> {
        let blacklist = self
            .blacklisted_words
            .as_ref()
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .map(|(i, r)| validate_blacklist_row(i + 1, r))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let brands = self
            .restricted_brands
            .as_ref()
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .map(|(i, r)| validate_brand_row(i + 1, r))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let categories = self
            .prohibited_categories
            .as_ref()
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .map(|(i, r)| validate_category_row(i + 1, r))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        Ok(PolicyTables {
            blacklist,
            brands,
            categories,
        })
    }
}

fn non_empty(cell: Option<&String>) -> Option<String> {
    cell.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

fn invalid(table: &'static str, row: usize, message: impl Into<String>) -> ComplianceError {
    ComplianceError::PolicyValidation {
        table,
        row,
        message: message.into(),
    }
}

fn country_cell(table: &'static str, row: usize, cell: Option<&String>) -> Result<Option<String>, ComplianceError> {
    match non_empty(cell) {
        None => Ok(None),
        Some(raw) => {
            if let Some(code) = country_code(&raw) {
                return Ok(Some(code.to_string()));
            }
            if raw.len() == 2 && raw.chars().all(|c| c.is_ascii_alphabetic()) {
                return Ok(Some(raw.to_ascii_uppercase()));
            }
            Err(invalid(table, row, format!("Country `{raw}` is neither an ISO code nor a known country name")))
        }
    }
}

fn validate_blacklist_row(row: usize, r: &BlacklistRow) -> Result<BlacklistedTerm, ComplianceError> {
    let keyword = non_empty(r.keyword.as_ref()).ok_or_else(|| invalid(BLACKLIST_SHEET, row, "empty Keyword"))?;
    if Phrase::new(&keyword).is_none() {
        return Err(invalid(BLACKLIST_SHEET, row, format!("Keyword `{keyword}` has no matchable text")));
    }
    let severity = match non_empty(r.severity.as_ref()) {
        None => Severity::High,
        Some(raw) => Severity::parse(&raw)
            .ok_or_else(|| invalid(BLACKLIST_SHEET, row, format!("unknown Severity `{raw}`")))?,
    };
    let scope = match non_empty(r.scope.as_ref()) {
        None => TermScope::Global,
        Some(raw) => TermScope::parse(&raw)
            .ok_or_else(|| invalid(BLACKLIST_SHEET, row, format!("unknown Scope `{raw}`")))?,
    };
    Ok(BlacklistedTerm {
        keyword,
        severity,
        scope,
        description: non_empty(r.description.as_ref()),
    })
}

fn validate_brand_row(row: usize, r: &BrandRow) -> Result<RestrictedBrand, ComplianceError> {
    let brand = non_empty(r.brand.as_ref()).ok_or_else(|| invalid(BRANDS_SHEET, row, "empty Brand"))?;
    if Phrase::new(&brand).is_none() {
        return Err(invalid(BRANDS_SHEET, row, format!("Brand `{brand}` has no matchable text")));
    }
    let status = match non_empty(r.status.as_ref()) {
        None => RuleStatus::Restricted,
        Some(raw) => RuleStatus::parse(&raw)
            .ok_or_else(|| invalid(BRANDS_SHEET, row, format!("unknown Status `{raw}`")))?,
    };
    Ok(RestrictedBrand {
        brand,
        category: non_empty(r.category.as_ref()),
        country: country_cell(BRANDS_SHEET, row, r.country.as_ref())?,
        status,
        condition: non_empty(r.condition.as_ref()),
    })
}

fn validate_category_row(row: usize, r: &CategoryRow) -> Result<ProhibitedCategory, ComplianceError> {
    let keyword = non_empty(r.keyword.as_ref()).ok_or_else(|| invalid(CATEGORIES_SHEET, row, "empty Keyword"))?;
    if Phrase::new(&keyword).is_none() {
        return Err(invalid(CATEGORIES_SHEET, row, format!("Keyword `{keyword}` has no matchable text")));
    }
    let status = match non_empty(r.status.as_ref()) {
        None => RuleStatus::Prohibited,
        Some(raw) => RuleStatus::parse(&raw)
            .ok_or_else(|| invalid(CATEGORIES_SHEET, row, format!("unknown Status `{raw}`")))?,
    };
    Ok(ProhibitedCategory {
        keyword,
        category: non_empty(r.category.as_ref()),
        country: country_cell(CATEGORIES_SHEET, row, r.country.as_ref())?,
        status,
        notes: non_empty(r.notes.as_ref()),
    })
}

/// Validated tables from one upload. `None` = sheet absent, keep current.
#[derive(Debug, Clone, Default)]
pub struct PolicyTables {
    /// `Blacklisted Words`.
    pub blacklist: Option<Vec<BlacklistedTerm>>,
    /// `Restricted Brands`.
    pub brands: Option<Vec<RestrictedBrand>>,
    /// `Prohibited Categories`.
    pub categories: Option<Vec<ProhibitedCategory>>,
}

// ───────────────────────────────────────────────────────────────────────────
// Snapshot
// ───────────────────────────────────────────────────────────────────────────

/// Row counts per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyStats {
    /// `Restricted Brands` rows.
    pub total_brands: usize,
    /// `Blacklisted Words` rows.
    pub total_keywords: usize,
    /// `Prohibited Categories` rows.
    pub total_products: usize,
}

/// Per-table counts reported by an upload; only sheets that were present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadCounts {
    /// Rows loaded into `Blacklisted Words`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<usize>,
    /// Rows loaded into `Restricted Brands`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brands: Option<usize>,
    /// Rows loaded into `Prohibited Categories`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products: Option<usize>,
}

/// Vocabulary derived from the rule tables, used by the extractor.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    /// Distinct brand phrases, first-seen order.
    pub brands: Vec<Phrase>,
    /// Distinct product phrases, first-seen order.
    pub products: Vec<Phrase>,
    /// Country codes referenced by any brand/category row.
    pub country_codes: BTreeSet<String>,
}

/// Immutable bundle of the three tables plus a version number.
#[derive(Debug)]
pub struct PolicySnapshot {
    version: u64,
    blacklist: Vec<BlacklistedTerm>,
    blacklist_phrases: Vec<Phrase>,
    brands: Vec<RestrictedBrand>,
    brand_index: BTreeMap<String, Vec<usize>>,
    categories: Vec<ProhibitedCategory>,
    category_index: BTreeMap<String, Vec<usize>>,
    vocabulary: Vocabulary,
}

impl PolicySnapshot {
    /// Builds a snapshot. Rows must already be validated.
    #[must_use]
    pub fn new(
        version: u64,
        blacklist: Vec<BlacklistedTerm>,
        brands: Vec<RestrictedBrand>,
        categories: Vec<ProhibitedCategory>,
    ) -> Self {
        let blacklist_phrases = blacklist
            .iter()
            .map(|t| Phrase::new(&t.keyword).unwrap_or_else(|| Phrase { key: String::new(), tokens: Vec::new() }))
            .collect();

        let mut vocabulary = Vocabulary::default();
        let mut brand_index: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, row) in brands.iter().enumerate() {
            if let Some(phrase) = Phrase::new(&row.brand) {
                let slot = brand_index.entry(phrase.key.clone()).or_default();
                if slot.is_empty() {
                    vocabulary.brands.push(phrase);
                }
                slot.push(idx);
            }
            if let Some(code) = &row.country {
                vocabulary.country_codes.insert(code.clone());
            }
        }

        let mut category_index: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, row) in categories.iter().enumerate() {
            if let Some(phrase) = Phrase::new(&row.keyword) {
                let slot = category_index.entry(phrase.key.clone()).or_default();
                if slot.is_empty() {
                    vocabulary.products.push(phrase);
                }
                slot.push(idx);
            }
            if let Some(code) = &row.country {
                vocabulary.country_codes.insert(code.clone());
            }
        }

        Self {
            version,
            blacklist,
            blacklist_phrases,
            brands,
            brand_index,
            categories,
            category_index,
            vocabulary,
        }
    }

    /// Version 0 with no rules: everything is Allowed.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, Vec::new(), Vec::new(), Vec::new())
    }

    /// Monotonic version number.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// `Blacklisted Words`, insertion order, paired with their folded phrase.
    pub fn blacklist(&self) -> impl Iterator<Item = (&BlacklistedTerm, &Phrase)> {
        self.blacklist.iter().zip(&self.blacklist_phrases)
    }

    /// `Restricted Brands` rows for a folded brand key with their table
    /// position, insertion order.
    pub fn brand_rows<'a>(&'a self, key: &str) -> impl Iterator<Item = (usize, &'a RestrictedBrand)> + 'a {
        self.brand_index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(move |&i| self.brands.get(i).map(|row| (i, row)))
    }

    /// `Prohibited Categories` rows for a folded keyword with their table
    /// position, insertion order.
    pub fn category_rows<'a>(&'a self, key: &str) -> impl Iterator<Item = (usize, &'a ProhibitedCategory)> + 'a {
        self.category_index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(move |&i| self.categories.get(i).map(|row| (i, row)))
    }

    /// Extractor vocabulary.
    #[must_use]
    pub const fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Row counts.
    #[must_use]
    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            total_brands: self.brands.len(),
            total_keywords: self.blacklist.len(),
            total_products: self.categories.len(),
        }
    }

    /// Builds the successor snapshot: present tables replace, absent ones carry over.
    fn successor(&self, tables: PolicyTables) -> Self {
        Self::new(
            self.version + 1,
            tables.blacklist.unwrap_or_else(|| self.blacklist.clone()),
            tables.brands.unwrap_or_else(|| self.brands.clone()),
            tables.categories.unwrap_or_else(|| self.categories.clone()),
        )
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────────────

/// Holder of the current snapshot.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
    // Serializes publishers so versions stay strictly increasing.
    publish_lock: Mutex<()>,
}

impl PolicyStore {
    /// Starts the store with `initial` as the current snapshot.
    #[must_use]
    pub fn new(initial: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            publish_lock: Mutex::new(()),
        }
    }

    /// Builds the startup snapshot (version 1) from a validated document.
    ///
    /// # Errors
    ///
    /// Any validation failure; a corrupt initial policy is fatal at startup.
    pub fn from_document(doc: &PolicyDocument) -> Result<Self, ComplianceError> {
        let tables = doc.validate()?;
        let snapshot = PolicySnapshot::empty().successor(tables);
        Ok(Self::new(snapshot))
    }

    /// The snapshot requests should evaluate against right now.
    #[must_use]
    pub fn current(&self) -> Arc<PolicySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validates `doc`, builds the successor snapshot and swaps it in.
    ///
    /// Nothing is published if validation fails.
    ///
    /// # Errors
    ///
    /// [`ComplianceError::PolicyValidation`] naming the first bad row.
    pub fn publish(&self, doc: &PolicyDocument) -> Result<(Arc<PolicySnapshot>, UploadCounts), ComplianceError> {
        let tables = doc.validate()?;
        let counts = UploadCounts {
            keywords: tables.blacklist.as_ref().map(Vec::len),
            brands: tables.brands.as_ref().map(Vec::len),
            products: tables.categories.as_ref().map(Vec::len),
        };

        let _publisher = self.publish_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = Arc::new(self.current().successor(tables));
        {
            let mut slot = self.current.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Arc::clone(&next);
        }

        info!(
            version = next.version(),
            keywords = ?counts.keywords,
            brands = ?counts.brands,
            products = ?counts.products,
            "policy snapshot published"
        );
        Ok((next, counts))
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(PolicySnapshot::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brand(name: &str, country: Option<&str>, status: &str) -> BrandRow {
        BrandRow {
            brand: Some(name.into()),
            country: country.map(str::to_string),
            status: Some(status.into()),
            ..BrandRow::default()
        }
    }

    #[test]
    fn json_document_uses_sheet_and_column_names() {
        let raw = br#"{
            "Blacklisted Words": [{"Keyword": "fake", "Severity": "high", "Scope": "global"}],
            "Restricted Brands": [{"Brand": "Nike", "Country": "ng", "Status": "restricted", "Condition": "Authorized resellers only"}]
        }"#;
        let doc = PolicyDocument::parse("policy.json", raw).expect("parse");
        let tables = doc.validate().expect("validate");
        let brands = tables.brands.expect("brands sheet");
        assert_eq!(brands[0].country.as_deref(), Some("NG"));
        assert_eq!(brands[0].status, RuleStatus::Restricted);
        assert!(tables.categories.is_none());
    }

    #[test]
    fn yaml_document_is_accepted() {
        let raw = b"Prohibited Categories:\n  - Keyword: drones\n    Country: KE\n";
        let doc = PolicyDocument::parse("rules.YML", raw).expect("parse");
        let cats = doc.validate().expect("validate").categories.expect("sheet");
        assert_eq!(cats[0].status, RuleStatus::Prohibited);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = PolicyDocument::parse("rules.xlsx", b"").unwrap_err();
        assert!(matches!(err, ComplianceError::UnsupportedFormat(_)));
    }

    #[test]
    fn validation_names_table_and_row() {
        let doc = PolicyDocument {
            restricted_brands: Some(vec![brand("Nike", None, "restricted"), brand("Adidas", None, "maybe")]),
            ..PolicyDocument::default()
        };
        match doc.validate() {
            Err(ComplianceError::PolicyValidation { table, row, .. }) => {
                assert_eq!(table, "Restricted Brands");
                assert_eq!(row, 2);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn country_names_resolve_to_iso_codes() {
        let doc = PolicyDocument {
            restricted_brands: Some(vec![
                brand("Nike", Some("Nigeria"), "prohibited"),
                brand("Puma", Some("Côte d'Ivoire"), "restricted"),
                brand("Reebok", Some("fr"), "restricted"),
            ]),
            ..PolicyDocument::default()
        };
        let brands = doc.validate().expect("validate").brands.expect("sheet");
        let countries: Vec<_> = brands.iter().map(|b| b.country.as_deref()).collect();
        assert_eq!(countries, vec![Some("NG"), Some("CI"), Some("FR")]);
    }

    #[test]
    fn unknown_country_name_names_table_and_row() {
        let doc = PolicyDocument {
            prohibited_categories: Some(vec![
                CategoryRow {
                    keyword: Some("drones".into()),
                    country: Some("KE".into()),
                    ..CategoryRow::default()
                },
                CategoryRow {
                    keyword: Some("vapes".into()),
                    country: Some("Atlantis".into()),
                    ..CategoryRow::default()
                },
            ]),
            ..PolicyDocument::default()
        };
        match doc.validate() {
            Err(ComplianceError::PolicyValidation { table, row, message }) => {
                assert_eq!(table, "Prohibited Categories");
                assert_eq!(row, 2);
                assert!(message.contains("Atlantis"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(TermScope::parse("Global"), Some(TermScope::Global));
        assert_eq!(TermScope::parse("regional"), Some(TermScope::Regional(vec![])));
        assert_eq!(
            TermScope::parse("regional:ng, ke"),
            Some(TermScope::Regional(vec!["NG".into(), "KE".into()]))
        );
        assert_eq!(TermScope::parse("NG,GH"), Some(TermScope::Regional(vec!["NG".into(), "GH".into()])));
        assert_eq!(TermScope::parse("N-G"), None);
    }

    #[test]
    fn failed_publish_keeps_prior_snapshot() {
        let store = PolicyStore::default();
        let good = PolicyDocument {
            restricted_brands: Some(vec![brand("Nike", Some("NG"), "restricted")]),
            ..PolicyDocument::default()
        };
        let (snap, counts) = store.publish(&good).expect("publish");
        assert_eq!(snap.version(), 1);
        assert_eq!(counts.brands, Some(1));
        assert_eq!(counts.keywords, None);

        let bad = PolicyDocument {
            restricted_brands: Some(vec![BrandRow::default()]),
            ..PolicyDocument::default()
        };
        assert!(store.publish(&bad).is_err());
        assert_eq!(store.current().version(), 1);
        assert_eq!(store.current().stats().total_brands, 1);
    }

    #[test]
    fn absent_sheets_carry_over() {
        let store = PolicyStore::default();
        let first = PolicyDocument {
            blacklisted_words: Some(vec![BlacklistRow {
                keyword: Some("replica".into()),
                ..BlacklistRow::default()
            }]),
            restricted_brands: Some(vec![brand("Nike", None, "restricted")]),
            ..PolicyDocument::default()
        };
        store.publish(&first).expect("first");

        let second = PolicyDocument {
            restricted_brands: Some(vec![brand("Nike", None, "prohibited"), brand("Rolex", None, "restricted")]),
            ..PolicyDocument::default()
        };
        let (snap, _) = store.publish(&second).expect("second");
        assert_eq!(snap.version(), 2);
        assert_eq!(snap.stats().total_keywords, 1);
        assert_eq!(snap.stats().total_brands, 2);
        let nike: Vec<_> = snap.brand_rows("nike").collect();
        assert_eq!(nike[0].1.status, RuleStatus::Prohibited);
    }

    #[test]
    fn readers_keep_the_version_they_grabbed() {
        let store = PolicyStore::default();
        let before = store.current();
        store
            .publish(&PolicyDocument {
                restricted_brands: Some(vec![brand("Nike", None, "restricted")]),
                ..PolicyDocument::default()
            })
            .expect("publish");
        assert_eq!(before.version(), 0);
        assert_eq!(before.stats().total_brands, 0);
        assert_eq!(store.current().version(), 1);
    }

    #[test]
    fn vocabulary_dedups_brands_and_collects_countries() {
        let snap = PolicySnapshot::new(
            1,
            vec![],
            vec![
                RestrictedBrand {
                    brand: "Nike".into(),
                    category: None,
                    country: Some("NG".into()),
                    status: RuleStatus::Restricted,
                    condition: None,
                },
                RestrictedBrand {
                    brand: "NIKE".into(),
                    category: None,
                    country: None,
                    status: RuleStatus::Prohibited,
                    condition: None,
                },
            ],
            vec![],
        );
        assert_eq!(snap.vocabulary().brands.len(), 1);
        assert_eq!(snap.brand_rows("nike").count(), 2);
        assert!(snap.vocabulary().country_codes.contains("NG"));
    }
}
