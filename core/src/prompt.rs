//! Prompt construction and the deterministic template explanation.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::conversation::Turn;
use crate::extractor::Entities;
use crate::policy_core::{Decision, DecisionStatus};

/// Reply to an empty question; no provider is called.
pub const EMPTY_QUESTION_REPLY: &str = "Please provide a question about product compliance.";

/// Who is asking; selects the tone of the explanation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Marketplace seller (default).
    #[default]
    Seller,
    /// Marketplace administrator.
    Admin,
    /// Legal reviewer.
    Legal,
}

impl Role {
    /// Parses a role name. Unknown names map to `Seller`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "legal" => Self::Legal,
            _ => Self::Seller,
        }
    }

    /// Lowercase role name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Seller => "seller",
            Self::Admin => "admin",
            Self::Legal => "legal",
        }
    }

    const fn tone(self) -> &'static str {
        match self {
            Self::Seller => {
                "Use friendly, supportive, and encouraging language. Be helpful and clear. \
                 Avoid legal threats or overly technical jargon. Make the seller feel supported."
            }
            Self::Admin => "Use professional, factual language. Be direct and comprehensive.",
            Self::Legal => {
                "Use strict, precise legal and policy language. Reference specific policies where applicable."
            }
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn join(set: &std::collections::BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Builds the provider prompt for an already-final decision.
#[must_use]
pub fn build_prompt(question: &str, decision: &Decision, entities: &Entities, role: Role, history: &[Turn]) -> String {
    let mut prompt = String::with_capacity(1_024);
    prompt.push_str("You are a helpful compliance assistant for marketplace sellers.\n");
    prompt.push_str(role.tone());
    prompt.push_str("\n\n");

    if !history.is_empty() {
        prompt.push_str("Earlier in this conversation:\n");
        for turn in history {
            let _ = writeln!(
                prompt,
                "- Q: {}\n  Decision: {}\n  A: {}",
                turn.question, turn.decision.status, turn.explanation
            );
        }
        prompt.push('\n');
    }

    let _ = writeln!(prompt, "The user asked: \"{}\"", question.trim());
    if !entities.brands.is_empty() {
        let _ = writeln!(prompt, "Brand detected: {}.", join(&entities.brands));
    }
    if !entities.products.is_empty() {
        let _ = writeln!(prompt, "Product detected: {}.", join(&entities.products));
    }
    if !entities.categories.is_empty() {
        let _ = writeln!(prompt, "Category detected: {}.", join(&entities.categories));
    }
    if !entities.countries.is_empty() {
        let _ = writeln!(prompt, "Country: {}.", join(&entities.countries));
    }

    let _ = write!(
        prompt,
        "\nCompliance Decision: {}\nPolicy Reason: {}\n\n\
         Provide a clear, helpful response that:\n\
         1. Clearly states whether the product can be listed or not\n\
         2. Explains the policy reason in simple terms\n\
         3. If restricted, explains what would be needed to comply\n\
         4. Offers helpful next steps if applicable\n\n\
         Keep your response concise but complete. The decision above is final; do not change it. \
         Do not invent policies or rules.",
        decision.status, decision.reason
    );
    prompt
}

/// Explanation built only from the decision, used when every provider
/// failed or none is configured.
#[must_use]
pub fn template_explanation(decision: &Decision, entities: &Entities) -> String {
    let reason = &decision.reason;
    let mut text = match decision.status {
        DecisionStatus::Allowed => format!("Great news! You can list this item. {reason}"),
        DecisionStatus::Restricted => format!("This item has some restrictions. {reason}"),
        DecisionStatus::Prohibited => format!("Unfortunately, this item cannot be listed. {reason}"),
        DecisionStatus::Blocked => format!("This listing is blocked. {reason}"),
    };

    let brand = decision
        .matched_brands()
        .next()
        .map(str::to_string)
        .or_else(|| entities.brands.iter().next().cloned());
    if let Some(brand) = brand {
        match decision.status {
            DecisionStatus::Restricted => {
                let _ = write!(text, " To sell {brand} products, you would need to become an authorized reseller.");
            }
            DecisionStatus::Blocked => {
                let _ = write!(text, " Items related to {brand} cannot be listed due to policy violations.");
            }
            DecisionStatus::Allowed | DecisionStatus::Prohibited => {}
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_store::{PolicyRule, RestrictedBrand, RuleStatus};
    use std::time::Instant;

    fn restricted_nike() -> Decision {
        Decision {
            status: DecisionStatus::Restricted,
            matched_rules: vec![PolicyRule::RestrictedBrand(RestrictedBrand {
                brand: "Nike".into(),
                category: None,
                country: Some("NG".into()),
                status: RuleStatus::Restricted,
                condition: None,
            })],
            reason: "Brand 'Nike' is restricted in NG. Authorization required".into(),
            snapshot_version: 2,
        }
    }

    #[test]
    fn role_parse_defaults_to_seller() {
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("legal"), Role::Legal);
        assert_eq!(Role::parse("buyer"), Role::Seller);
    }

    #[test]
    fn prompt_carries_decision_and_context() {
        let mut entities = Entities::default();
        entities.brands.insert("nike".into());
        entities.countries.insert("NG".into());
        let history = vec![Turn {
            question: "Can I sell Adidas?".into(),
            decision: Decision::allowed(2),
            explanation: "Yes.".into(),
            at: Instant::now(),
        }];

        let prompt = build_prompt("Can I sell Nike in Nigeria?", &restricted_nike(), &entities, Role::Legal, &history);
        assert!(prompt.contains("Compliance Decision: Restricted"));
        assert!(prompt.contains("Policy Reason: Brand 'Nike' is restricted in NG."));
        assert!(prompt.contains("Country: NG."));
        assert!(prompt.contains("Q: Can I sell Adidas?"));
        assert!(prompt.contains("precise legal"));
        assert!(prompt.contains("Do not invent policies or rules."));
    }

    #[test]
    fn template_adds_brand_guidance() {
        let text = template_explanation(&restricted_nike(), &Entities::default());
        assert_eq!(
            text,
            "This item has some restrictions. Brand 'Nike' is restricted in NG. Authorization required \
             To sell Nike products, you would need to become an authorized reseller."
        );
    }

    #[test]
    fn template_for_allowed_has_no_guidance() {
        let text = template_explanation(&Decision::allowed(1), &Entities::default());
        assert!(text.starts_with("Great news! You can list this item. No policy violations found."));
    }
}
