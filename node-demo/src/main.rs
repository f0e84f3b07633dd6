#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

//! Demo REPL for the compliance node.
//!
//! Boots a `ComplianceNode` from `COMPLIANCE_CONFIG` (YAML, optional) plus
//! environment overrides, with a stand-in local model that paraphrases
//! the decision it is given. Type a question and press enter.
//!
//! Commands:
//! - `:stream <question>` streams the answer chunk by chunk;
//! - `:upload <file>` publishes a policy document (`.json`, `.yaml`);
//! - `:status`, `:health`, `:metrics`, `:clear`;
//! - `exit` or `quit`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use compliance_core::node::AskStreamEvent;
use compliance_core::{
    AskRequest, ComplianceError, ComplianceNode, GenerationParams, ModelProvider, ProviderError, ProviderTier,
    ServiceConfig, TextGenerator,
};

/// Policy used when no `policy_path` is configured.
const SAMPLE_POLICY: &str = r#"{
    "Blacklisted Words": [
        {"Keyword": "fake", "Severity": "high", "Description": "Counterfeit goods"},
        {"Keyword": "replica", "Severity": "medium"}
    ],
    "Restricted Brands": [
        {"Brand": "Nike", "Category": "Fashion", "Country": "NG", "Status": "restricted",
         "Condition": "Authorized resellers only"}
    ],
    "Prohibited Categories": [
        {"Keyword": "firearms and weapons", "Category": "Weapons", "Status": "prohibited",
         "Notes": "Not allowed on the marketplace"}
    ]
}"#;

/// Stand-in local model: restates the decision and reason from the prompt.
struct ParaphraseModel;

#[async_trait]
impl TextGenerator for ParaphraseModel {
    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String, ProviderError> {
        let field = |label: &str| {
            prompt
                .lines()
                .find_map(|line| line.strip_prefix(label))
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };
        let decision = field("Compliance Decision:");
        let reason = field("Policy Reason:");
        if decision.is_empty() {
            return Err(ProviderError::Failed("prompt without a decision".into()));
        }
        Ok(format!(
            "Decision: {decision}. {reason} If you have questions about this policy, contact marketplace support."
        ))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn build_node() -> Result<ComplianceNode> {
    let config_path = std::env::var_os("COMPLIANCE_CONFIG").map(PathBuf::from);
    let config = ServiceConfig::load(config_path.as_deref()).context("Unable to load configuration")?;
    let has_policy = config.policy_path.is_some();

    let providers = vec![Arc::new(ModelProvider::new(
        "paraphrase-local",
        ProviderTier::LocalPrimary,
        0,
        Arc::new(ParaphraseModel),
    ))];
    let node = ComplianceNode::bootstrap(config, providers)?;

    if !has_policy {
        node.upload_policy("sample.json", SAMPLE_POLICY.as_bytes())
            .context("Built-in sample policy is invalid")?;
        info!("no policy_path configured; loaded built-in sample policy");
    }
    Ok(node)
}

fn print_error(err: &ComplianceError) {
    warn!(retryable = err.is_retryable(), "request failed: {err}");
    eprintln!("error: {err}");
    if let Some(decision) = err.decision() {
        println!("Decision: {} ({})", decision.status, decision.reason);
    }
}

async fn ask(node: &ComplianceNode, question: &str) {
    match node.ask(AskRequest::new(question).in_session("repl")).await {
        Ok(answer) => {
            println!("---");
            println!("Decision: {}", answer.decision.status);
            println!("Reason: {}", answer.reason);
            println!(
                "Explanation ({}{}):\n{}\n",
                answer.explanation_source.as_str(),
                if answer.cached { ", cached" } else { "" },
                answer.explanation
            );
        }
        Err(err) => print_error(&err),
    }
}

async fn ask_stream(node: &ComplianceNode, question: &str) -> Result<()> {
    let mut events = match node.ask_stream(AskRequest::new(question).in_session("repl")).await {
        Ok(events) => events,
        Err(err) => {
            print_error(&err);
            return Ok(());
        }
    };
    let mut stdout = io::stdout();
    while let Some(event) = events.next().await {
        match event {
            AskStreamEvent::Decision { decision, .. } => {
                println!("---");
                println!("Decision: {}", decision.status);
                println!("Reason: {}", decision.reason);
            }
            AskStreamEvent::Content { chunk } => {
                print!("{chunk}");
                stdout.flush()?;
            }
            AskStreamEvent::Done {
                explanation_source,
                partial,
            } => {
                let note = if partial { ", incomplete" } else { "" };
                println!("\n[{}{note}]\n", explanation_source.as_str());
            }
        }
    }
    Ok(())
}

/// Publishes a policy file. Failures are reported and leave the REPL running.
fn upload(node: &ComplianceNode, path: &str) {
    let bytes = match std::fs::read(path).with_context(|| format!("Unable to read {path}")) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("upload failed: {err:#}");
            eprintln!("error: {err:#}");
            return;
        }
    };
    match node.upload_policy(path, &bytes) {
        Ok(report) => {
            info!(path, version = report.snapshot_version, "policy uploaded from REPL");
            println!(
                "Published snapshot v{} (keywords: {:?}, brands: {:?}, products: {:?})",
                report.snapshot_version, report.counts.keywords, report.counts.brands, report.counts.products
            );
        }
        Err(err) => print_error(&err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let node = build_node()?;
    info!(version = node.snapshot_version(), "compliance node ready");

    println!("Compliance assistant demo");
    println!("Ask a question, or type ':stream <question>', ':upload <file>', ':status', ':health', ':metrics', ':clear'.");
    println!("Type 'exit' or 'quit' to leave.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        print!("> ");
        stdout.flush()?;

        if stdin.read_line(&mut buffer)? == 0 {
            println!();
            break;
        }

        let line = buffer.trim();
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            (":stream", question) => ask_stream(&node, question).await?,
            (":upload", path) => upload(&node, path.trim()),
            (":status", _) => println!("{}", serde_json::to_string_pretty(&node.status())?),
            (":health", _) => println!("{}", serde_json::to_string_pretty(&node.health_detailed())?),
            (":metrics", _) => println!("{}", node.metrics_prometheus()),
            (":clear", _) => println!("Dropped {} cached answers", node.clear_cache()),
            _ => ask(&node, line).await,
        }
    }

    node.shutdown();
    info!("compliance node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_core::PolicyStore;

    fn demo_node() -> ComplianceNode {
        let node = ComplianceNode::new(ServiceConfig::default(), PolicyStore::default(), Vec::new());
        node.upload_policy("sample.json", SAMPLE_POLICY.as_bytes())
            .expect("sample policy");
        node
    }

    #[test]
    fn unreadable_upload_keeps_snapshot() {
        let node = demo_node();
        upload(&node, "/definitely/not/a/policy.json");
        assert_eq!(node.snapshot_version(), 1);
    }

    #[test]
    fn readable_upload_publishes() {
        let path = std::env::temp_dir().join(format!("demo-policy-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"Blacklisted Words": [{"Keyword": "bootleg", "Severity": "high"}]}"#)
            .expect("write policy");
        let node = demo_node();
        upload(&node, path.to_str().expect("utf-8 path"));
        let _ = std::fs::remove_file(&path);
        assert_eq!(node.snapshot_version(), 2);
    }

    #[tokio::test]
    async fn paraphrase_model_restates_decision() {
        let prompt = "Compliance Decision: RESTRICTED\nPolicy Reason: Nike is restricted in NG\n";
        let text = ParaphraseModel
            .generate(prompt, &GenerationParams::default())
            .await
            .expect("text");
        assert!(text.starts_with("Decision: RESTRICTED. Nike is restricted in NG"));
        assert!(ParaphraseModel.generate("nothing", &GenerationParams::default()).await.is_err());
    }
}
