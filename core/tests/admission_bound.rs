//! Concurrency properties of the explanation step under bursts of callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Barrier;

use compliance_core::{
    AskRequest, ComplianceError, ComplianceNode, GenerationParams, ModelProvider, OverloadReason, PolicyStore,
    ProviderError, ProviderTier, ServiceConfig, TextGenerator,
};

/// Sleeps while tracking how many calls overlap.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    hold: Duration,
}

#[async_trait]
impl TextGenerator for InFlight {
    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String, ProviderError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok("ok".into())
    }
}

fn node(max_concurrent: usize, overload_threshold: usize, hold: Duration) -> (Arc<ComplianceNode>, Arc<InFlight>) {
    let mut config = ServiceConfig::default();
    config.inference.max_concurrent_requests = max_concurrent;
    config.inference.overload_threshold = overload_threshold;
    let generator = Arc::new(InFlight {
        hold,
        ..InFlight::default()
    });
    let provider = Arc::new(ModelProvider::new(
        "local",
        ProviderTier::LocalPrimary,
        0,
        Arc::clone(&generator) as Arc<dyn TextGenerator>,
    ));
    let node = ComplianceNode::new(config, PolicyStore::default(), vec![provider]);
    (Arc::new(node), generator)
}

async fn burst(node: &Arc<ComplianceNode>, callers: usize) -> Vec<Result<(), ComplianceError>> {
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|i| {
            let node = Arc::clone(node);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                // distinct questions so every caller misses the cache
                node.ask(AskRequest::new(format!("question number {i}")))
                    .await
                    .map(|_| ())
            })
        })
        .collect();

    let mut results = Vec::with_capacity(callers);
    for handle in handles {
        results.push(handle.await.expect("task panicked"));
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_five_provider_calls_in_flight() {
    let (node, generator) = node(5, 80, Duration::from_millis(50));

    let results = burst(&node, 10).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 10);
    let peak = generator.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight was {peak}");
    assert_eq!(node.status().orchestrator.admission.active, 0);
    assert_eq!(node.status().orchestrator.admission.queue_depth, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_queue_sheds_and_still_returns_decisions() {
    let (node, generator) = node(1, 2, Duration::from_millis(100));

    let results = burst(&node, 10).await;

    let mut admitted = 0;
    let mut shed = 0;
    for result in &results {
        match result {
            Ok(()) => admitted += 1,
            Err(err) => {
                assert!(
                    matches!(err, ComplianceError::Overloaded { reason: OverloadReason::QueueFull { .. }, .. }),
                    "unexpected error: {err}"
                );
                assert!(err.is_retryable());
                assert!(err.decision().is_some(), "shed request lost its decision");
                shed += 1;
            }
        }
    }

    assert_eq!(admitted + shed, 10);
    assert!(shed >= 1);
    assert!(admitted >= 1);
    assert_eq!(generator.peak.load(Ordering::SeqCst), 1);
    assert_eq!(generator.calls.load(Ordering::SeqCst), admitted);

    let metrics = node.metrics();
    assert_eq!(metrics.overloaded_requests, shed as u64);
    assert_eq!(node.status().orchestrator.admission.shed_total, shed as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_requests_time_out_without_dispatch() {
    let mut config = ServiceConfig::default();
    config.inference.max_concurrent_requests = 1;
    config.inference.request_timeout_secs = 1;
    let generator = Arc::new(InFlight {
        hold: Duration::from_millis(1_500),
        ..InFlight::default()
    });
    let provider = Arc::new(ModelProvider::new(
        "local",
        ProviderTier::LocalPrimary,
        0,
        Arc::clone(&generator) as Arc<dyn TextGenerator>,
    ));
    let node = Arc::new(ComplianceNode::new(config, PolicyStore::default(), vec![provider]));

    let results = burst(&node, 2).await;
    let timed_out = results
        .iter()
        .filter(|r| matches!(r, Err(ComplianceError::Overloaded { reason: OverloadReason::QueueTimeout { .. }, .. })))
        .count();

    assert_eq!(timed_out, 1);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}
