//! Degradation scoring and failover selection across two providers.

use std::sync::Arc;
use std::time::Duration;

use tickvault::{CollectorBuilder, CollectorConfig, ProviderKey, Recommendation, SymbolSpec};
use tickvault_mock::{MockArchive, MockProvider, ProviderCall};

fn two_provider_collector() -> (Arc<MockProvider>, Arc<MockProvider>, tickvault::Collector) {
    let p = Arc::new(MockProvider::new("p"));
    let q = Arc::new(MockProvider::new("q"));
    let collector = CollectorBuilder::new()
        .config(CollectorConfig::default())
        .with_provider(p.clone())
        .with_provider(q.clone())
        .with_archive(Arc::new(MockArchive::new()))
        .build()
        .unwrap();
    (p, q, collector)
}

#[tokio::test(start_paused = true)]
async fn degraded_provider_scores_high_and_select_best_avoids_it() {
    let (_p, _q, collector) = two_provider_collector();
    collector.start().await.unwrap();

    let health = collector.health();
    let scorer = collector.scorer();
    let p = ProviderKey::new("p");
    let q = ProviderKey::new("q");

    // q: healthy and fast.
    health.mark_connected(&q);
    for _ in 0..50 {
        health.record_latency(&q, 50.0);
    }

    // p: slow, briefly disconnected (now down), with subscribe failures.
    health.mark_connected(&p);
    for _ in 0..50 {
        health.record_latency(&p, 1200.0);
    }
    health.mark_disconnected(&p);
    scorer.record_outcome(&p, false);
    scorer.record_outcome(&p, false);
    scorer.record_outcome(&p, true);

    let scores = scorer.evaluate(&health);
    let score_p = scores.iter().find(|s| s.provider == p).unwrap();
    let score_q = scores.iter().find(|s| s.provider == q).unwrap();

    assert!(score_p.composite >= 0.6, "p composite {}", score_p.composite);
    assert_eq!(score_p.recommendation, Recommendation::Unavailable);
    assert!(score_q.composite < 0.1, "q composite {}", score_q.composite);
    assert_eq!(score_q.recommendation, Recommendation::Healthy);

    assert_eq!(
        scorer.select_best(&[p.clone(), q.clone()], Some(&p)),
        Some(q.clone())
    );
    // Excluding the only healthy candidate leaves nothing.
    assert_eq!(scorer.select_best(&[p.clone()], None), None);
}

#[tokio::test(start_paused = true)]
async fn degraded_event_fires_once_and_recovery_needs_two_clean_passes() {
    let (_p, _q, collector) = two_provider_collector();
    collector.start().await.unwrap();

    let health = collector.health();
    let scorer = collector.scorer();
    let p = ProviderKey::new("p");
    let mut events = scorer.subscribe();

    // Disconnected: connection component alone crosses the 0.6 threshold
    // only with weight 0.35 < 0.6, so add latency pressure too.
    health.mark_connected(&p);
    for _ in 0..20 {
        health.record_latency(&p, 5000.0);
    }
    health.mark_disconnected(&p);

    scorer.evaluate(&health);
    scorer.evaluate(&health);
    let event = events.try_recv().expect("degraded event");
    assert!(matches!(
        event,
        tickvault::DegradationEvent::Degraded { .. }
    ));
    // Only the transition emits; the second evaluation is silent.
    assert!(events.try_recv().is_err());

    // Recovery: reconnect and wash out the latency window with fast samples.
    health.mark_connected(&p);
    for _ in 0..500 {
        health.record_latency(&p, 10.0);
    }
    scorer.evaluate(&health);
    assert!(events.try_recv().is_err(), "one clean pass is not recovery");
    scorer.evaluate(&health);
    let event = events.try_recv().expect("recovered event");
    assert!(matches!(
        event,
        tickvault::DegradationEvent::Recovered { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn degraded_active_provider_triggers_subscription_failover() {
    let (p, q, collector) = two_provider_collector();
    collector.start().await.unwrap();
    collector
        .apply_symbols(vec![SymbolSpec::equity("AAPL")])
        .await
        .unwrap();
    assert_eq!(p.calls().len(), 1);

    let health = collector.health();
    let scorer = collector.scorer();
    let key_p = ProviderKey::new("p");
    let key_q = ProviderKey::new("q");

    // q must have a live score to qualify as a failover target.
    health.mark_connected(&key_q);
    health.record_latency(&key_q, 20.0);
    health.mark_connected(&key_p);
    for _ in 0..20 {
        health.record_latency(&key_p, 5000.0);
    }
    health.mark_disconnected(&key_p);
    scorer.evaluate(&health);

    // Let the failover watcher react to the degraded event.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        collector.orchestrator().active_provider().await,
        Some(key_q)
    );
    assert!(
        q.calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::SubscribeTrades(_)))
    );

    collector.shutdown().await;
}
