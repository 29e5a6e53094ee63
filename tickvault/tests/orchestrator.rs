//! Subscription reconciliation against the scripted mock provider.

use std::sync::Arc;

use tickvault::{Channel, CollectorBuilder, CollectorConfig, Symbol, SymbolSpec};
use tickvault_mock::{MockArchive, MockProvider, ProviderCall};

fn collector_with(
    providers: &[Arc<MockProvider>],
) -> tickvault::Collector {
    let mut builder = CollectorBuilder::new()
        .config(CollectorConfig::default())
        .with_archive(Arc::new(MockArchive::new()));
    for p in providers {
        builder = builder.with_provider(p.clone());
    }
    builder.build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn diff_applies_removals_then_additions() {
    let provider = Arc::new(MockProvider::new("mock"));
    let collector = collector_with(&[provider.clone()]);
    collector.start().await.unwrap();

    // First pass: A with trades+depth(5), B with trades.
    collector
        .apply_symbols(vec![
            SymbolSpec::equity("A").with_depth(5),
            SymbolSpec::equity("B"),
        ])
        .await
        .unwrap();

    assert_eq!(
        provider.calls(),
        vec![
            ProviderCall::SubscribeTrades(Symbol::new("A")),
            ProviderCall::SubscribeDepth(Symbol::new("A"), 5),
            ProviderCall::SubscribeTrades(Symbol::new("B")),
        ]
    );
    provider.clear_calls();

    // Second pass: A drops depth, B leaves, C arrives.
    collector
        .apply_symbols(vec![SymbolSpec::equity("A"), SymbolSpec::equity("C")])
        .await
        .unwrap();

    let calls = provider.calls();
    // A's depth id was 2, B's trades id was 3 (mock ids are sequential).
    assert!(calls.contains(&ProviderCall::UnsubscribeDepth(2)));
    assert!(calls.contains(&ProviderCall::UnsubscribeTrades(3)));
    assert!(calls.contains(&ProviderCall::SubscribeTrades(Symbol::new("C"))));
    // A's unchanged trades subscription was not touched.
    assert!(!calls.contains(&ProviderCall::SubscribeTrades(Symbol::new("A"))));
    assert!(!calls.contains(&ProviderCall::UnsubscribeTrades(1)));

    let counts = collector.status().await.subscriptions;
    assert_eq!(counts.trades, 2);
    assert_eq!(counts.depth, 0);
    assert_eq!(counts.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn applying_the_same_set_twice_is_idempotent() {
    let provider = Arc::new(MockProvider::new("mock"));
    let collector = collector_with(&[provider.clone()]);
    collector.start().await.unwrap();

    let desired = vec![
        SymbolSpec::equity("A").with_depth(5),
        SymbolSpec::equity("B"),
    ];
    collector.apply_symbols(desired.clone()).await.unwrap();
    let rows_first = collector.orchestrator().rows().await;
    provider.clear_calls();

    collector.apply_symbols(desired).await.unwrap();
    assert!(provider.calls().is_empty(), "second apply must be a no-op");
    assert_eq!(collector.orchestrator().rows().await, rows_first);
}

#[tokio::test(start_paused = true)]
async fn failed_subscribe_leaves_sentinel_and_retries_on_next_apply() {
    let provider = Arc::new(MockProvider::new("mock"));
    provider.set_fail(Channel::Depth, true);
    let collector = collector_with(&[provider.clone()]);
    collector.start().await.unwrap();

    collector
        .apply_symbols(vec![SymbolSpec::equity("A").with_depth(5)])
        .await
        .unwrap();

    let counts = collector.orchestrator().counts().await;
    assert_eq!(counts.trades, 1);
    assert_eq!(counts.depth, 0);
    assert_eq!(counts.failed, 1);

    // Provider recovers; the same apply retries only the failed channel.
    provider.set_fail(Channel::Depth, false);
    provider.clear_calls();
    collector
        .apply_symbols(vec![SymbolSpec::equity("A").with_depth(5)])
        .await
        .unwrap();

    assert_eq!(
        provider.calls(),
        vec![ProviderCall::SubscribeDepth(Symbol::new("A"), 5)]
    );
    let counts = collector.orchestrator().counts().await;
    assert_eq!(counts.depth, 1);
    assert_eq!(counts.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn option_specs_use_the_option_trades_channel() {
    let provider = Arc::new(MockProvider::new("mock"));
    let collector = collector_with(&[provider.clone()]);
    collector.start().await.unwrap();

    let terms = tickvault_types::OptionTerms {
        strike: rust_decimal::Decimal::new(450, 0),
        right: tickvault_types::OptionRight::Call,
        expiry: chrono::NaiveDate::from_ymd_opt(2026, 12, 18).unwrap(),
    };
    collector
        .apply_symbols(vec![SymbolSpec::option("SPY261218C00450000", terms)])
        .await
        .unwrap();

    assert_eq!(
        provider.calls(),
        vec![ProviderCall::SubscribeOptionTrades(Symbol::new(
            "SPY261218C00450000"
        ))]
    );
    let counts = collector.orchestrator().counts().await;
    assert_eq!(counts.option_trades, 1);
    assert_eq!(counts.trades, 0);
    assert_eq!(counts.depth, 0);
}

#[tokio::test(start_paused = true)]
async fn subscribe_timeout_is_bounded_and_leaves_sentinel() {
    let provider = Arc::new(MockProvider::new("mock"));
    // Slower than the 10 s per-call bound.
    provider.set_subscribe_delay(Some(std::time::Duration::from_secs(30)));
    let collector = collector_with(&[provider.clone()]);
    collector.start().await.unwrap();

    collector
        .apply_symbols(vec![SymbolSpec::equity("A")])
        .await
        .unwrap();

    let counts = collector.orchestrator().counts().await;
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.trades, 0);
}

#[tokio::test(start_paused = true)]
async fn failover_moves_subscriptions_to_the_target() {
    let primary = Arc::new(MockProvider::new("primary"));
    let backup = Arc::new(MockProvider::new("backup"));
    let collector = collector_with(&[primary.clone(), backup.clone()]);
    collector.start().await.unwrap();

    collector
        .apply_symbols(vec![SymbolSpec::equity("A"), SymbolSpec::equity("B")])
        .await
        .unwrap();
    assert_eq!(primary.calls().len(), 2);
    assert!(backup.calls().is_empty());

    collector
        .orchestrator()
        .failover_to(&tickvault::ProviderKey::new("backup"))
        .await
        .unwrap();

    // Teardown hits the provider that held the ids; the resubscribes hit
    // the target.
    assert!(
        primary
            .calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::UnsubscribeTrades(_)))
    );
    let backup_calls = backup.calls();
    assert_eq!(
        backup_calls
            .iter()
            .filter(|c| matches!(c, ProviderCall::SubscribeTrades(_)))
            .count(),
        2
    );
    assert_eq!(
        collector.orchestrator().active_provider().await,
        Some(tickvault::ProviderKey::new("backup"))
    );
}

#[tokio::test(start_paused = true)]
async fn last_known_subscriptions_recover_after_a_crash() {
    let dir = tempfile::tempdir().unwrap();

    let first = Arc::new(MockProvider::new("mock"));
    let collector = CollectorBuilder::new()
        .config(CollectorConfig::default())
        .with_provider(first.clone())
        .with_archive(Arc::new(MockArchive::new()))
        .state_dir(dir.path())
        .build()
        .unwrap();
    collector.start().await.unwrap();
    collector
        .apply_symbols(vec![SymbolSpec::equity("AAPL")])
        .await
        .unwrap();
    // Crash: dropped without a graceful shutdown, state file left behind.
    drop(collector);

    let second = Arc::new(MockProvider::new("mock"));
    let collector = CollectorBuilder::new()
        .config(CollectorConfig::default())
        .with_provider(second.clone())
        .with_archive(Arc::new(MockArchive::new()))
        .state_dir(dir.path())
        .build()
        .unwrap();
    // No symbols configured: startup resubscribes the persisted set.
    collector.start().await.unwrap();
    assert_eq!(
        second.calls(),
        vec![ProviderCall::SubscribeTrades(Symbol::new("AAPL"))]
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_spec_is_rejected_up_front() {
    let provider = Arc::new(MockProvider::new("mock"));
    let collector = collector_with(&[provider.clone()]);
    collector.start().await.unwrap();

    let mut bad = SymbolSpec::equity("A");
    bad.subscribe_depth = true; // zero levels
    let err = collector.apply_symbols(vec![bad]).await.unwrap_err();
    assert!(matches!(err, tickvault::VaultError::InvalidArg(_)));
    assert!(provider.calls().is_empty());
}
