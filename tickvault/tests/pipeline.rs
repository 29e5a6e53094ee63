//! End-to-end pipeline behavior through the assembled collector.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tickvault::{CollectorBuilder, CollectorConfig, EventPayload, MarketEvent, Symbol, Trade};
use tickvault_mock::{MockArchive, MockProvider};

fn cfg_with_capacity(capacity: usize) -> CollectorConfig {
    let mut cfg = CollectorConfig::default();
    cfg.pipeline.capacity = capacity;
    cfg
}

fn trade(symbol: &str, sequence: u64, price: Decimal) -> MarketEvent {
    let now = Utc::now();
    MarketEvent {
        event_id: sequence,
        symbol: Symbol::new(symbol),
        exchange_ts: now,
        received_at: now,
        provider: tickvault::ProviderKey::new("mock"),
        sequence,
        payload: EventPayload::Trade(Trade { price, size: 100 }),
    }
}

#[tokio::test(start_paused = true)]
async fn backpressure_counts_drops_and_stores() {
    let provider = Arc::new(MockProvider::new("mock"));
    let archive = Arc::new(MockArchive::new());
    archive.set_write_delay(Some(Duration::from_millis(100)));

    let collector = CollectorBuilder::new()
        .config(cfg_with_capacity(4))
        .with_provider(provider.clone())
        .with_archive(archive.clone())
        .build()
        .unwrap();
    collector.start().await.unwrap();

    let mut alert_rx = collector.alerts().subscribe();

    // No await between publishes: the consumer cannot drain mid-loop, so the
    // queue fills deterministically.
    let mut accepted = 0;
    for i in 1..=10u64 {
        if provider.push_trade("AAPL", Decimal::new(185_25, 2), i) {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 4);

    collector.shutdown().await;

    let stats = collector.pipeline_stats().snapshot();
    assert_eq!(stats.published, 10);
    assert_eq!(stats.dropped, 6);
    assert_eq!(stats.stored, 4);
    assert_eq!(stats.peak_depth, 4);
    assert_eq!(archive.stored().len(), 4);

    let recon = collector.counters().snapshot();
    assert_eq!(recon.received, 10);
    assert_eq!(recon.pipeline_accepted, 4);
    assert_eq!(recon.pipeline_dropped, 6);
    assert_eq!(recon.stored, 4);
    assert_eq!(recon.residual(), 0);

    // One high-water warning per band crossing (70% and 90%), no repeats.
    let mut high_water = Vec::new();
    while let Ok(batch) = alert_rx.try_recv() {
        for item in batch.items {
            if item.title.starts_with("pipeline depth above") {
                high_water.push(item.title);
            }
        }
    }
    high_water.sort();
    assert_eq!(
        high_water,
        vec![
            "pipeline depth above 70%".to_string(),
            "pipeline depth above 90%".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn sink_sees_publish_order_per_symbol() {
    let provider = Arc::new(MockProvider::new("mock"));
    let archive = Arc::new(MockArchive::new());

    let collector = CollectorBuilder::new()
        .config(cfg_with_capacity(1000))
        .with_provider(provider.clone())
        .with_archive(archive.clone())
        .build()
        .unwrap();
    collector.start().await.unwrap();

    // Interleave two symbols, each with its own contiguous sequence.
    for i in 0..20u64 {
        let symbol = if i % 2 == 0 { "AAPL" } else { "MSFT" };
        let seq = i / 2 + 1;
        assert!(provider.push_event(trade(symbol, seq, Decimal::new(100, 0))));
    }
    collector.shutdown().await;

    let stored = archive.stored();
    for symbol in ["AAPL", "MSFT"] {
        let sequences: Vec<u64> = stored
            .iter()
            .filter(|e| e.symbol.as_str() == symbol)
            .map(|e| e.sequence)
            .collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted, "{symbol} out of publish order");
        assert_eq!(sequences.len(), 10);
    }
}

#[tokio::test(start_paused = true)]
async fn reconciliation_identity_under_mixed_traffic() {
    let provider = Arc::new(MockProvider::new("mock"));
    let archive = Arc::new(MockArchive::new());

    let collector = CollectorBuilder::new()
        .config(cfg_with_capacity(1000))
        .with_provider(provider.clone())
        .with_archive(archive.clone())
        .build()
        .unwrap();
    collector.start().await.unwrap();

    // Clean events.
    for seq in 1..=5u64 {
        provider.push_event(trade("AAPL", seq, Decimal::new(100, 0)));
    }
    // Exact duplicate of sequence 5: dropped as a duplicate.
    provider.push_event(trade("AAPL", 5, Decimal::new(100, 0)));
    // Sanity reject: non-positive price.
    provider.push_event(trade("AAPL", 6, Decimal::ZERO));
    // Sequence gap 5 -> 10: stored, plus a synthesized integrity event.
    provider.push_event(trade("AAPL", 10, Decimal::new(100, 0)));

    // Let the consumer drain while the pipeline still accepts, so the
    // synthesized integrity event is republished rather than dropped.
    tokio::time::sleep(Duration::from_millis(50)).await;
    collector.shutdown().await;

    let recon = collector.counters().snapshot();
    // 8 pushed + 1 engine-synthesized integrity event.
    assert_eq!(recon.received, 9);
    assert_eq!(recon.received_duplicates, 1);
    assert_eq!(recon.rejected, 1);
    // 5 clean + 1 gapped + 1 integrity stored.
    assert_eq!(recon.stored, 7);
    assert_eq!(recon.residual(), 0);

    let stored = archive.stored();
    assert_eq!(stored.len(), 7);
    assert!(
        stored
            .iter()
            .any(|e| e.kind() == tickvault::EventKind::Integrity)
    );
}

#[tokio::test(start_paused = true)]
async fn store_failures_are_counted_not_retried() {
    let provider = Arc::new(MockProvider::new("mock"));
    let archive = Arc::new(MockArchive::new());
    archive.set_fail_all(true);

    let collector = CollectorBuilder::new()
        .config(cfg_with_capacity(100))
        .with_provider(provider.clone())
        .with_archive(archive.clone())
        .build()
        .unwrap();
    collector.start().await.unwrap();

    for seq in 1..=3u64 {
        provider.push_trade("AAPL", Decimal::new(185_25, 2), seq);
    }
    collector.shutdown().await;

    let recon = collector.counters().snapshot();
    assert_eq!(recon.store_failed, 3);
    assert_eq!(recon.stored, 0);
    assert_eq!(recon.residual(), 0);
    assert!(archive.stored().is_empty());
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_abandons_remaining_as_store_failed() {
    let provider = Arc::new(MockProvider::new("mock"));
    let archive = Arc::new(MockArchive::new());
    // Each write takes 20 s against a 30 s drain budget: only one makes it.
    archive.set_write_delay(Some(Duration::from_secs(20)));

    let collector = CollectorBuilder::new()
        .config(cfg_with_capacity(100))
        .with_provider(provider.clone())
        .with_archive(archive.clone())
        .build()
        .unwrap();
    collector.start().await.unwrap();

    for seq in 1..=4u64 {
        provider.push_trade("AAPL", Decimal::new(185_25, 2), seq);
    }
    collector.shutdown().await;

    let recon = collector.counters().snapshot();
    assert_eq!(recon.stored + recon.store_failed, 4);
    assert!(recon.store_failed >= 1, "expected abandoned events");
    assert!(recon.stored >= 2, "expected some events to drain in budget");
    assert_eq!(recon.residual(), 0);
}
