use super::*;
use market_core::testing::FakeMarketData;
use rust_decimal_macros::dec;

fn config() -> CollectorConfig {
    CollectorConfig {
        pace: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(1),
            multiplier: 1.0,
        },
        ..CollectorConfig::default()
    }
}

fn seed_symbol(fake: &FakeMarketData, symbol: &str) {
    fake.add_symbol(symbol, "USDT", "TRADING");
    fake.set_account_ratio(symbol, dec!(60), dec!(40));
    fake.set_position_ratio(symbol, dec!(55), dec!(45));
    fake.set_ticker(symbol, dec!(50000), dec!(1000000));
    fake.set_open_interest(symbol, dec!(2500));
    fake.set_funding_rate(symbol, dec!(0.0001));
}

#[tokio::test]
async fn sweep_persists_snapshots_and_registry() {
    let fake = Arc::new(FakeMarketData::new());
    seed_symbol(&fake, "BTCUSDT");
    seed_symbol(&fake, "ETHUSDT");
    // Non-USDT and non-trading symbols never enter the sweep.
    fake.add_symbol("BTCBUSD", "BUSD", "TRADING");
    fake.add_symbol("OLDUSDT", "USDT", "SETTLING");

    let store = Store::in_memory().await.unwrap();
    let collector = Collector::new(fake, store.clone(), config());

    let stats = collector
        .collect_all(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.total_symbols, 2);
    assert_eq!(stats.collected, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(store.active_pairs().await.unwrap().len(), 2);
    assert!(store.latest_snapshot("BTCUSDT").await.unwrap().is_some());
    assert!(store.latest_snapshot("BTCBUSD").await.unwrap().is_none());
}

#[tokio::test]
async fn excluded_pairs_are_skipped() {
    let fake = Arc::new(FakeMarketData::new());
    seed_symbol(&fake, "BTCUSDT");
    seed_symbol(&fake, "SHIBUSDT");

    let store = Store::in_memory().await.unwrap();
    let mut cfg = config();
    cfg.exclude_pairs = vec!["SHIBUSDT".into()];
    let collector = Collector::new(fake, store.clone(), cfg);

    let stats = collector
        .collect_all(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.total_symbols, 1);
    assert!(store.latest_snapshot("SHIBUSDT").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_position_ratio_degrades_quality_not_sweep() {
    let fake = Arc::new(FakeMarketData::new());
    seed_symbol(&fake, "BTCUSDT");
    fake.drop_position_ratio("BTCUSDT");

    let store = Store::in_memory().await.unwrap();
    let collector = Collector::new(fake, store.clone(), config());

    let stats = collector
        .collect_all(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.collected, 1);

    let snap = store.latest_snapshot("BTCUSDT").await.unwrap().unwrap();
    assert!(!snap.position_ratio_available);
    assert_eq!(snap.data_quality_score, dec!(80));
    assert_eq!(snap.long_position_ratio, dec!(0));
}

#[tokio::test]
async fn failing_symbol_is_skipped_and_counted() {
    let fake = Arc::new(FakeMarketData::new());
    seed_symbol(&fake, "BTCUSDT");
    seed_symbol(&fake, "ETHUSDT");
    fake.fail_symbol("ETHUSDT");

    let store = Store::in_memory().await.unwrap();
    let collector = Collector::new(fake, store.clone(), config());

    let stats = collector
        .collect_all(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.collected, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.failed_symbols, vec!["ETHUSDT".to_string()]);
    assert!(store.latest_snapshot("ETHUSDT").await.unwrap().is_none());
}

#[tokio::test]
async fn all_symbols_failing_is_an_error() {
    let fake = Arc::new(FakeMarketData::new());
    seed_symbol(&fake, "BTCUSDT");
    fake.fail_symbol("BTCUSDT");

    let store = Store::in_memory().await.unwrap();
    let collector = Collector::new(fake, store, config());

    assert!(collector.collect_all(&CancellationToken::new()).await.is_err());
}

#[tokio::test]
async fn empty_pair_set_is_not_an_error() {
    let fake = Arc::new(FakeMarketData::new());
    let store = Store::in_memory().await.unwrap();
    let collector = Collector::new(fake, store, config());

    let stats = collector
        .collect_all(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.total_symbols, 0);
}

#[tokio::test]
async fn delisted_pair_is_deactivated_on_next_sweep() {
    let fake = FakeMarketData::new();
    seed_symbol(&fake, "BTCUSDT");
    seed_symbol(&fake, "ETHUSDT");
    let fake = Arc::new(fake);

    let store = Store::in_memory().await.unwrap();
    let collector = Collector::new(Arc::clone(&fake) as Arc<dyn MarketDataSource>, store.clone(), config());
    collector.collect_all(&CancellationToken::new()).await.unwrap();
    assert_eq!(store.active_pairs().await.unwrap().len(), 2);

    // Second sweep against a fresh venue list without ETHUSDT.
    let fake2 = Arc::new(FakeMarketData::new());
    seed_symbol(&fake2, "BTCUSDT");
    let collector2 = Collector::new(fake2, store.clone(), config());
    collector2.collect_all(&CancellationToken::new()).await.unwrap();

    let active = store.active_pairs().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].symbol, "BTCUSDT");
}
