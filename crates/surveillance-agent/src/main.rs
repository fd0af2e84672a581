use std::sync::Arc;

use analyzer::{Analyzer, AnalyzerConfig};
use anyhow::Result;
use binance_client::{BinanceClient, ClientOptions};
use chrono::{Duration as ChronoDuration, Utc};
use collector::{Collector, CollectorConfig, RetryPolicy};
use market_core::{MarketDataSource, Strategy};
use notifier::{ConsoleSink, Dispatcher, NotificationSink, TelegramSink, WebhookSink};
use signal_store::{PoolSettings, Store};
use signal_tracker::{Tracker, TrackerConfig};
use statistics::{Aggregator, AggregatorConfig, ChangeThresholds};
use strategies::{MinorityFollower, SmartMoneySfp, WhaleDivergence};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

mod config;
mod scheduler;
mod sinks;

use config::{event_kinds, AppConfig, LoggingSection};
use scheduler::{Cadence, Scheduler};
use sinks::DbSink;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, read the config document, fail fast on a bad one.
    dotenvy::dotenv().ok();
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CA_CONFIG").ok());

    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    // 2. Tracing before anything else can log.
    init_tracing(&config.logging, config.features.debug_signals);

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!(
        app = %config.app.name,
        version = %config.app.version,
        environment = %config.app.environment,
        "starting surveillance agent"
    );
    tracing::info!("  quote asset: {}", config.collection.quote_asset);
    tracing::info!(
        "  cooldown: {}h, concurrency cap: {} signals/pair",
        config.strategies.global.signal_cooldown_hours,
        config.strategies.global.max_concurrent_signals_per_pair
    );
    tracing::info!(
        "  collection '{}', analysis '{}', ticks '{}', bars '{}', statistics '{}'",
        config.collection.schedule,
        config.strategies.global.schedule,
        config.tracking.tick_schedule,
        config.tracking.kline_schedule,
        config.statistics.schedule
    );
    if config.features.dry_run {
        tracing::warn!("dry run enabled: signals will be evaluated but not persisted");
    }
    if config.features.backtest_mode {
        tracing::warn!("features.backtest_mode is reserved and has no effect");
    }

    // 3. Store: unreachable database at startup is fatal.
    let pool_settings = PoolSettings {
        max_connections: config.database.pool.max_connections,
        min_connections: config.database.pool.min_connections,
        max_lifetime: std::time::Duration::from_secs(config.database.pool.max_lifetime_secs),
    };
    let store = match Store::connect(&config.database.connection_url(), &pool_settings).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("database unreachable at startup: {e}");
            std::process::exit(1);
        }
    };
    store.ping().await?;
    tracing::info!("startup check: database OK");

    // 4. Venue client.
    let client = BinanceClient::new(ClientOptions {
        base_url: config.binance.base_url.clone(),
        api_key: config.binance.api_key.clone(),
        timeout: std::time::Duration::from_secs(config.binance.timeout_secs),
    })?;
    let source: Arc<dyn MarketDataSource> = Arc::new(client);

    // 5. Venue connectivity check (warn-only: the first sweep retries).
    match source.active_symbols().await {
        Ok(symbols) => tracing::info!(
            "startup check: venue OK ({} quoted contracts)",
            symbols.len()
        ),
        Err(e) => tracing::warn!("startup check: venue unreachable ({e}), sweeps will retry"),
    }

    // 6. Notification sinks.
    let mut sink_list: Vec<Box<dyn NotificationSink>> = vec![Box::new(DbSink::new(store.clone()))];
    sink_list.push(Box::new(ConsoleSink::new(
        config.notifications.console.enabled,
        event_kinds(&config.notifications.console.events),
    )));
    if config.notifications.telegram.enabled {
        sink_list.push(Box::new(TelegramSink::new(
            true,
            event_kinds(&config.notifications.telegram.events),
            config.notifications.telegram.bot_token.clone(),
            config.notifications.telegram.chat_id.clone(),
        )));
        tracing::info!("telegram notifications enabled");
    }
    if config.notifications.webhook.enabled {
        sink_list.push(Box::new(WebhookSink::new(
            true,
            event_kinds(&config.notifications.webhook.events),
            config.notifications.webhook.url.clone(),
        )));
        tracing::info!("webhook notifications enabled");
    }
    if config.notifications.email.enabled {
        tracing::warn!("email notifications are configured but no email channel is shipped");
    }
    let dispatcher = Dispatcher::new(sink_list);
    tracing::info!("{} notification sinks registered", dispatcher.sink_count());

    // 7. Strategy set.
    let strategy_list: Vec<Arc<dyn Strategy>> = vec![
        Arc::new(MinorityFollower::new(config.strategies.minority.clone())),
        Arc::new(WhaleDivergence::new(config.strategies.whale.clone())),
        Arc::new(SmartMoneySfp::new(
            config.strategies.smartmoney.clone(),
            Arc::clone(&source),
        )),
    ];
    let enabled_names: Vec<String> = strategy_list
        .iter()
        .filter(|s| s.enabled())
        .map(|s| s.name().to_string())
        .collect();
    tracing::info!(
        "strategies enabled: {}",
        if enabled_names.is_empty() {
            "<none>".to_string()
        } else {
            enabled_names.join(", ")
        }
    );

    // 8. Components.
    let collector = Arc::new(Collector::new(
        Arc::clone(&source),
        store.clone(),
        CollectorConfig {
            quote_asset: config.collection.quote_asset.clone(),
            exclude_pairs: config.collection.exclude_pairs.clone(),
            ratio_period: config.collection.ratio_period.clone(),
            pace: std::time::Duration::from_millis(config.collection.pace_ms),
            retry: RetryPolicy {
                max_attempts: config.collection.retry.max_attempts,
                delay: std::time::Duration::from_millis(config.collection.retry.delay_ms),
                multiplier: config.collection.retry.multiplier,
            },
        },
    ));

    let analyzer = Arc::new(Analyzer::new(
        store.clone(),
        strategy_list.clone(),
        dispatcher.clone(),
        AnalyzerConfig {
            min_volume_24h: config.strategies.global.min_volume_24h,
            max_concurrent_signals_per_pair: config
                .strategies
                .global
                .max_concurrent_signals_per_pair,
            signal_cooldown_hours: config.strategies.global.signal_cooldown_hours,
            snapshot_window_hours: config.strategies.global.snapshot_window_hours,
            dry_run: config.features.dry_run,
        },
    ));

    let tracker = Arc::new(Tracker::new(
        Arc::clone(&source),
        store.clone(),
        dispatcher.clone(),
        TrackerConfig {
            pace: std::time::Duration::from_millis(config.tracking.pace_ms),
            prefer_price_levels: config.tracking.prefer_price_levels,
            kline_interval: config.tracking.kline_interval.clone(),
            ..TrackerConfig::default()
        },
    ));

    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        dispatcher.clone(),
        enabled_names,
        AggregatorConfig {
            periods: config.statistics.periods.clone(),
            thresholds: ChangeThresholds {
                win_rate_pp: config.statistics.change_thresholds.win_rate,
                profitable_ratio_pp: config.statistics.change_thresholds.profitable_ratio,
                avg_profit_rel_pct: config.statistics.change_thresholds.avg_profit,
                avg_loss_rel_pct: config.statistics.change_thresholds.avg_loss,
                profit_factor_rel_pct: config.statistics.change_thresholds.profit_factor,
                signal_count_rel_pct: config.statistics.change_thresholds.signal_count,
            },
        },
    ));

    // 9. Scheduler wiring. Jobs run serially, each with a child token.
    let mut sched = Scheduler::new(dispatcher.clone());

    if config.collection.enabled {
        let job = Arc::clone(&collector);
        sched.register(
            "collector.collect_all",
            Cadence::parse(&config.collection.schedule)?,
            move |token| {
                let job = Arc::clone(&job);
                Box::pin(async move { job.collect_all(&token).await.map(|_| ()) })
            },
        );
    } else {
        tracing::warn!("collection disabled by config");
    }

    let job = Arc::clone(&analyzer);
    sched.register(
        "analyzer.analyze_all",
        Cadence::parse(&config.strategies.global.schedule)?,
        move |token| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                job.analyze_all(&token).await?;
                job.validate_pending_signals(&token).await.map(|_| ())
            })
        },
    );

    let job = Arc::clone(&tracker);
    sched.register(
        "tracker.track_all",
        Cadence::parse(&config.tracking.tick_schedule)?,
        move |token| {
            let job = Arc::clone(&job);
            Box::pin(async move { job.track_all(&token).await.map(|_| ()) })
        },
    );

    let job = Arc::clone(&tracker);
    sched.register(
        "tracker.track_all_klines",
        Cadence::parse(&config.tracking.kline_schedule)?,
        move |token| {
            let job = Arc::clone(&job);
            Box::pin(async move { job.track_all_klines(&token).await.map(|_| ()) })
        },
    );

    let job = Arc::clone(&aggregator);
    sched.register(
        "statistics.recalculate",
        Cadence::parse(&config.statistics.schedule)?,
        move |token| {
            let job = Arc::clone(&job);
            Box::pin(async move { job.recalculate_all(&token).await.map(|_| ()) })
        },
    );

    let retention_store = store.clone();
    let retention_days = config.collection.retention_days;
    sched.register(
        "store.prune_snapshots",
        Cadence::parse("daily@03:10")?,
        move |_token| {
            let store = retention_store.clone();
            Box::pin(async move {
                let cutoff = Utc::now() - ChronoDuration::days(retention_days);
                let pruned = store.prune_snapshots(cutoff).await?;
                tracing::info!(pruned, "snapshot retention sweep complete");
                Ok(())
            })
        },
    );

    // 10. Run until SIGINT/SIGTERM.
    let token = CancellationToken::new();
    spawn_shutdown_listener(token.clone());

    tracing::info!("{} jobs scheduled, agent running", sched.job_count());
    sched.run(token).await;

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingSection, debug_signals: bool) {
    let mut directive = logging.level.clone();
    if debug_signals {
        // Surface per-strategy decision logging.
        directive.push_str(",strategies=trace");
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));

    if logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                    token.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
            }
        }
        token.cancel();
    });
}
