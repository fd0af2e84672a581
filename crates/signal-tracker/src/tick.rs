use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use market_core::{
    direction_change_pct, hours_between, ExitReason, OutcomeKind, Signal, SignalDirection,
    SignalOutcome, SignalStatus, SignalTracking,
};
use notifier::Event;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::Tracker;

/// Counters for one tick pass.
#[derive(Debug, Default, Clone)]
pub struct TickStats {
    pub tracked: usize,
    pub closed: usize,
    pub skipped: usize,
}

impl Tracker {
    /// One tick pass over the union of CONFIRMED and TRACKING signals.
    pub async fn track_all(&self, token: &CancellationToken) -> Result<TickStats> {
        let signals = self
            .store
            .signals_to_track()
            .await
            .context("loading signals to track")?;

        let mut stats = TickStats::default();
        // One price fetch per symbol per pass; signals share it.
        let mut price_cache: HashMap<String, Decimal> = HashMap::new();
        let mut fetched_any = false;

        for mut signal in signals {
            if token.is_cancelled() {
                bail!("tick pass cancelled");
            }

            let price = match price_cache.get(&signal.symbol) {
                Some(price) => *price,
                None => {
                    if fetched_any && !self.config.pace.is_zero() {
                        tokio::time::sleep(self.config.pace).await;
                    }
                    fetched_any = true;
                    match self.source.price(&signal.symbol).await {
                        Ok(price) => {
                            price_cache.insert(signal.symbol.clone(), price);
                            price
                        }
                        Err(e) => {
                            tracing::warn!(symbol = %signal.symbol, "price fetch failed: {e}");
                            stats.skipped += 1;
                            continue;
                        }
                    }
                }
            };

            if price.is_zero() {
                tracing::warn!(
                    symbol = %signal.symbol,
                    signal_id = %signal.signal_id,
                    "zero price at tracking time, signal left in place"
                );
                stats.skipped += 1;
                continue;
            }

            let now = Utc::now();
            let tracking = self.extend_tracking(&signal, price, now).await?;
            self.store
                .insert_tracking(&tracking)
                .await
                .context("persisting tracking row")?;

            if signal.status == SignalStatus::Confirmed {
                signal.begin_tracking()?;
                self.store.update_signal(&signal).await?;
            }
            stats.tracked += 1;

            if let Some(reason) = self.close_test(&signal, price, tracking.price_change_pct, now) {
                self.close_signal(&mut signal, price, reason, &tracking, now)
                    .await?;
                stats.closed += 1;
            }
        }

        tracing::info!(
            tracked = stats.tracked,
            closed = stats.closed,
            skipped = stats.skipped,
            "tick pass complete"
        );

        Ok(stats)
    }

    /// Build the next tracking row, carrying the prior row's peak/trough
    /// forward. Peaks and troughs live in direction-aware change space, so
    /// the peak of a SHORT is its lowest traded price.
    async fn extend_tracking(
        &self,
        signal: &Signal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SignalTracking> {
        let change = direction_change_pct(signal.direction, signal.price_at_signal, price);
        let prior = self
            .store
            .latest_tracking(signal.signal_id)
            .await
            .context("loading prior tracking row")?;

        let mut tracking = SignalTracking {
            signal_id: signal.signal_id,
            tracked_at: now,
            current_price: price,
            price_change_pct: change,
            highest_price: price,
            highest_price_pct: change,
            highest_price_at: now,
            lowest_price: price,
            lowest_price_pct: change,
            lowest_price_at: now,
            hours_elapsed: hours_between(signal.generated_at, now),
        };

        if let Some(prior) = prior {
            if prior.highest_price_pct >= change {
                tracking.highest_price = prior.highest_price;
                tracking.highest_price_pct = prior.highest_price_pct;
                tracking.highest_price_at = prior.highest_price_at;
            }
            if prior.lowest_price_pct <= change {
                tracking.lowest_price = prior.lowest_price;
                tracking.lowest_price_pct = prior.lowest_price_pct;
                tracking.lowest_price_at = prior.lowest_price_at;
            }
        }

        Ok(tracking)
    }

    /// SL, then TP, then timeout. Explicit price levels win over the
    /// percentage rules unless configured otherwise.
    fn close_test(
        &self,
        signal: &Signal,
        price: Decimal,
        change: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        let stop_hit = match signal.stop_loss_price {
            Some(stop) if self.config.prefer_price_levels => match signal.direction {
                SignalDirection::Long => price <= stop,
                SignalDirection::Short => price >= stop,
            },
            _ => change <= -self.stop_loss_pct(signal),
        };
        if stop_hit {
            return Some(ExitReason::StopLoss);
        }

        let target_hit = match signal.target_price_2 {
            Some(target) if self.config.prefer_price_levels => match signal.direction {
                SignalDirection::Long => price >= target,
                SignalDirection::Short => price <= target,
            },
            _ => change >= self.profit_target_pct(signal),
        };
        if target_hit {
            return Some(ExitReason::TakeProfit);
        }

        if now - signal.generated_at >= Duration::hours(self.tracking_hours(signal)) {
            return Some(ExitReason::Time);
        }

        None
    }

    /// Outcome publication precedes the status transition; the unique key on
    /// the outcome table keeps a replay idempotent.
    async fn close_signal(
        &self,
        signal: &mut Signal,
        price: Decimal,
        reason: ExitReason,
        final_tracking: &SignalTracking,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = derive_outcome(
            signal,
            final_tracking,
            self.profit_target_pct(signal),
            self.stop_loss_pct(signal),
            reason,
            now,
        );

        self.store
            .insert_outcome(&outcome)
            .await
            .context("publishing outcome")?;

        signal.close(price, reason)?;
        self.store.update_signal(signal).await?;

        self.dispatcher
            .dispatch(&Event::signal_outcome(signal, &outcome))
            .await;

        tracing::info!(
            symbol = %signal.symbol,
            signal_id = %signal.signal_id,
            exit = reason.as_str(),
            outcome = outcome.outcome.as_str(),
            final_change = %outcome.final_price_change_pct,
            "signal closed"
        );

        Ok(())
    }
}

/// Classify a closed signal from its final tracking row and thresholds.
pub fn derive_outcome(
    signal: &Signal,
    final_tracking: &SignalTracking,
    profit_target_pct: Decimal,
    stop_loss_pct: Decimal,
    exit_reason: ExitReason,
    closed_at: DateTime<Utc>,
) -> SignalOutcome {
    let final_change = final_tracking.price_change_pct;

    let outcome = if final_change >= profit_target_pct {
        OutcomeKind::Profit
    } else if final_change <= -stop_loss_pct {
        OutcomeKind::Loss
    } else if final_change > Decimal::ZERO {
        OutcomeKind::Profit
    } else if final_change < Decimal::ZERO {
        OutcomeKind::Loss
    } else if exit_reason == ExitReason::Time {
        OutcomeKind::Timeout
    } else {
        OutcomeKind::Neutral
    };

    SignalOutcome {
        signal_id: signal.signal_id,
        outcome,
        max_favorable_move_pct: final_tracking.highest_price_pct,
        max_adverse_move_pct: final_tracking.lowest_price_pct,
        final_price_change_pct: final_change,
        hours_to_peak: Some(hours_between(
            signal.generated_at,
            final_tracking.highest_price_at,
        )),
        hours_to_trough: Some(hours_between(
            signal.generated_at,
            final_tracking.lowest_price_at,
        )),
        total_tracking_hours: hours_between(signal.generated_at, closed_at),
        profit_target_hit: final_tracking.highest_price_pct >= profit_target_pct,
        stop_loss_hit: final_tracking.lowest_price_pct <= -stop_loss_pct,
        closed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::testing::FakeMarketData;
    use market_core::MarketDataSource;
    use notifier::Dispatcher;
    use rust_decimal_macros::dec;
    use signal_store::Store;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn confirmed_signal(
        symbol: &str,
        direction: SignalDirection,
        entry: Decimal,
        target_pct: &str,
        stop_pct: &str,
    ) -> Signal {
        let mut signal = Signal::pending(
            symbol,
            direction,
            "minority_follower",
            Utc::now() - Duration::hours(2),
            entry,
            (dec!(80), dec!(20), dec!(55), dec!(45)),
            1,
            "test".into(),
            BTreeMap::from([
                ("profit_target_pct".to_string(), target_pct.to_string()),
                ("stop_loss_pct".to_string(), stop_pct.to_string()),
                ("tracking_hours".to_string(), "48".to_string()),
            ]),
        );
        signal.confirm(Utc::now() - Duration::hours(1)).unwrap();
        signal
    }

    async fn tracker_with(store: &Store, fake: Arc<FakeMarketData>) -> Tracker {
        Tracker::new(
            fake as Arc<dyn MarketDataSource>,
            store.clone(),
            Dispatcher::new(Vec::new()),
            crate::TrackerConfig {
                pace: std::time::Duration::ZERO,
                ..crate::TrackerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn long_reaches_take_profit() {
        let store = Store::in_memory().await.unwrap();
        let fake = Arc::new(FakeMarketData::new());
        fake.set_price_path("BTCUSDT", &[dec!(101), dec!(103), dec!(106), dec!(104)]);

        let signal = confirmed_signal("BTCUSDT", SignalDirection::Long, dec!(100), "5", "2");
        store.insert_signal(&signal).await.unwrap();

        let tracker = tracker_with(&store, fake).await;
        let token = CancellationToken::new();

        // 101: first touch moves CONFIRMED -> TRACKING, no close.
        let stats = tracker.track_all(&token).await.unwrap();
        assert_eq!((stats.tracked, stats.closed), (1, 0));
        // 103: still short of the 5% target.
        let stats = tracker.track_all(&token).await.unwrap();
        assert_eq!(stats.closed, 0);
        // 106: target hit, signal closes in profit.
        let stats = tracker.track_all(&token).await.unwrap();
        assert_eq!(stats.closed, 1);

        let outcome = store.outcome_for(signal.signal_id).await.unwrap().unwrap();
        assert_eq!(outcome.outcome, OutcomeKind::Profit);
        assert!(outcome.profit_target_hit);
        assert_eq!(outcome.final_price_change_pct, dec!(6));
        assert!(!outcome.stop_loss_hit);

        // The 104 tick never happens: nothing is left to track.
        let stats = tracker.track_all(&token).await.unwrap();
        assert_eq!(stats.tracked, 0);
    }

    #[tokio::test]
    async fn short_percentage_stop_loss() {
        let store = Store::in_memory().await.unwrap();
        let fake = Arc::new(FakeMarketData::new());
        // Price rises against the short: -2.5% direction-aware.
        fake.set_price_path("ETHUSDT", &[dec!(2562.5)]);

        let signal = confirmed_signal("ETHUSDT", SignalDirection::Short, dec!(2500), "5", "2");
        store.insert_signal(&signal).await.unwrap();

        let tracker = tracker_with(&store, fake).await;
        let stats = tracker.track_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.closed, 1);

        let outcome = store.outcome_for(signal.signal_id).await.unwrap().unwrap();
        assert_eq!(outcome.outcome, OutcomeKind::Loss);
        assert!(outcome.stop_loss_hit);
        assert_eq!(outcome.final_price_change_pct, dec!(-2.5));
    }

    #[tokio::test]
    async fn explicit_price_levels_win_over_percent_rules() {
        let store = Store::in_memory().await.unwrap();
        let fake = Arc::new(FakeMarketData::new());
        // -3% against the short would trip the 2% percentage stop, but the
        // explicit stop at 107 has not been touched.
        fake.set_price_path("BTCUSDT", &[dec!(103)]);

        let mut signal = confirmed_signal("BTCUSDT", SignalDirection::Short, dec!(100), "5", "2");
        signal.stop_loss_price = Some(dec!(107));
        signal.target_price_2 = Some(dec!(79));
        store.insert_signal(&signal).await.unwrap();

        let tracker = tracker_with(&store, fake).await;
        let stats = tracker.track_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.closed, 0);

        let tracked = store.signals_to_track().await.unwrap();
        assert_eq!(tracked[0].status, SignalStatus::Tracking);
    }

    #[tokio::test]
    async fn explicit_stop_closes_short_on_touch() {
        let store = Store::in_memory().await.unwrap();
        let fake = Arc::new(FakeMarketData::new());
        fake.set_price_path("BTCUSDT", &[dec!(107.2)]);

        let mut signal = confirmed_signal("BTCUSDT", SignalDirection::Short, dec!(100), "5", "2");
        signal.stop_loss_price = Some(dec!(107));
        signal.target_price_2 = Some(dec!(79));
        store.insert_signal(&signal).await.unwrap();

        let tracker = tracker_with(&store, fake).await;
        let stats = tracker.track_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.closed, 1);

        let outcome = store.outcome_for(signal.signal_id).await.unwrap().unwrap();
        assert_eq!(outcome.outcome, OutcomeKind::Loss);
    }

    #[tokio::test]
    async fn timeout_closes_stale_signal() {
        let store = Store::in_memory().await.unwrap();
        let fake = Arc::new(FakeMarketData::new());
        fake.set_price_path("BTCUSDT", &[dec!(100.5)]);

        let mut signal = confirmed_signal("BTCUSDT", SignalDirection::Long, dec!(100), "5", "2");
        signal.generated_at = Utc::now() - Duration::hours(50);
        signal.confirmation_start = signal.generated_at;
        signal.confirmation_end = signal.generated_at + Duration::hours(1);
        store.insert_signal(&signal).await.unwrap();

        let tracker = tracker_with(&store, fake).await;
        let stats = tracker.track_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.closed, 1);

        let outcome = store.outcome_for(signal.signal_id).await.unwrap().unwrap();
        // +0.5% at timeout: profit by sign.
        assert_eq!(outcome.outcome, OutcomeKind::Profit);
        assert!(!outcome.profit_target_hit);
        assert!(outcome.total_tracking_hours >= dec!(50));
    }

    #[tokio::test]
    async fn peak_and_trough_carry_forward() {
        let store = Store::in_memory().await.unwrap();
        let fake = Arc::new(FakeMarketData::new());
        fake.set_price_path("BTCUSDT", &[dec!(104), dec!(99), dec!(101)]);

        let signal = confirmed_signal("BTCUSDT", SignalDirection::Long, dec!(100), "50", "50");
        store.insert_signal(&signal).await.unwrap();

        let tracker = tracker_with(&store, fake).await;
        let token = CancellationToken::new();
        tracker.track_all(&token).await.unwrap();
        tracker.track_all(&token).await.unwrap();
        tracker.track_all(&token).await.unwrap();

        let latest = store.latest_tracking(signal.signal_id).await.unwrap().unwrap();
        assert_eq!(latest.price_change_pct, dec!(1));
        assert_eq!(latest.highest_price_pct, dec!(4));
        assert_eq!(latest.highest_price, dec!(104));
        assert_eq!(latest.lowest_price_pct, dec!(-1));
        assert_eq!(latest.lowest_price, dec!(99));
    }

    #[tokio::test]
    async fn zero_price_leaves_signal_in_place() {
        let store = Store::in_memory().await.unwrap();
        let fake = Arc::new(FakeMarketData::new());
        fake.set_price_path("BTCUSDT", &[dec!(0)]);

        let signal = confirmed_signal("BTCUSDT", SignalDirection::Long, dec!(100), "5", "2");
        store.insert_signal(&signal).await.unwrap();

        let tracker = tracker_with(&store, fake).await;
        let stats = tracker.track_all(&CancellationToken::new()).await.unwrap();
        assert_eq!((stats.tracked, stats.skipped), (0, 1));
        assert_eq!(store.signals_to_track().await.unwrap().len(), 1);
    }

    #[test]
    fn short_timeout_flat_is_timeout_outcome() {
        let signal = confirmed_signal("BTCUSDT", SignalDirection::Short, dec!(100), "5", "2");
        let now = Utc::now();
        let tracking = SignalTracking {
            signal_id: signal.signal_id,
            tracked_at: now,
            current_price: dec!(100),
            price_change_pct: dec!(0),
            highest_price: dec!(98),
            highest_price_pct: dec!(2),
            highest_price_at: now,
            lowest_price: dec!(101),
            lowest_price_pct: dec!(-1),
            lowest_price_at: now,
            hours_elapsed: dec!(48),
        };

        let outcome = derive_outcome(&signal, &tracking, dec!(5), dec!(2), ExitReason::Time, now);
        assert_eq!(outcome.outcome, OutcomeKind::Timeout);
        assert_eq!(outcome.max_favorable_move_pct, dec!(2));
        assert_eq!(outcome.max_adverse_move_pct, dec!(-1));
    }
}
