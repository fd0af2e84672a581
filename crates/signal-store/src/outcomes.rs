use market_core::{SignalOutcome, StoreError};
use uuid::Uuid;

use crate::codec::{dec_to_db, flag_to_db, opt_dec_to_db, ts_to_db};
use crate::rows::OutcomeRow;
use crate::{is_unique_violation, map_sqlx_err, Store};

impl Store {
    /// Publish a terminal outcome. The unique key on `signal_id` makes a
    /// retried publication an idempotent no-op; returns whether the row was
    /// actually inserted.
    pub async fn insert_outcome(&self, outcome: &SignalOutcome) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO signal_outcomes (signal_id, outcome, max_favorable_move_pct, \
             max_adverse_move_pct, final_price_change_pct, hours_to_peak, hours_to_trough, \
             total_tracking_hours, profit_target_hit, stop_loss_hit, closed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(outcome.signal_id.to_string())
        .bind(outcome.outcome.as_str())
        .bind(dec_to_db(outcome.max_favorable_move_pct))
        .bind(dec_to_db(outcome.max_adverse_move_pct))
        .bind(dec_to_db(outcome.final_price_change_pct))
        .bind(opt_dec_to_db(outcome.hours_to_peak))
        .bind(opt_dec_to_db(outcome.hours_to_trough))
        .bind(dec_to_db(outcome.total_tracking_hours))
        .bind(flag_to_db(outcome.profit_target_hit))
        .bind(flag_to_db(outcome.stop_loss_hit))
        .bind(ts_to_db(outcome.closed_at))
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => {
                tracing::debug!(signal_id = %outcome.signal_id, "outcome already published");
                Ok(false)
            }
            Err(err) => Err(map_sqlx_err(err)),
        }
    }

    pub async fn outcome_for(&self, signal_id: Uuid) -> Result<Option<SignalOutcome>, StoreError> {
        let row: Option<OutcomeRow> =
            sqlx::query_as("SELECT * FROM signal_outcomes WHERE signal_id = ?")
                .bind(signal_id.to_string())
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_err)?;

        row.map(SignalOutcome::try_from).transpose()
    }
}
