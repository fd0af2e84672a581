//! Wall-clock-aligned serial job driver.
//!
//! The corpus of one process, one loop: each job carries a [`Cadence`]
//! parsed from the config document, the scheduler sleeps to the earliest
//! next fire time with second precision and runs due jobs one after another.
//! A failing job logs, emits a `system_error` event and never blocks the
//! next job.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use notifier::{Dispatcher, Event};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// When a job may fire. Covers the whole §-table of cadences the agent
/// schedules: `hourly`, `hourly+5m`, `every 15m`, `every 6h`,
/// `daily@03:10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// On the hour, plus an offset in minutes.
    Hourly { offset_minutes: i64 },
    /// Every N minutes, anchored at midnight UTC.
    EveryMinutes { minutes: i64 },
    /// Every N hours, anchored at midnight UTC.
    EveryHours { hours: i64 },
    /// Once a day at a fixed UTC time.
    Daily { hour: u32, minute: u32 },
}

impl Cadence {
    /// Parse the compact schedule grammar used by the config document.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();

        if raw == "hourly" {
            return Ok(Cadence::Hourly { offset_minutes: 0 });
        }
        if let Some(offset) = raw.strip_prefix("hourly+") {
            let minutes = parse_minutes(offset)?;
            if !(0..60).contains(&minutes) {
                bail!("hourly offset '{offset}' must be under an hour");
            }
            return Ok(Cadence::Hourly {
                offset_minutes: minutes,
            });
        }
        if let Some(interval) = raw.strip_prefix("every ") {
            if let Some(minutes) = interval.strip_suffix('m') {
                let minutes: i64 = minutes
                    .parse()
                    .map_err(|_| anyhow::anyhow!("bad interval '{interval}'"))?;
                if minutes < 1 {
                    bail!("interval '{interval}' must be at least one minute");
                }
                return Ok(Cadence::EveryMinutes { minutes });
            }
            if let Some(hours) = interval.strip_suffix('h') {
                let hours: i64 = hours
                    .parse()
                    .map_err(|_| anyhow::anyhow!("bad interval '{interval}'"))?;
                if hours < 1 {
                    bail!("interval '{interval}' must be at least one hour");
                }
                return Ok(Cadence::EveryHours { hours });
            }
            bail!("interval '{interval}' needs an 'm' or 'h' suffix");
        }
        if let Some(time) = raw.strip_prefix("daily@") {
            let (hour, minute) = time
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("daily time '{time}' must be HH:MM"))?;
            let hour: u32 = hour
                .parse()
                .map_err(|_| anyhow::anyhow!("bad hour in '{time}'"))?;
            let minute: u32 = minute
                .parse()
                .map_err(|_| anyhow::anyhow!("bad minute in '{time}'"))?;
            if hour > 23 || minute > 59 {
                bail!("daily time '{time}' out of range");
            }
            return Ok(Cadence::Daily { hour, minute });
        }

        bail!("unrecognized schedule '{raw}'");
    }

    /// The first fire time strictly after `after`, to the second.
    pub fn next_fire(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let after = after.duration_trunc(Duration::seconds(1)).unwrap_or(after);
        match *self {
            Cadence::Hourly { offset_minutes } => {
                let base = after.duration_trunc(Duration::hours(1)).unwrap_or(after)
                    + Duration::minutes(offset_minutes);
                if base > after {
                    base
                } else {
                    base + Duration::hours(1)
                }
            }
            Cadence::EveryMinutes { minutes } => {
                aligned_step(after, Duration::minutes(minutes))
            }
            Cadence::EveryHours { hours } => aligned_step(after, Duration::hours(hours)),
            Cadence::Daily { hour, minute } => {
                let today = after
                    .duration_trunc(Duration::days(1))
                    .unwrap_or(after)
                    .with_hour(hour)
                    .and_then(|t| t.with_minute(minute))
                    .unwrap_or(after);
                if today > after {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
        }
    }
}

/// Next midnight-anchored multiple of `step` strictly after `after`.
fn aligned_step(after: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let midnight = after.duration_trunc(Duration::days(1)).unwrap_or(after);
    let elapsed = (after - midnight).num_seconds();
    let step_secs = step.num_seconds();
    let intervals = elapsed / step_secs + 1;
    midnight + Duration::seconds(intervals * step_secs)
}

fn parse_minutes(raw: &str) -> Result<i64> {
    let digits = raw
        .strip_suffix('m')
        .ok_or_else(|| anyhow::anyhow!("offset '{raw}' needs an 'm' suffix"))?;
    digits
        .parse()
        .map_err(|_| anyhow::anyhow!("bad offset '{raw}'"))
}

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type JobFn = Box<dyn Fn(CancellationToken) -> JobFuture + Send>;

pub struct Job {
    name: &'static str,
    cadence: Cadence,
    next_fire: DateTime<Utc>,
    run: JobFn,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    dispatcher: Dispatcher,
}

impl Scheduler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            jobs: Vec::new(),
            dispatcher,
        }
    }

    pub fn register<F>(&mut self, name: &'static str, cadence: Cadence, run: F)
    where
        F: Fn(CancellationToken) -> JobFuture + Send + 'static,
    {
        let next_fire = cadence.next_fire(Utc::now());
        tracing::info!(job = name, ?cadence, first_fire = %next_fire, "job registered");
        self.jobs.push(Job {
            name,
            cadence,
            next_fire,
            run: Box::new(run),
        });
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Drive the registered jobs until the token trips. Jobs run serially;
    /// a job observes cancellation at its own suspension points.
    pub async fn run(&mut self, token: CancellationToken) {
        if self.jobs.is_empty() {
            tracing::warn!("scheduler started with no jobs");
            return;
        }

        loop {
            let now = Utc::now();
            let next = self
                .jobs
                .iter()
                .map(|j| j.next_fire)
                .min()
                .expect("at least one job");

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("scheduler draining after cancellation");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let now = Utc::now();
            for job in self.jobs.iter_mut() {
                if job.next_fire > now {
                    continue;
                }
                if token.is_cancelled() {
                    return;
                }

                tracing::debug!(job = job.name, "job starting");
                let started = std::time::Instant::now();
                match (job.run)(token.child_token()).await {
                    Ok(()) => {
                        tracing::debug!(
                            job = job.name,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "job finished"
                        );
                    }
                    Err(e) => {
                        tracing::error!(job = job.name, "job failed: {e:#}");
                        self.dispatcher
                            .dispatch(
                                &Event::system_error(job.name, format!("{e:#}")).with_metadata(
                                    serde_json::json!({ "job": job.name }),
                                ),
                            )
                            .await;
                    }
                }

                job.next_fire = job.cadence.next_fire(Utc::now());
                tracing::debug!(job = job.name, next_fire = %job.next_fire, "job rescheduled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn parses_the_schedule_grammar() {
        assert_eq!(
            Cadence::parse("hourly").unwrap(),
            Cadence::Hourly { offset_minutes: 0 }
        );
        assert_eq!(
            Cadence::parse("hourly+5m").unwrap(),
            Cadence::Hourly { offset_minutes: 5 }
        );
        assert_eq!(
            Cadence::parse("every 15m").unwrap(),
            Cadence::EveryMinutes { minutes: 15 }
        );
        assert_eq!(
            Cadence::parse("every 6h").unwrap(),
            Cadence::EveryHours { hours: 6 }
        );
        assert_eq!(
            Cadence::parse("daily@03:10").unwrap(),
            Cadence::Daily { hour: 3, minute: 10 }
        );
    }

    #[test]
    fn rejects_bad_schedules() {
        assert!(Cadence::parse("whenever").is_err());
        assert!(Cadence::parse("every 15").is_err());
        assert!(Cadence::parse("hourly+75m").is_err());
        assert!(Cadence::parse("daily@25:00").is_err());
        assert!(Cadence::parse("every 0m").is_err());
    }

    #[test]
    fn hourly_fires_on_the_hour() {
        let cadence = Cadence::Hourly { offset_minutes: 0 };
        assert_eq!(cadence.next_fire(at(10, 0, 0)), at(11, 0, 0));
        assert_eq!(cadence.next_fire(at(10, 59, 59)), at(11, 0, 0));
    }

    #[test]
    fn hourly_offset_fires_at_five_past() {
        let cadence = Cadence::Hourly { offset_minutes: 5 };
        assert_eq!(cadence.next_fire(at(10, 0, 0)), at(10, 5, 0));
        assert_eq!(cadence.next_fire(at(10, 5, 0)), at(11, 5, 0));
        assert_eq!(cadence.next_fire(at(10, 30, 0)), at(11, 5, 0));
    }

    #[test]
    fn every_fifteen_minutes_aligns_to_quarter_hours() {
        let cadence = Cadence::EveryMinutes { minutes: 15 };
        assert_eq!(cadence.next_fire(at(10, 0, 0)), at(10, 15, 0));
        assert_eq!(cadence.next_fire(at(10, 14, 59)), at(10, 15, 0));
        assert_eq!(cadence.next_fire(at(10, 15, 0)), at(10, 30, 0));
        assert_eq!(cadence.next_fire(at(23, 50, 0)), at(0, 0, 0) + Duration::days(1));
    }

    #[test]
    fn every_six_hours_aligns_to_midnight() {
        let cadence = Cadence::EveryHours { hours: 6 };
        assert_eq!(cadence.next_fire(at(0, 0, 0)), at(6, 0, 0));
        assert_eq!(cadence.next_fire(at(5, 59, 59)), at(6, 0, 0));
        assert_eq!(cadence.next_fire(at(6, 0, 1)), at(12, 0, 0));
    }

    #[test]
    fn daily_fires_once_per_day() {
        let cadence = Cadence::Daily { hour: 3, minute: 10 };
        assert_eq!(cadence.next_fire(at(1, 0, 0)), at(3, 10, 0));
        assert_eq!(
            cadence.next_fire(at(3, 10, 0)),
            at(3, 10, 0) + Duration::days(1)
        );
    }
}
