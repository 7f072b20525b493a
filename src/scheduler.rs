//! Scheduler for tournament and leaderboard deadlines.
//!
//! Keeps two timers: the earliest end-active deadline and the earliest
//! reset deadline across all scheduled entities. When one fires, the
//! corresponding runtime hook is invoked for the affected ids and both
//! timers are recomputed.
//!
//! Cron expressions are always evaluated in UTC regardless of the server's
//! timezone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use croner::Cron;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::runtime::ExtensionRuntime;

/// The active window of a scheduled entity at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    /// Most recent cron firing at or before now (the configured start when
    /// that is later), unix seconds.
    pub start_active: i64,
    /// `min(start_active + duration, next_reset)`, unix seconds.
    pub end_active: i64,
    /// Next cron firing strictly after now, unix seconds; 0 when none.
    pub next_reset: i64,
}

/// Most recent firing of `cron` at or before `now` (minute resolution).
///
/// Cron libraries only iterate forward; walk a doubling window backwards
/// until it contains a firing, then step forward to the last one.
fn prev_occurrence(cron: &Cron, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let now_min = now.with_second(0)?.with_nanosecond(0)?;
    if cron.is_time_matching(&now_min).unwrap_or(false) {
        return Some(now_min);
    }

    let mut window = chrono::Duration::minutes(2);
    // Wide enough for any sane schedule, including yearly patterns.
    let max_window = chrono::Duration::days(366 * 8);

    loop {
        let start = now_min - window;
        if let Ok(candidate) = cron.find_next_occurrence(&start, true) {
            if candidate <= now_min {
                let mut last = candidate;
                while let Ok(next) = cron.find_next_occurrence(&last, false) {
                    if next > now_min {
                        break;
                    }
                    last = next;
                }
                return Some(last);
            }
        }
        if window >= max_window {
            return None;
        }
        window = window * 2;
    }
}

/// Compute `(start_active, end_active, next_reset)` for a scheduled entity.
///
/// `now` may carry any timezone; the arithmetic converts to UTC first.
pub fn compute_deadlines<Tz: TimeZone>(
    cron: Option<&Cron>,
    start_time: i64,
    duration: i64,
    end_time: Option<i64>,
    now: DateTime<Tz>,
) -> ScheduleWindow {
    let now = now.with_timezone(&Utc);

    let Some(cron) = cron else {
        // Unscheduled: one continuous window from start.
        let end_active = if duration > 0 {
            start_time + duration
        } else {
            end_time.unwrap_or(0)
        };
        return ScheduleWindow {
            start_active: start_time,
            end_active,
            next_reset: 0,
        };
    };

    // A schedule that has not started yet is computed from its start.
    let base = if now.timestamp() < start_time {
        Utc.timestamp_opt(start_time, 0).single().unwrap_or(now)
    } else {
        now
    };

    let start_active = match prev_occurrence(cron, base) {
        // The configured start wins when it lies after the last firing: a
        // tournament is never active before it starts.
        Some(prev) if prev.timestamp() >= start_time => prev.timestamp(),
        _ => start_time,
    };

    let mut next_reset = cron
        .find_next_occurrence(&base, false)
        .map(|t| t.timestamp())
        .unwrap_or(0);
    if let Some(end) = end_time {
        if end > 0 && next_reset > end {
            next_reset = 0;
        }
    }

    let end_active = if duration > 0 {
        let natural_end = start_active + duration;
        if next_reset > 0 {
            natural_end.min(next_reset)
        } else {
            natural_end
        }
    } else {
        next_reset
    };

    ScheduleWindow {
        start_active,
        end_active,
        next_reset,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledKind {
    Tournament,
    Leaderboard,
}

/// One scheduled tournament or leaderboard.
pub struct Scheduled {
    pub id: Uuid,
    pub kind: ScheduledKind,
    pub cron: Option<Cron>,
    pub start_time: i64,
    pub duration: i64,
    pub end_time: Option<i64>,
}

pub struct Scheduler {
    entries: DashMap<Uuid, Scheduled>,
    runtime: Arc<ExtensionRuntime>,
    changed: Notify,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(runtime: Arc<ExtensionRuntime>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            runtime,
            changed: Notify::new(),
            shutdown,
        })
    }

    fn parse_pattern(pattern: &str) -> Result<Cron, ApiError> {
        Cron::new(pattern)
            .parse()
            .map_err(|e| ApiError::InvalidArgument(format!("cron pattern {pattern:?}: {e}")))
    }

    pub fn add_tournament(
        &self,
        id: Uuid,
        pattern: Option<&str>,
        start_time: i64,
        duration: i64,
        end_time: Option<i64>,
    ) -> Result<(), ApiError> {
        let cron = pattern.map(Self::parse_pattern).transpose()?;
        self.entries.insert(
            id,
            Scheduled {
                id,
                kind: ScheduledKind::Tournament,
                cron,
                start_time,
                duration,
                end_time,
            },
        );
        self.changed.notify_one();
        Ok(())
    }

    pub fn add_leaderboard(&self, id: Uuid, pattern: &str) -> Result<(), ApiError> {
        let cron = Self::parse_pattern(pattern)?;
        self.entries.insert(
            id,
            Scheduled {
                id,
                kind: ScheduledKind::Leaderboard,
                cron: Some(cron),
                start_time: 0,
                duration: 0,
                end_time: None,
            },
        );
        self.changed.notify_one();
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) {
        self.entries.remove(id);
        self.changed.notify_one();
    }

    #[allow(dead_code)] // Available to the console surface
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest pending end-active and reset deadlines strictly after `now`,
    /// with the entries that share each deadline.
    fn pending(&self, now: DateTime<Utc>) -> (Option<(i64, Vec<Uuid>)>, Option<(i64, Vec<Uuid>)>) {
        let mut end: Option<(i64, Vec<Uuid>)> = None;
        let mut reset: Option<(i64, Vec<Uuid>)> = None;
        let now_ts = now.timestamp();

        for entry in self.entries.iter() {
            let window = compute_deadlines(
                entry.cron.as_ref(),
                entry.start_time,
                entry.duration,
                entry.end_time,
                now,
            );

            // End-active fires only when it precedes the reset; otherwise
            // the reset itself closes the window.
            if entry.kind == ScheduledKind::Tournament
                && window.end_active > now_ts
                && (window.next_reset == 0 || window.end_active < window.next_reset)
            {
                push_deadline(&mut end, window.end_active, entry.id);
            }
            if window.next_reset > now_ts {
                push_deadline(&mut reset, window.next_reset, entry.id);
            }
        }
        (end, reset)
    }

    /// Run the two-timer loop until shutdown.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let (end, reset) = scheduler.pending(now);
                let end_deadline = end.as_ref().map(|(d, _)| *d);
                let reset_deadline = reset.as_ref().map(|(d, _)| *d);

                tokio::select! {
                    _ = deadline_sleep(end_deadline, now.timestamp()) => {
                        if let Some((_, ids)) = &end {
                            scheduler.fire_end(ids);
                        }
                    }
                    _ = deadline_sleep(reset_deadline, now.timestamp()) => {
                        if let Some((_, ids)) = &reset {
                            scheduler.fire_reset(ids);
                        }
                    }
                    _ = scheduler.changed.notified() => {
                        debug!("Schedule changed, recomputing deadlines");
                    }
                    _ = scheduler.shutdown.cancelled() => {
                        info!("Scheduler stopping");
                        return;
                    }
                }
            }
        });
    }

    fn fire_end(&self, ids: &[Uuid]) {
        let now = Utc::now();
        for id in ids {
            let Some(entry) = self.entries.get(id) else { continue };
            let window = compute_deadlines(
                entry.cron.as_ref(),
                entry.start_time,
                entry.duration,
                entry.end_time,
                now,
            );
            info!(id = %id, "Tournament end-active deadline fired");
            self.runtime
                .tournament_end(*id, window.end_active, window.next_reset);
        }
    }

    fn fire_reset(&self, ids: &[Uuid]) {
        let now = Utc::now();
        for id in ids {
            let Some(entry) = self.entries.get(id) else { continue };
            let window = compute_deadlines(
                entry.cron.as_ref(),
                entry.start_time,
                entry.duration,
                entry.end_time,
                now,
            );
            match entry.kind {
                ScheduledKind::Tournament => {
                    info!(id = %id, "Tournament reset deadline fired");
                    self.runtime
                        .tournament_reset(*id, window.end_active, window.next_reset);
                }
                ScheduledKind::Leaderboard => {
                    info!(id = %id, "Leaderboard reset deadline fired");
                    self.runtime
                        .leaderboard_reset(*id, window.end_active, window.next_reset);
                }
            }
        }
    }
}

fn push_deadline(slot: &mut Option<(i64, Vec<Uuid>)>, deadline: i64, id: Uuid) {
    match slot {
        Some((current, ids)) => {
            if deadline < *current {
                *slot = Some((deadline, vec![id]));
            } else if deadline == *current {
                ids.push(id);
            }
        }
        None => *slot = Some((deadline, vec![id])),
    }
}

/// Sleep until a unix-second deadline; pends forever when there is none.
async fn deadline_sleep(deadline: Option<i64>, now_ts: i64) {
    match deadline {
        Some(deadline) => {
            let wait = (deadline - now_ts).max(0) as u64;
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn cron(pattern: &str) -> Cron {
        Cron::new(pattern).parse().unwrap()
    }

    fn utc(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).single().unwrap()
    }

    #[test]
    fn monthly_schedule_at_its_own_firing() {
        // 09:00 on the 14th, monthly; start and now are exactly a firing.
        let schedule = cron("0 9 14 * *");
        let start = 1_692_003_600; // 2023-08-14T09:00:00Z
        let window = compute_deadlines(Some(&schedule), start, 604_800, None, utc(start));
        assert_eq!(window.start_active, 1_692_003_600);
        assert_eq!(window.end_active, 1_692_608_400);
        assert_eq!(window.next_reset, 1_694_682_000);
    }

    #[test]
    fn weekly_schedule_is_timezone_neutral() {
        // Monday midnight weekly; "now" expressed in a UTC+8 locale.
        let schedule = cron("0 0 * * 1");
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let now = utc(1_692_061_200).with_timezone(&offset); // 2023-08-15T01:00Z
        let window = compute_deadlines(Some(&schedule), 0, 604_800, None, now);
        assert_eq!(window.start_active, 1_691_971_200);
        assert_eq!(window.end_active, 1_692_576_000);
        assert_eq!(window.next_reset, 1_692_576_000);
    }

    #[test]
    fn weekday_evening_schedule_mid_window() {
        // 22:00 on weekdays; now is Monday 11:00, inside Friday's window.
        let schedule = cron("0 22 * * 1-5");
        let start = 1_692_090_000; // 2023-08-15T09:00:00Z
        let now = utc(1_692_615_600); // 2023-08-21T11:00:00Z
        let window = compute_deadlines(Some(&schedule), start, 7_200, None, now);
        assert_eq!(window.start_active, 1_692_396_000);
        assert_eq!(window.end_active, 1_692_403_200);
        assert_eq!(window.next_reset, 1_692_655_200);
    }

    #[test]
    fn start_after_last_firing_wins() {
        // Weekly Monday cron, but the tournament starts midweek.
        let schedule = cron("0 0 * * 1");
        let start = utc(1_691_971_200).timestamp() + 2 * 86_400; // Wed
        let now = utc(start + 3_600);
        let window = compute_deadlines(Some(&schedule), start, 3_600, None, now);
        assert_eq!(window.start_active, start);
    }

    #[test]
    fn future_start_computes_from_start() {
        let schedule = cron("0 9 14 * *");
        let start = 1_692_003_600; // 2023-08-14T09:00:00Z
        let now = utc(start - 86_400);
        let window = compute_deadlines(Some(&schedule), start, 3_600, None, now);
        assert_eq!(window.start_active, start);
        assert_eq!(window.next_reset, 1_694_682_000);
    }

    #[test]
    fn unscheduled_entity_has_one_window() {
        let window = compute_deadlines(None, 100, 50, None, utc(120));
        assert_eq!(window.start_active, 100);
        assert_eq!(window.end_active, 150);
        assert_eq!(window.next_reset, 0);
    }

    #[test]
    fn end_time_caps_resets() {
        let schedule = cron("0 0 * * 1");
        let now = utc(1_692_061_200);
        let window = compute_deadlines(Some(&schedule), 0, 0, Some(1_692_100_000), now);
        // Next Monday lies past the hard end: no further reset.
        assert_eq!(window.next_reset, 0);
    }

    #[test]
    fn prev_occurrence_handles_dense_and_sparse_patterns() {
        let every_minute = cron("* * * * *");
        let now = utc(1_692_061_230); // :30 seconds into the minute
        assert_eq!(
            prev_occurrence(&every_minute, now).unwrap().timestamp(),
            1_692_061_200
        );

        let yearly = cron("0 0 1 1 *");
        let prev = prev_occurrence(&yearly, utc(1_692_061_200)).unwrap();
        assert_eq!(prev.timestamp(), 1_672_531_200); // 2023-01-01T00:00Z
    }

    #[test]
    fn register_and_remove_entities() {
        let runtime = crate::runtime::ExtensionRuntime::build(&[]).unwrap();
        let scheduler = Scheduler::new(runtime, CancellationToken::new());

        let tournament = Uuid::new_v4();
        scheduler
            .add_tournament(tournament, Some("0 22 * * 1-5"), 0, 7_200, None)
            .unwrap();
        let board = Uuid::new_v4();
        scheduler.add_leaderboard(board, "0 0 * * 1").unwrap();
        assert_eq!(scheduler.len(), 2);

        assert!(scheduler.add_leaderboard(Uuid::new_v4(), "bogus").is_err());

        scheduler.remove(&tournament);
        scheduler.remove(&board);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(Scheduler::parse_pattern("not a cron").is_err());
        assert!(Scheduler::parse_pattern("0 9 14 * *").is_ok());
    }
}
