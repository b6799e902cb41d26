//! Pure recurrence computation: given a schedule's temporal definition and
//! "now", decide whether a trigger is due and when the next one will be.
//!
//! No side effects and no I/O. Malformed definitions (zero interval, empty
//! slot list, empty weekday set for weekly repeat) are treated as never due
//! rather than an error; the configuration collaborator rejects them at save
//! time.

use crate::schedule::{
    DateTimeSlot, DateTimeTiming, IntervalTiming, Repeat, Schedule, TimelineTiming, Timing,
};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

/// A trigger judged due at the current evaluation tick.
///
/// `clip` is the fixed clip for Timeline/DateTime slots and `None` for
/// interval triggers, where the rotator picks the clip. `epoch` is the
/// canonical trigger instant (unix seconds) used as the ledger claim key, so
/// near-simultaneous duplicate evaluations collapse onto the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTrigger {
    pub clip: Option<String>,
    pub epoch: i64,
}

/// Unix seconds for a local-naive instant.
fn ts(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp()
}

/// Whether any trigger of this schedule is due at `now`, given the
/// evaluator's tick length in seconds.
pub fn is_due(schedule: &Schedule, now: NaiveDateTime, tick_secs: i64) -> bool {
    !due_triggers(schedule, now, tick_secs).is_empty()
}

/// All triggers of this schedule due within the just-elapsed tick.
pub fn due_triggers(schedule: &Schedule, now: NaiveDateTime, tick_secs: i64) -> Vec<DueTrigger> {
    if !schedule.enabled || tick_secs <= 0 {
        return Vec::new();
    }
    match &schedule.timing {
        Timing::Interval(iv) => interval_due(iv, schedule.last_fired, now)
            .into_iter()
            .collect(),
        Timing::Timeline(tl) => timeline_due(tl, now, tick_secs),
        Timing::DateTime(dt) => datetime_due(dt, now, tick_secs),
    }
}

/// The next instant at which this schedule will fire, if any.
pub fn next_fire_time(schedule: &Schedule, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if !schedule.enabled {
        return None;
    }
    match &schedule.timing {
        Timing::Interval(iv) => interval_next(iv, schedule.last_fired, now),
        Timing::Timeline(tl) => timeline_next(tl, now),
        Timing::DateTime(dt) => datetime_next(dt, now),
    }
}

// ── Interval ─────────────────────────────────────────────────────────────────

fn interval_due(
    iv: &IntervalTiming,
    last_fired: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> Option<DueTrigger> {
    let period = iv.period_secs();
    if period <= 0 {
        return None;
    }
    if let Some(qh) = &iv.quiet_hours {
        if qh.contains(now.time()) {
            return None;
        }
    }
    let due = match last_fired {
        None => true,
        Some(lf) => (now - lf).num_seconds() >= period,
    };
    if !due {
        return None;
    }
    // Bucket to period boundaries so concurrent evaluations share one key.
    let epoch = ts(now).div_euclid(period) * period;
    Some(DueTrigger { clip: None, epoch })
}

fn interval_next(
    iv: &IntervalTiming,
    last_fired: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let period = iv.period_secs();
    if period <= 0 {
        return None;
    }
    let mut candidate = match last_fired {
        Some(lf) => {
            let next = lf + Duration::seconds(period);
            if next < now { now } else { next }
        }
        None => now,
    };
    if let Some(qh) = &iv.quiet_hours {
        if qh.contains(candidate.time()) {
            // Quiet suppresses firing until the window ends.
            let date = if qh.start > qh.end && candidate.time() >= qh.start {
                candidate.date() + Duration::days(1)
            } else {
                candidate.date()
            };
            candidate = date.and_time(qh.end);
        }
    }
    Some(candidate)
}

// ── Timeline ─────────────────────────────────────────────────────────────────

fn timeline_due(tl: &TimelineTiming, now: NaiveDateTime, tick_secs: i64) -> Vec<DueTrigger> {
    let cycle = tl.cycle_secs as i64;
    if cycle <= 0 || tl.slots.is_empty() || now < tl.cycle_epoch {
        return Vec::new();
    }
    let elapsed = (ts(now) - ts(tl.cycle_epoch)).rem_euclid(cycle);
    let mut due = Vec::new();
    for slot in &tl.slots {
        let offset = (slot.offset_secs as i64).rem_euclid(cycle);
        // Seconds since this slot's most recent occurrence. Due only when the
        // occurrence falls inside the just-elapsed tick interval; comparing
        // against elapsed alone would re-fire every tick until the cycle wraps.
        let since = (elapsed - offset).rem_euclid(cycle);
        if since < tick_secs && ts(now) - since >= ts(tl.cycle_epoch) {
            due.push(DueTrigger {
                clip: Some(slot.clip.clone()),
                epoch: ts(now) - since,
            });
        }
    }
    due
}

fn timeline_next(tl: &TimelineTiming, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let cycle = tl.cycle_secs as i64;
    if cycle <= 0 || tl.slots.is_empty() {
        return None;
    }
    if now < tl.cycle_epoch {
        let first = tl
            .slots
            .iter()
            .map(|s| (s.offset_secs as i64).rem_euclid(cycle))
            .min()?;
        return Some(tl.cycle_epoch + Duration::seconds(first));
    }
    let elapsed = (ts(now) - ts(tl.cycle_epoch)).rem_euclid(cycle);
    tl.slots
        .iter()
        .map(|s| {
            let offset = (s.offset_secs as i64).rem_euclid(cycle);
            (offset - elapsed).rem_euclid(cycle)
        })
        .min()
        .map(|delta| now + Duration::seconds(delta))
}

// ── DateTime ─────────────────────────────────────────────────────────────────

fn datetime_due(dt: &DateTimeTiming, now: NaiveDateTime, tick_secs: i64) -> Vec<DueTrigger> {
    let mut due = Vec::new();
    for slot in &dt.slots {
        if let Some(occ) = slot_occurrence_due(slot, now, tick_secs) {
            due.push(DueTrigger {
                clip: Some(dt.clip.clone()),
                epoch: ts(occ),
            });
        }
    }
    due
}

/// The occurrence of `slot` that is due at `now`, if any.
fn slot_occurrence_due(
    slot: &DateTimeSlot,
    now: NaiveDateTime,
    tick_secs: i64,
) -> Option<NaiveDateTime> {
    match slot.repeat {
        Repeat::None => {
            // One-shot slots get a symmetric tolerance window so an evaluator
            // that was briefly down does not miss the exact instant.
            let occ = slot.date.and_time(slot.time);
            let diff = (now - occ).num_seconds().abs();
            (diff <= tick_secs).then_some(occ)
        }
        Repeat::Daily => {
            let occ = now.date().and_time(slot.time);
            in_recurring_window(slot, occ, now, tick_secs).then_some(occ)
        }
        Repeat::Weekly => {
            if slot.weekdays.is_empty() {
                return None;
            }
            let today = now.date().weekday().num_days_from_monday() as u8;
            if !slot.weekdays.contains(&today) {
                return None;
            }
            let occ = now.date().and_time(slot.time);
            in_recurring_window(slot, occ, now, tick_secs).then_some(occ)
        }
        Repeat::Monthly => {
            let day = clamp_day(now.date().year(), now.date().month(), slot.date.day());
            let occ_date = NaiveDate::from_ymd_opt(now.date().year(), now.date().month(), day)?;
            let occ = occ_date.and_time(slot.time);
            in_recurring_window(slot, occ, now, tick_secs).then_some(occ)
        }
        Repeat::Yearly => {
            let month = slot.date.month();
            let day = clamp_day(now.date().year(), month, slot.date.day());
            let occ_date = NaiveDate::from_ymd_opt(now.date().year(), month, day)?;
            if occ_date != now.date() {
                return None;
            }
            let occ = occ_date.and_time(slot.time);
            in_recurring_window(slot, occ, now, tick_secs).then_some(occ)
        }
    }
}

/// A recurring occurrence fires within the tick window following its instant,
/// bounded by the slot's start date and optional end date.
fn in_recurring_window(
    slot: &DateTimeSlot,
    occ: NaiveDateTime,
    now: NaiveDateTime,
    tick_secs: i64,
) -> bool {
    if occ.date() < slot.date {
        return false;
    }
    if let Some(end) = slot.end_date {
        if occ.date() > end {
            return false;
        }
    }
    let since = (now - occ).num_seconds();
    (0..tick_secs).contains(&since)
}

fn datetime_next(dt: &DateTimeTiming, now: NaiveDateTime) -> Option<NaiveDateTime> {
    dt.slots
        .iter()
        .filter_map(|slot| slot_next_occurrence(slot, now))
        .min()
}

fn slot_next_occurrence(slot: &DateTimeSlot, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let within_end = |d: NaiveDate| slot.end_date.map_or(true, |end| d <= end);
    match slot.repeat {
        Repeat::None => {
            let occ = slot.date.and_time(slot.time);
            (occ >= now).then_some(occ)
        }
        Repeat::Daily => {
            let mut date = now.date().max(slot.date);
            if date == now.date() && now.time() > slot.time {
                date += Duration::days(1);
            }
            (within_end(date)).then(|| date.and_time(slot.time))
        }
        Repeat::Weekly => {
            if slot.weekdays.is_empty() {
                return None;
            }
            let start = now.date().max(slot.date);
            for ahead in 0..14 {
                let date = start + Duration::days(ahead);
                let wd = date.weekday().num_days_from_monday() as u8;
                if !slot.weekdays.contains(&wd) {
                    continue;
                }
                if date == now.date() && now.time() > slot.time {
                    continue;
                }
                return within_end(date).then(|| date.and_time(slot.time));
            }
            None
        }
        Repeat::Monthly => {
            let (mut year, mut month) = (now.date().year(), now.date().month());
            for _ in 0..13 {
                let day = clamp_day(year, month, slot.date.day());
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                    let occ = date.and_time(slot.time);
                    if occ >= now && date >= slot.date {
                        return within_end(date).then_some(occ);
                    }
                }
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
            None
        }
        Repeat::Yearly => {
            for ahead in 0..8 {
                let year = now.date().year() + ahead;
                let day = clamp_day(year, slot.date.month(), slot.date.day());
                if let Some(date) = NaiveDate::from_ymd_opt(year, slot.date.month(), day) {
                    let occ = date.and_time(slot.time);
                    if occ >= now && date >= slot.date {
                        return within_end(date).then_some(occ);
                    }
                }
            }
            None
        }
    }
}

/// Clamp a day-of-month to the last valid day of the given month.
///
/// Scheduling the 31st in a 30-day month fires on the 30th; Feb 29 schedules
/// fire on Feb 28 in non-leap years.
fn clamp_day(year: i32, month: u32, day: u32) -> u32 {
    day.min(days_in_month(year, month))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
