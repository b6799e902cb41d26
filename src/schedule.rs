use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority level for schedules and playback intents (higher = more important).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(9);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Recurrence rule for a DateTime slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    None,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::None
    }
}

impl fmt::Display for Repeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repeat::None => write!(f, "none"),
            Repeat::Daily => write!(f, "daily"),
            Repeat::Weekly => write!(f, "weekly"),
            Repeat::Monthly => write!(f, "monthly"),
            Repeat::Yearly => write!(f, "yearly"),
        }
    }
}

impl Repeat {
    /// Parse a repeat rule from a string (case-insensitive).
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "none" | "once" => Ok(Repeat::None),
            "daily" => Ok(Repeat::Daily),
            "weekly" => Ok(Repeat::Weekly),
            "monthly" => Ok(Repeat::Monthly),
            "yearly" => Ok(Repeat::Yearly),
            _ => Err(format!(
                "Unknown repeat rule '{}'. Expected: none, daily, weekly, monthly, yearly",
                s
            )),
        }
    }
}

/// A daily window during which interval firing is suppressed.
/// When `start > end` the window wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    /// Whether the given time-of-day falls inside this window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Wraps midnight: e.g. 22:00 -> 06:00
            time >= self.start || time < self.end
        }
    }
}

/// Fire every N minutes, rotating through a clip set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalTiming {
    /// Minutes between triggers.
    pub minutes: u32,
    /// Inline clip rotation list, used when no folder is set.
    #[serde(default)]
    pub clips: Vec<String>,
    /// Folder whose playlist settings drive clip selection. Wins over `clips`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    /// Skip a selection that repeats the previous one (inline clips only).
    #[serde(default)]
    pub avoid_repeat: bool,
    /// Daily window during which firing is suppressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
}

impl IntervalTiming {
    /// Trigger period in seconds.
    pub fn period_secs(&self) -> i64 {
        self.minutes as i64 * 60
    }
}

/// A clip pinned at a fixed offset within a repeating cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineSlot {
    pub clip: String,
    pub offset_secs: u32,
}

/// A repeating cycle of fixed duration with clips at fixed offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineTiming {
    /// Cycle length in seconds.
    pub cycle_secs: u32,
    /// Reference instant from which cycles are counted.
    pub cycle_epoch: NaiveDateTime,
    pub slots: Vec<TimelineSlot>,
}

/// One calendar slot of a DateTime schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateTimeSlot {
    pub date: NaiveDate,
    pub time: NaiveTime,
    #[serde(default)]
    pub repeat: Repeat,
    /// Days of the week for weekly repeat (0=Mon..6=Sun).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

impl DateTimeSlot {
    /// A one-shot slot at the given date and time.
    pub fn once(date: NaiveDate, time: NaiveTime) -> Self {
        DateTimeSlot {
            date,
            time,
            repeat: Repeat::None,
            weekdays: Vec::new(),
            end_date: None,
        }
    }

    /// Format the weekday set for display.
    pub fn weekdays_display(&self) -> String {
        if self.weekdays.is_empty() {
            return "all".to_string();
        }
        let names = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
        self.weekdays
            .iter()
            .filter_map(|&d| names.get(d as usize))
            .copied()
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Calendar-driven timing: a set of dated slots sharing one clip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateTimeTiming {
    pub clip: String,
    pub slots: Vec<DateTimeSlot>,
}

/// The temporal definition of a schedule. Exactly one variant per schedule;
/// the variant is immutable once execution history exists for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Timing {
    Interval(IntervalTiming),
    Timeline(TimelineTiming),
    DateTime(DateTimeTiming),
}

impl Timing {
    /// Short tag for display and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Timing::Interval(_) => "interval",
            Timing::Timeline(_) => "timeline",
            Timing::DateTime(_) => "datetime",
        }
    }
}

/// A tenant-owned definition of when and what to play.
///
/// Owned by the tenant/zone configuration collaborator; this core reads it
/// but never writes it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: u32,
    pub tenant: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Target zones. Empty means the schedule produces no intents.
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<NaiveDateTime>,
    pub timing: Timing,
}

fn default_true() -> bool {
    true
}

impl Schedule {
    pub fn new(id: u32, tenant: &str, name: &str, timing: Timing) -> Self {
        Schedule {
            id,
            tenant: tenant.to_string(),
            name: name.to_string(),
            enabled: true,
            zones: Vec::new(),
            priority: Priority::NORMAL,
            last_fired: None,
            timing,
        }
    }

    pub fn with_zones(mut self, zones: &[&str]) -> Self {
        self.zones = zones.iter().map(|z| z.to_string()).collect();
        self
    }
}

/// Parse a time string in HH:MM or HH:MM:SS format.
pub fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| format!("Invalid time '{}'. Expected HH:MM or HH:MM:SS", s))
}

/// Parse a date string in YYYY-MM-DD format.
pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}'. Expected YYYY-MM-DD", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parse_time_formats() {
        assert_eq!(parse_time("14:00").unwrap(), t(14, 0));
        assert_eq!(
            parse_time("14:30:15").unwrap(),
            NaiveTime::from_hms_opt(14, 30, 15).unwrap()
        );
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("abc").is_err());
    }

    #[test]
    fn parse_date_format() {
        assert_eq!(
            parse_date("2025-03-31").unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 31).unwrap()
        );
        assert!(parse_date("31/03/2025").is_err());
    }

    #[test]
    fn repeat_from_str() {
        assert_eq!(Repeat::from_str_loose("none").unwrap(), Repeat::None);
        assert_eq!(Repeat::from_str_loose("WEEKLY").unwrap(), Repeat::Weekly);
        assert_eq!(Repeat::from_str_loose("once").unwrap(), Repeat::None);
        assert!(Repeat::from_str_loose("fortnightly").is_err());
    }

    #[test]
    fn repeat_display() {
        assert_eq!(format!("{}", Repeat::Daily), "daily");
        assert_eq!(format!("{}", Repeat::Yearly), "yearly");
    }

    #[test]
    fn quiet_hours_plain_window() {
        let qh = QuietHours { start: t(9, 0), end: t(17, 0) };
        assert!(qh.contains(t(9, 0)));
        assert!(qh.contains(t(12, 0)));
        assert!(!qh.contains(t(17, 0)));
        assert!(!qh.contains(t(8, 59)));
    }

    #[test]
    fn quiet_hours_wraps_midnight() {
        let qh = QuietHours { start: t(22, 0), end: t(6, 0) };
        assert!(qh.contains(t(23, 30)));
        assert!(qh.contains(t(2, 0)));
        assert!(!qh.contains(t(12, 0)));
        assert!(qh.contains(t(22, 0)));
        assert!(!qh.contains(t(6, 0)));
    }

    #[test]
    fn interval_period_secs() {
        let timing = IntervalTiming {
            minutes: 5,
            clips: vec![],
            folder: None,
            avoid_repeat: false,
            quiet_hours: None,
        };
        assert_eq!(timing.period_secs(), 300);
    }

    #[test]
    fn timing_kind_tags() {
        let interval = Timing::Interval(IntervalTiming {
            minutes: 5,
            clips: vec![],
            folder: None,
            avoid_repeat: false,
            quiet_hours: None,
        });
        assert_eq!(interval.kind(), "interval");
    }

    #[test]
    fn schedule_serialization_roundtrip() {
        let timing = Timing::Interval(IntervalTiming {
            minutes: 10,
            clips: vec!["clip-a".into(), "clip-b".into()],
            folder: None,
            avoid_repeat: true,
            quiet_hours: Some(QuietHours { start: t(22, 0), end: t(6, 0) }),
        });
        let sched = Schedule::new(7, "acme", "Lobby loop", timing)
            .with_zones(&["lobby", "cafe"]);
        let json = serde_json::to_string(&sched).unwrap();
        let loaded: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.id, 7);
        assert_eq!(loaded.tenant, "acme");
        assert_eq!(loaded.zones, vec!["lobby", "cafe"]);
        assert!(loaded.enabled);
        match loaded.timing {
            Timing::Interval(iv) => {
                assert_eq!(iv.minutes, 10);
                assert!(iv.avoid_repeat);
                assert!(iv.quiet_hours.is_some());
            }
            _ => panic!("wrong variant after roundtrip"),
        }
    }

    #[test]
    fn datetime_slot_weekdays_display() {
        let mut slot = DateTimeSlot::once(
            NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            t(9, 0),
        );
        assert_eq!(slot.weekdays_display(), "all");
        slot.weekdays = vec![0, 2, 4];
        assert_eq!(slot.weekdays_display(), "Mon,Wed,Fri");
    }

    #[test]
    fn schedule_defaults_when_missing_from_json() {
        let json = r#"{
            "id": 1,
            "tenant": "acme",
            "name": "Test",
            "timing": {"kind": "interval", "minutes": 5}
        }"#;
        let sched: Schedule = serde_json::from_str(json).unwrap();
        assert!(sched.enabled);
        assert!(sched.zones.is_empty());
        assert_eq!(sched.priority, Priority::NORMAL);
        assert!(sched.last_fired.is_none());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
    }
}
