//! Recurrence definitions: the wire contract and the validated rule types.
//!
//! A [`RecurrenceDefinition`] is the JSON shape exchanged with whoever edits
//! schedules:
//!
//! ```json
//! {"schedules": [{"type": "weekly", "weekday": "thursday",
//!                 "start_time": "19:00", "end_time": "22:30",
//!                 "every_n_weeks": 1}]}
//! ```
//!
//! [`parse`] turns it into a [`Recurrence`], a non-empty union of
//! independent [`Schedule`] rules. Converting back with
//! [`Recurrence::to_definition`] reproduces the canonical contract exactly.

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::generator;

const TYPE_WEEKLY: &str = "weekly";
const TYPE_MONTHLY: &str = "monthly_nth_weekday";

// ── Wire contract ───────────────────────────────────────────────────────────

/// The interoperable JSON form of an entity's recurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceDefinition {
    pub schedules: Vec<ScheduleSpec>,
}

/// One unvalidated schedule entry of a [`RecurrenceDefinition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_n_weeks: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<i64>>,
}

impl RecurrenceDefinition {
    /// Parse the JSON contract without validating the rules.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Serialising plain strings, integers and vectors cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Validated rules ─────────────────────────────────────────────────────────

/// Which occurrence of a weekday within a month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WeekOrdinal {
    First,
    Second,
    Third,
    Fourth,
    /// The final such weekday of the month (4th or 5th).
    Last,
}

impl WeekOrdinal {
    /// Wire value: 1..=4, or -1 for last.
    #[must_use]
    pub fn as_position(self) -> i64 {
        match self {
            Self::First => 1,
            Self::Second => 2,
            Self::Third => 3,
            Self::Fourth => 4,
            Self::Last => -1,
        }
    }

    #[must_use]
    pub fn from_position(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::First),
            2 => Some(Self::Second),
            3 => Some(Self::Third),
            4 => Some(Self::Fourth),
            -1 => Some(Self::Last),
            _ => None,
        }
    }
}

/// The date pattern of a schedule rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Every `every_n_weeks` weeks on `weekday`.
    Weekly { weekday: Weekday, every_n_weeks: u32 },
    /// The given ordinal `weekday`s of every month. Positions are sorted and unique.
    MonthlyNthWeekday {
        weekday: Weekday,
        positions: Vec<WeekOrdinal>,
    },
}

/// A validated recurrence rule: a date pattern plus local wall-clock times.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Schedule {
    pub pattern: Pattern,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl Schedule {
    /// A weekly rule. `every_n_weeks` is clamped to at least 1.
    #[must_use]
    pub fn weekly(weekday: Weekday, every_n_weeks: u32, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            pattern: Pattern::Weekly {
                weekday,
                every_n_weeks: every_n_weeks.max(1),
            },
            start_time: start,
            end_time: end,
        }
    }

    #[must_use]
    pub fn monthly(
        weekday: Weekday,
        positions: &[WeekOrdinal],
        start: NaiveTime,
        end: NaiveTime,
    ) -> Self {
        let mut positions = positions.to_vec();
        positions.sort();
        positions.dedup();
        Self {
            pattern: Pattern::MonthlyNthWeekday { weekday, positions },
            start_time: start,
            end_time: end,
        }
    }

    #[must_use]
    pub fn weekday(&self) -> Weekday {
        match &self.pattern {
            Pattern::Weekly { weekday, .. } | Pattern::MonthlyNthWeekday { weekday, .. } => {
                *weekday
            }
        }
    }

    /// Render this rule as RFC 5545 `DTSTART`/`RRULE` lines.
    ///
    /// `DTSTART` is the first occurrence on or after `from`, which for
    /// multi-week rules is also the anchor that keeps the `INTERVAL` aligned
    /// with this crate's week numbering.
    #[must_use]
    pub fn to_rrule(&self, timezone: &str, from: NaiveDate) -> String {
        let until = from
            .checked_add_signed(chrono::Duration::days(400))
            .unwrap_or(NaiveDate::MAX);
        let first = generator::occurrences(self, from, until)
            .next()
            .map_or(from, |o| o.date);
        let byday = weekday_code(self.weekday());
        let rule = match &self.pattern {
            Pattern::Weekly { every_n_weeks, .. } => {
                format!("FREQ=WEEKLY;INTERVAL={every_n_weeks};BYDAY={byday}")
            }
            Pattern::MonthlyNthWeekday { positions, .. } => {
                let days: Vec<String> = positions
                    .iter()
                    .map(|p| format!("{}{byday}", p.as_position()))
                    .collect();
                format!("FREQ=MONTHLY;BYDAY={}", days.join(","))
            }
        };
        format!(
            "DTSTART;TZID={timezone}:{}T{}\nRRULE:{rule}",
            first.format("%Y%m%d"),
            self.start_time.format("%H%M%S"),
        )
    }

    fn to_spec(&self) -> ScheduleSpec {
        let (schedule_type, every_n_weeks, positions) = match &self.pattern {
            Pattern::Weekly { every_n_weeks, .. } => {
                (TYPE_WEEKLY, Some(i64::from(*every_n_weeks)), None)
            }
            Pattern::MonthlyNthWeekday { positions, .. } => (
                TYPE_MONTHLY,
                None,
                Some(positions.iter().map(|p| p.as_position()).collect()),
            ),
        };
        ScheduleSpec {
            schedule_type: schedule_type.to_string(),
            weekday: Some(weekday_name(self.weekday()).to_string()),
            start_time: Some(format_hhmm(self.start_time)),
            end_time: Some(format_hhmm(self.end_time)),
            every_n_weeks,
            positions,
        }
    }
}

/// A non-empty union of independent schedule rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecurrenceDefinition", into = "RecurrenceDefinition")]
pub struct Recurrence {
    schedules: Vec<Schedule>,
}

impl Recurrence {
    pub fn new(schedules: Vec<Schedule>) -> Result<Self, ValidationError> {
        if schedules.is_empty() {
            return Err(ValidationError::Empty);
        }
        for (index, schedule) in schedules.iter().enumerate() {
            if schedule.start_time >= schedule.end_time {
                return Err(ValidationError::StartNotBeforeEnd {
                    index,
                    start: format_hhmm(schedule.start_time),
                    end: format_hhmm(schedule.end_time),
                });
            }
        }
        Ok(Self { schedules })
    }

    /// Parse and validate the JSON contract in one step.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        parse(&RecurrenceDefinition::from_json(json)?)
    }

    #[must_use]
    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    /// The canonical wire form of these rules.
    #[must_use]
    pub fn to_definition(&self) -> RecurrenceDefinition {
        RecurrenceDefinition {
            schedules: self.schedules.iter().map(Schedule::to_spec).collect(),
        }
    }
}

impl TryFrom<RecurrenceDefinition> for Recurrence {
    type Error = ValidationError;

    fn try_from(definition: RecurrenceDefinition) -> Result<Self, Self::Error> {
        parse(&definition)
    }
}

impl From<Recurrence> for RecurrenceDefinition {
    fn from(recurrence: Recurrence) -> Self {
        recurrence.to_definition()
    }
}

/// Validate a recurrence definition into its schedule rules.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found, naming the offending
/// schedule by index. Overnight rules (`end_time <= start_time`) are rejected.
pub fn parse(definition: &RecurrenceDefinition) -> Result<Recurrence, ValidationError> {
    let schedules = definition
        .schedules
        .iter()
        .enumerate()
        .map(|(index, spec)| parse_schedule(index, spec))
        .collect::<Result<Vec<_>, _>>()?;
    Recurrence::new(schedules)
}

fn parse_schedule(index: usize, spec: &ScheduleSpec) -> Result<Schedule, ValidationError> {
    let weekday_raw = spec.weekday.as_deref().ok_or(ValidationError::InvalidWeekday {
        index,
        value: String::new(),
    })?;
    let weekday = parse_weekday(weekday_raw).ok_or_else(|| ValidationError::InvalidWeekday {
        index,
        value: weekday_raw.to_string(),
    })?;
    let start = parse_time_field(index, "start_time", spec.start_time.as_deref())?;
    let end = parse_time_field(index, "end_time", spec.end_time.as_deref())?;
    if start >= end {
        return Err(ValidationError::StartNotBeforeEnd {
            index,
            start: format_hhmm(start),
            end: format_hhmm(end),
        });
    }

    match spec.schedule_type.as_str() {
        TYPE_WEEKLY => {
            if spec.positions.is_some() {
                return Err(ValidationError::UnexpectedField {
                    index,
                    field: "positions",
                    kind: TYPE_WEEKLY,
                });
            }
            let every_n_weeks = spec
                .every_n_weeks
                .filter(|n| *n >= 1)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(ValidationError::InvalidInterval { index })?;
            Ok(Schedule::weekly(weekday, every_n_weeks, start, end))
        }
        TYPE_MONTHLY => {
            if spec.every_n_weeks.is_some() {
                return Err(ValidationError::UnexpectedField {
                    index,
                    field: "every_n_weeks",
                    kind: TYPE_MONTHLY,
                });
            }
            let raw = spec
                .positions
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or(ValidationError::MissingPositions { index })?;
            let positions = raw
                .iter()
                .map(|&value| {
                    WeekOrdinal::from_position(value)
                        .ok_or(ValidationError::InvalidPosition { index, value })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Schedule::monthly(weekday, &positions, start, end))
        }
        other => Err(ValidationError::UnknownType {
            index,
            value: other.to_string(),
        }),
    }
}

fn parse_time_field(
    index: usize,
    field: &'static str,
    value: Option<&str>,
) -> Result<NaiveTime, ValidationError> {
    let raw = value.unwrap_or_default();
    parse_hhmm(raw).ok_or_else(|| ValidationError::InvalidTime {
        index,
        field,
        value: raw.to_string(),
    })
}

// ── Shared helpers ──────────────────────────────────────────────────────────

/// Parse a strict two-digit `HH:MM` wall-clock time.
#[must_use]
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[must_use]
pub fn format_hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Parse a lowercase English weekday name.
fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.trim().to_ascii_lowercase().as_str() {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn weekday_name(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn weekday_code(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

/// Serde adapter for `NaiveTime` fields stored as `"HH:MM"`.
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_hhmm(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_hhmm(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time '{raw}', expected HH:MM")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    const WEEKLY_JSON: &str = r#"{"schedules":[{"type":"weekly","weekday":"thursday","start_time":"19:00","end_time":"22:30","every_n_weeks":1}]}"#;

    #[test]
    fn test_parse_weekly() {
        let recurrence = Recurrence::from_json(WEEKLY_JSON).unwrap();
        assert_eq!(
            recurrence.schedules(),
            &[Schedule::weekly(Weekday::Thu, 1, t(19, 0), t(22, 30))]
        );
    }

    #[test]
    fn test_parse_monthly_with_last() {
        let json = r#"{"schedules":[{"type":"monthly_nth_weekday","weekday":"sunday","start_time":"14:00","end_time":"17:00","positions":[-1,1,3]}]}"#;
        let recurrence = Recurrence::from_json(json).unwrap();
        match &recurrence.schedules()[0].pattern {
            Pattern::MonthlyNthWeekday { weekday, positions } => {
                assert_eq!(*weekday, Weekday::Sun);
                assert_eq!(
                    positions,
                    &vec![WeekOrdinal::First, WeekOrdinal::Third, WeekOrdinal::Last]
                );
            }
            other => panic!("expected monthly pattern, got {other:?}"),
        }
    }

    #[test]
    fn test_canonical_round_trip_is_bit_for_bit() {
        let recurrence = Recurrence::from_json(WEEKLY_JSON).unwrap();
        assert_eq!(recurrence.to_definition().to_json(), WEEKLY_JSON);

        let monthly = r#"{"schedules":[{"type":"monthly_nth_weekday","weekday":"sunday","start_time":"14:00","end_time":"17:00","positions":[1,3,-1]}]}"#;
        let recurrence = Recurrence::from_json(monthly).unwrap();
        assert_eq!(recurrence.to_definition().to_json(), monthly);
    }

    #[test]
    fn test_multiple_schedules_are_kept_in_order() {
        let json = r#"{"schedules":[
            {"type":"weekly","weekday":"monday","start_time":"20:00","end_time":"23:00","every_n_weeks":2},
            {"type":"monthly_nth_weekday","weekday":"saturday","start_time":"13:00","end_time":"16:00","positions":[2]}
        ]}"#;
        let recurrence = Recurrence::from_json(json).unwrap();
        assert_eq!(recurrence.schedules().len(), 2);
        assert_eq!(recurrence.schedules()[0].weekday(), Weekday::Mon);
        assert_eq!(recurrence.schedules()[1].weekday(), Weekday::Sat);
    }

    #[test]
    fn test_rejects_empty_definition() {
        assert_eq!(
            Recurrence::from_json(r#"{"schedules":[]}"#).unwrap_err(),
            ValidationError::Empty
        );
    }

    #[test]
    fn test_rejects_weekly_without_interval() {
        let json = r#"{"schedules":[{"type":"weekly","weekday":"friday","start_time":"19:00","end_time":"22:00"}]}"#;
        assert_eq!(
            Recurrence::from_json(json).unwrap_err(),
            ValidationError::InvalidInterval { index: 0 }
        );
    }

    #[test]
    fn test_rejects_zero_interval() {
        let json = r#"{"schedules":[{"type":"weekly","weekday":"friday","start_time":"19:00","end_time":"22:00","every_n_weeks":0}]}"#;
        assert!(matches!(
            Recurrence::from_json(json),
            Err(ValidationError::InvalidInterval { index: 0 })
        ));
    }

    #[test]
    fn test_rejects_monthly_without_positions() {
        let json = r#"{"schedules":[{"type":"monthly_nth_weekday","weekday":"friday","start_time":"19:00","end_time":"22:00","positions":[]}]}"#;
        assert_eq!(
            Recurrence::from_json(json).unwrap_err(),
            ValidationError::MissingPositions { index: 0 }
        );
    }

    #[test]
    fn test_rejects_fifth_position() {
        let json = r#"{"schedules":[{"type":"monthly_nth_weekday","weekday":"friday","start_time":"19:00","end_time":"22:00","positions":[1,5]}]}"#;
        assert_eq!(
            Recurrence::from_json(json).unwrap_err(),
            ValidationError::InvalidPosition { index: 0, value: 5 }
        );
    }

    #[test]
    fn test_rejects_overnight_schedule() {
        let json = r#"{"schedules":[{"type":"weekly","weekday":"saturday","start_time":"22:00","end_time":"01:00","every_n_weeks":1}]}"#;
        assert!(matches!(
            Recurrence::from_json(json),
            Err(ValidationError::StartNotBeforeEnd { index: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_weekday_and_type() {
        let json = r#"{"schedules":[{"type":"weekly","weekday":"funday","start_time":"19:00","end_time":"22:00","every_n_weeks":1}]}"#;
        assert!(matches!(
            Recurrence::from_json(json),
            Err(ValidationError::InvalidWeekday { .. })
        ));

        let json = r#"{"schedules":[{"type":"daily","weekday":"monday","start_time":"19:00","end_time":"22:00"}]}"#;
        assert!(matches!(
            Recurrence::from_json(json),
            Err(ValidationError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_rejects_cross_type_fields() {
        let json = r#"{"schedules":[{"type":"weekly","weekday":"monday","start_time":"19:00","end_time":"22:00","every_n_weeks":1,"positions":[1]}]}"#;
        assert!(matches!(
            Recurrence::from_json(json),
            Err(ValidationError::UnexpectedField { field: "positions", .. })
        ));
    }

    #[test]
    fn test_rejects_sloppy_times() {
        for bad in ["7:00", "19:0", "25:00", "19h00", ""] {
            assert!(parse_hhmm(bad).is_none(), "{bad} should be rejected");
        }
        assert_eq!(parse_hhmm("07:05"), Some(t(7, 5)));
    }

    #[test]
    fn test_malformed_json_is_validation_error() {
        assert!(matches!(
            Recurrence::from_json("{not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_rrule_export_weekly() {
        let schedule = Schedule::weekly(Weekday::Thu, 2, t(19, 0), t(22, 30));
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        // The week of 2024-01-04 is odd-numbered, so the first aligned Thursday is 2024-01-11.
        assert_eq!(
            schedule.to_rrule("America/Chicago", from),
            "DTSTART;TZID=America/Chicago:20240111T190000\nRRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=TH"
        );
    }

    #[test]
    fn test_rrule_export_near_end_of_calendar() {
        let schedule = Schedule::weekly(Weekday::Thu, 1, t(19, 0), t(22, 0));
        let from = NaiveDate::MAX - chrono::Duration::days(3);
        let exported = schedule.to_rrule("UTC", from);
        assert!(exported.ends_with("RRULE:FREQ=WEEKLY;INTERVAL=1;BYDAY=TH"));
    }

    #[test]
    fn test_rrule_export_monthly() {
        let schedule = Schedule::monthly(
            Weekday::Sun,
            &[WeekOrdinal::Last, WeekOrdinal::First],
            t(14, 0),
            t(17, 0),
        );
        let from = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            schedule.to_rrule("Europe/Dublin", from),
            "DTSTART;TZID=Europe/Dublin:20240303T140000\nRRULE:FREQ=MONTHLY;BYDAY=1SU,-1SU"
        );
    }
}
