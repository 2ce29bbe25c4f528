//! Date strategy: interval buckets of a timestamp key mapped to shards

use super::{bounds, not_routable, ShardStrategy};
use crate::error::Result;
use crate::types::{DateRange, EntityRecord, Predicate, ShardDescriptor, ShardId};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;

/// Bucket width of a date-sharded entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateInterval {
    /// Calendar year
    Year,
    /// Calendar quarter
    Quarter,
    /// Calendar month
    Month,
    /// ISO week (Monday start)
    Week,
    /// Calendar day
    Day,
    /// Clock hour
    Hour,
}

impl DateInterval {
    /// Parse a config token
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "year" => Some(DateInterval::Year),
            "quarter" => Some(DateInterval::Quarter),
            "month" => Some(DateInterval::Month),
            "week" => Some(DateInterval::Week),
            "day" => Some(DateInterval::Day),
            "hour" => Some(DateInterval::Hour),
            _ => None,
        }
    }

    /// The half-open bucket containing `t`
    pub fn bucket(&self, t: DateTime<Utc>) -> DateRange {
        let day = t.date_naive();
        match self {
            DateInterval::Year => DateRange::new(
                month_start(t.year(), 1),
                month_start(t.year() + 1, 1),
            ),
            DateInterval::Quarter => {
                let first_month = (t.month0() / 3) * 3 + 1;
                let start = month_start(t.year(), first_month);
                let (y, m) = add_months(t.year(), first_month, 3);
                DateRange::new(start, month_start(y, m))
            }
            DateInterval::Month => {
                let start = month_start(t.year(), t.month());
                let (y, m) = add_months(t.year(), t.month(), 1);
                DateRange::new(start, month_start(y, m))
            }
            DateInterval::Week => {
                let monday = day - Duration::days(t.weekday().num_days_from_monday() as i64);
                let start = midnight(monday);
                DateRange::new(start, start + Duration::days(7))
            }
            DateInterval::Day => {
                let start = midnight(day);
                DateRange::new(start, start + Duration::days(1))
            }
            DateInterval::Hour => {
                let start = midnight(day) + Duration::hours(t.hour() as i64);
                DateRange::new(start, start + Duration::hours(1))
            }
        }
    }
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is a valid instant")
}

fn midnight(day: chrono::NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
}

fn add_months(year: i32, month: u32, delta: u32) -> (i32, u32) {
    let zero_based = (month - 1) + delta;
    (year + (zero_based / 12) as i32, zero_based % 12 + 1)
}

/// Routes a timestamp key into the shard whose date range holds it
///
/// The naming pattern is chrono strftime, extended with `%q` for the quarter
/// number; it drives bucket naming for new-shard requests and diagnostics.
#[derive(Debug, Clone)]
pub struct DateStrategy {
    key_field: String,
    interval: DateInterval,
    pattern: String,
    shards: Vec<(ShardId, DateRange)>,
}

impl DateStrategy {
    /// Create a strategy over `key_field` with explicit shard date ranges
    pub fn new(
        key_field: impl Into<String>,
        interval: DateInterval,
        pattern: impl Into<String>,
        shards: Vec<(ShardId, DateRange)>,
    ) -> Self {
        Self {
            key_field: key_field.into(),
            interval,
            pattern: pattern.into(),
            shards,
        }
    }

    /// The bucket name of an instant under the strategy's pattern
    pub fn bucket_name(&self, t: DateTime<Utc>) -> String {
        let quarter = t.month0() / 3 + 1;
        let pattern = self.pattern.replace("%q", &quarter.to_string());
        t.format(&pattern).to_string()
    }

    /// The half-open bucket containing `t`
    pub fn bucket(&self, t: DateTime<Utc>) -> DateRange {
        self.interval.bucket(t)
    }

    fn key_date(&self, record: &EntityRecord) -> Option<DateTime<Utc>> {
        record.key_value(&self.key_field).and_then(|v| v.as_date())
    }
}

impl ShardStrategy for DateStrategy {
    fn name(&self) -> &'static str {
        "date"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        let t = self.key_date(record).ok_or_else(|| {
            not_routable(
                record,
                format!("shard key '{}' is null or not a timestamp", self.key_field),
            )
        })?;
        self.shards
            .iter()
            .find(|(_, range)| range.contains(t))
            .map(|(id, _)| id.clone())
            .ok_or_else(|| {
                not_routable(
                    record,
                    format!(
                        "no shard covers bucket '{}' ({} = {})",
                        self.bucket_name(t),
                        self.key_field,
                        t.to_rfc3339()
                    ),
                )
            })
    }

    fn candidates(
        &self,
        predicates: &[Predicate],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>> {
        let (lower, upper) = bounds(predicates, &self.key_field);
        let lower = lower.and_then(|(v, inclusive)| v.as_date().map(|d| (d, inclusive)));
        let upper = upper.and_then(|(v, inclusive)| v.as_date().map(|d| (d, inclusive)));

        let constrained = lower.is_some() || upper.is_some();
        let set: BTreeSet<ShardId> = self
            .shards
            .iter()
            .filter(|(_, range)| {
                if let Some((v, _)) = lower {
                    // rows in the shard are strictly before range.end
                    if range.end <= v {
                        return false;
                    }
                }
                if let Some((v, inclusive)) = upper {
                    if range.start > v || (range.start == v && !inclusive) {
                        return false;
                    }
                }
                if !constrained {
                    // an as-of point excludes shards that only hold the future
                    if let Some(t) = as_of {
                        if range.start > t {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|(id, _)| id.clone())
            .collect();

        Ok(set)
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        let mut errors = Vec::new();

        for (i, (id_a, range_a)) in self.shards.iter().enumerate() {
            for (id_b, range_b) in self.shards.iter().skip(i + 1) {
                if range_a.overlaps(range_b) {
                    errors.push(format!(
                        "date strategy has overlapping ranges for shards '{}' and '{}'",
                        id_a, id_b
                    ));
                }
            }
        }

        if StrftimeItems::new(&self.pattern.replace("%q", "1"))
            .any(|item| matches!(item, Item::Error))
        {
            errors.push(format!(
                "date strategy naming pattern '{}' is not valid",
                self.pattern
            ));
        }

        errors.extend(super::check_known_shards(
            self.name(),
            self.shards.iter().map(|(id, _)| id),
            shards,
        ));
        errors
    }

    fn key_field(&self) -> Option<&str> {
        Some(&self.key_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn month_shards() -> Vec<(ShardId, DateRange)> {
        [
            ("2024-01", "2024-01-01T00:00:00Z", "2024-02-01T00:00:00Z"),
            ("2024-02", "2024-02-01T00:00:00Z", "2024-03-01T00:00:00Z"),
            ("2024-03", "2024-03-01T00:00:00Z", "2024-04-01T00:00:00Z"),
        ]
        .iter()
        .map(|(id, start, end)| (ShardId::from(*id), DateRange::new(ts(start), ts(end))))
        .collect()
    }

    fn strategy() -> DateStrategy {
        DateStrategy::new("transaction_date", DateInterval::Month, "%Y-%m", month_shards())
    }

    #[test]
    fn test_route_to_month_shard() {
        let s = strategy();
        let record = EntityRecord::new(
            "transactions",
            json!({"transaction_date": "2024-02-14T09:30:00Z"}),
        );
        assert_eq!(s.route(&record).unwrap(), ShardId::from("2024-02"));
    }

    #[test]
    fn test_route_outside_configured_ranges() {
        let s = strategy();
        let record = EntityRecord::new(
            "transactions",
            json!({"transaction_date": "2025-06-01T00:00:00Z"}),
        );
        assert!(s.route(&record).is_err());
    }

    #[test]
    fn test_candidates_narrow_by_bounds() {
        // where transaction_date >= 2024-02-15 and transaction_date < 2024-03-10
        let s = strategy();
        let set = s
            .candidates(
                &[
                    Predicate::gte("transaction_date", ts("2024-02-15T00:00:00Z")),
                    Predicate::lt("transaction_date", ts("2024-03-10T00:00:00Z")),
                ],
                None,
            )
            .unwrap();
        assert_eq!(
            set,
            BTreeSet::from([ShardId::from("2024-02"), ShardId::from("2024-03")])
        );
    }

    #[test]
    fn test_candidates_as_of_excludes_future_shards() {
        let s = strategy();
        let set = s
            .candidates(&[], Some(ts("2024-02-10T00:00:00Z")))
            .unwrap();
        assert_eq!(
            set,
            BTreeSet::from([ShardId::from("2024-01"), ShardId::from("2024-02")])
        );
    }

    #[test]
    fn test_bucket_names() {
        let s = strategy();
        assert_eq!(s.bucket_name(ts("2024-02-14T09:30:00Z")), "2024-02");

        let quarterly = DateStrategy::new(
            "transaction_date",
            DateInterval::Quarter,
            "%Y_Q%q",
            vec![],
        );
        assert_eq!(quarterly.bucket_name(ts("2024-05-01T00:00:00Z")), "2024_Q2");
    }

    #[test]
    fn test_interval_buckets() {
        let t = ts("2024-02-14T09:30:00Z");

        let month = DateInterval::Month.bucket(t);
        assert_eq!(month.start, ts("2024-02-01T00:00:00Z"));
        assert_eq!(month.end, ts("2024-03-01T00:00:00Z"));

        let quarter = DateInterval::Quarter.bucket(t);
        assert_eq!(quarter.start, ts("2024-01-01T00:00:00Z"));
        assert_eq!(quarter.end, ts("2024-04-01T00:00:00Z"));

        let week = DateInterval::Week.bucket(t);
        assert_eq!(week.start, ts("2024-02-12T00:00:00Z"));

        let year_end = DateInterval::Month.bucket(ts("2024-12-10T00:00:00Z"));
        assert_eq!(year_end.end, ts("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_validate_overlapping_ranges() {
        let s = DateStrategy::new(
            "t",
            DateInterval::Month,
            "%Y-%m",
            vec![
                (
                    ShardId::from("a"),
                    DateRange::new(ts("2024-01-01T00:00:00Z"), ts("2024-03-01T00:00:00Z")),
                ),
                (
                    ShardId::from("b"),
                    DateRange::new(ts("2024-02-01T00:00:00Z"), ts("2024-04-01T00:00:00Z")),
                ),
            ],
        );
        let shards = vec![
            ShardDescriptor::new("a", "mem://a"),
            ShardDescriptor::new("b", "mem://b"),
        ];
        assert!(!s.validate(&shards).is_empty());
    }
}
