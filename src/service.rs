//! Service-day resolution: which `service_id`s run "today".
//!
//! A service day does not match the calendar day. It stretches from 03:00
//! local time to 02:59:59 the next morning, so very-early trips still count
//! against the previous day's service.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

/// A row from `calendar.txt`: a weekly pattern valid over a date range.
#[derive(Debug, Clone)]
pub struct CalendarEntry {
    pub service_id: String,
    /// Monday first.
    pub days: [bool; 7],
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// A row from `calendar_dates.txt`. `exception_type` 1 adds the service on
/// `date`, 2 removes it.
#[derive(Debug, Clone)]
pub struct CalendarException {
    pub service_id: String,
    pub date: NaiveDate,
    pub exception_type: i32,
}

#[derive(Debug, Default)]
pub struct ServiceCalendar {
    pub entries: Vec<CalendarEntry>,
    pub exceptions: Vec<CalendarException>,
}

impl ServiceCalendar {
    /// Service ids valid for the service day containing `now`.
    ///
    /// Exceptions are an override, not a merge: if any exception row exists
    /// for a checked date, only type-1 rows for those dates count and the
    /// weekly calendar is not consulted. A date carrying nothing but type-2
    /// removals therefore yields no service at all.
    pub fn valid_service_ids(&self, now: DateTime<Utc>, tz: Tz) -> HashSet<String> {
        let local = now.with_timezone(&tz);
        let mut dates = vec![local.date_naive()];
        if local.hour() < 3 {
            if let Some(yesterday) = local.date_naive().pred_opt() {
                dates.push(yesterday);
            }
        }

        let matching: Vec<&CalendarException> = self
            .exceptions
            .iter()
            .filter(|e| dates.contains(&e.date))
            .collect();
        if !matching.is_empty() {
            return matching
                .iter()
                .filter(|e| e.exception_type == 1)
                .map(|e| e.service_id.clone())
                .collect();
        }

        let mut valid = HashSet::new();
        for date in dates {
            let day_idx = date.weekday().num_days_from_monday() as usize;
            for entry in &self.entries {
                if entry.days[day_idx] && entry.start_date <= date && date <= entry.end_date {
                    valid.insert(entry.service_id.clone());
                }
            }
        }
        valid
    }
}
