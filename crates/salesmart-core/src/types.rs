use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Longest window a single backfill may cover.
pub const MAX_BACKFILL_DAYS: u32 = 366;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_handle!(
    /// Identifier of a report-generation task on the report service.
    JobHandle
);
opaque_handle!(
    /// Identifier of a finished report. Only produced from a `SUCCESS` status.
    ReportHandle
);
opaque_handle!(
    /// Identifier of one dated slice of a report.
    IncrementHandle
);

/// Logical partition date of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessDate(NaiveDate);

impl BusinessDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// `YYYY-MM-DD`
    pub fn iso(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }

    /// Midnight of the day, as the report service expects it.
    pub fn midnight(&self) -> String {
        format!("{}T00:00:00", self.iso())
    }

    /// `YYYYMMDD`, used as the prefix of local staging files.
    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    /// The next day, or `None` past the last representable date.
    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(Self)
    }

    /// Inclusive range of dates, oldest first. Empty when `from > to`;
    /// longer than [`MAX_BACKFILL_DAYS`] is a configuration error.
    pub fn range_inclusive(from: BusinessDate, to: BusinessDate) -> Result<Vec<BusinessDate>, PipelineError> {
        if from > to {
            return Ok(Vec::new());
        }
        let span = (to.0 - from.0).num_days() + 1;
        if span > i64::from(MAX_BACKFILL_DAYS) {
            return Err(PipelineError::Config(format!(
                "window {from}..={to} spans {span} days, at most {MAX_BACKFILL_DAYS} allowed"
            )));
        }
        let mut dates = Vec::with_capacity(span as usize);
        let mut current = Some(from);
        while let Some(date) = current.filter(|date| *date <= to) {
            dates.push(date);
            current = date.succ();
        }
        Ok(dates)
    }

    /// The `days` dates preceding `today`, oldest first.
    pub fn trailing_window(today: NaiveDate, days: u32) -> Result<Vec<BusinessDate>, PipelineError> {
        if days == 0 {
            return Ok(Vec::new());
        }
        if days > MAX_BACKFILL_DAYS {
            return Err(PipelineError::Config(format!(
                "backfill of {days} days exceeds the limit of {MAX_BACKFILL_DAYS}"
            )));
        }
        let out_of_range = || {
            PipelineError::Config(format!("{days} days before {today} is out of range"))
        };
        let to = today.checked_sub_days(Days::new(1)).ok_or_else(out_of_range)?;
        let from = today
            .checked_sub_days(Days::new(u64::from(days)))
            .ok_or_else(out_of_range)?;
        BusinessDate::range_inclusive(BusinessDate(from), BusinessDate(to))
    }
}

impl fmt::Display for BusinessDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.iso())
    }
}

impl FromStr for BusinessDate {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(BusinessDate)
            .map_err(|err| PipelineError::Config(format!("invalid business date '{s}': {err}")))
    }
}

impl From<NaiveDate> for BusinessDate {
    fn from(value: NaiveDate) -> Self {
        Self(value)
    }
}

/// Identifiers collected while a run progresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentifierChain {
    pub task_id: Option<JobHandle>,
    pub report_id: Option<ReportHandle>,
    pub increment_id: Option<IncrementHandle>,
}

impl fmt::Display for IdentifierChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn part<T: fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string())
        }
        write!(
            f,
            "task_id={} -> report_id={} -> increment_id={}",
            part(&self.task_id),
            part(&self.report_id),
            part(&self.increment_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> BusinessDate {
        s.parse().unwrap()
    }

    #[test]
    fn formats_business_date_variants() {
        let d = date("2023-05-01");
        assert_eq!(d.iso(), "2023-05-01");
        assert_eq!(d.midnight(), "2023-05-01T00:00:00");
        assert_eq!(d.compact(), "20230501");
    }

    #[test]
    fn rejects_malformed_dates() {
        assert!("2023-13-01".parse::<BusinessDate>().is_err());
        assert!("yesterday".parse::<BusinessDate>().is_err());
    }

    #[test]
    fn trailing_window_ends_yesterday() {
        let today = NaiveDate::from_ymd_opt(2023, 5, 8).unwrap();
        let window = BusinessDate::trailing_window(today, 7).unwrap();
        assert_eq!(window.len(), 7);
        assert_eq!(window.first().unwrap().iso(), "2023-05-01");
        assert_eq!(window.last().unwrap().iso(), "2023-05-07");
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let today = NaiveDate::from_ymd_opt(2023, 5, 8).unwrap();
        assert!(matches!(
            BusinessDate::trailing_window(today, 200_000_000),
            Err(PipelineError::Config(_))
        ));
        assert_eq!(
            BusinessDate::trailing_window(today, MAX_BACKFILL_DAYS)
                .unwrap()
                .len(),
            MAX_BACKFILL_DAYS as usize
        );
        assert!(BusinessDate::range_inclusive(date("2020-01-01"), date("2023-01-01")).is_err());
    }

    #[test]
    fn window_near_the_calendar_edge_does_not_panic() {
        assert!(BusinessDate::trailing_window(NaiveDate::MIN, 3).is_err());

        let last = BusinessDate::new(NaiveDate::MAX);
        let dates = BusinessDate::range_inclusive(last, last).unwrap();
        assert_eq!(dates, vec![last]);
        assert!(last.succ().is_none());
    }

    #[test]
    fn inverted_range_is_empty() {
        let dates = BusinessDate::range_inclusive(date("2023-05-02"), date("2023-05-01")).unwrap();
        assert!(dates.is_empty());
    }

    #[test]
    fn chain_display_marks_missing_ids() {
        let chain = IdentifierChain {
            task_id: Some(JobHandle::new("J1")),
            report_id: None,
            increment_id: None,
        };
        assert_eq!(
            chain.to_string(),
            "task_id=J1 -> report_id=- -> increment_id=-"
        );
    }
}
