use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::time_window::{parse_boundary, Boundary};

/// Election metadata as served by `GET /election/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionStatus {
    /// Server authority flag. Tracked independently of the time-derived
    /// phase; the more restrictive of the two governs vote acceptance.
    pub is_active: bool,
    pub voting_start_date: String,
    pub voting_end_date: String,
    pub voting_start_time: String,
    pub voting_end_time: String,
    pub results_published: bool,
}

impl ElectionStatus {
    /// Parse the server-supplied window into absolute instants.
    /// Malformed date/time fields are repaired with the configured defaults
    /// rather than surfaced; an inverted window is rejected outright.
    pub fn boundary(&self, zone: FixedOffset, fallback: &FallbackWindow) -> Result<Boundary> {
        let start = instant_or_fallback(
            &self.voting_start_date,
            &self.voting_start_time,
            zone,
            fallback.start,
        );
        let end = instant_or_fallback(
            &self.voting_end_date,
            &self.voting_end_time,
            zone,
            fallback.end,
        );
        Boundary::new(start, end)
    }
}

/// The default voting window applied when the backend supplies malformed
/// time fields or no status at all. Invariant: `start <= end`, enforced by
/// `Config` when the window is built.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FallbackWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl FallbackWindow {
    /// The fallback window placed on today's date in the institution zone.
    /// Callers pairing this with a synthesized status must assume the
    /// election inactive so the default never permits a vote.
    pub fn today(&self, zone: FixedOffset) -> Boundary {
        let today = Utc::now().with_timezone(&zone).date_naive();
        Boundary {
            start: to_utc(today, self.start, zone),
            end: to_utc(today, self.end, zone),
        }
    }
}

/// Combine the raw fields into an instant, repairing whichever field fails
/// to parse instead of propagating the failure.
fn instant_or_fallback(
    date: &str,
    time: &str,
    zone: FixedOffset,
    fallback: NaiveTime,
) -> DateTime<Utc> {
    match parse_boundary(date, time, zone) {
        Ok(instant) => instant,
        Err(err) => {
            warn!("{err}; repairing with default window time");
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .unwrap_or_else(|_| Utc::now().with_timezone(&zone).date_naive());
            let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
                .unwrap_or(fallback);
            to_utc(date, time, zone)
        }
    }
}

fn to_utc(date: NaiveDate, time: NaiveTime, zone: FixedOffset) -> DateTime<Utc> {
    // A fixed offset has no DST gaps, so the conversion is unambiguous.
    match zone.from_local_datetime(&date.and_time(time)) {
        chrono::LocalResult::Single(instant) => instant.with_timezone(&Utc),
        _ => Utc.from_utc_datetime(&date.and_time(time)),
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl ElectionStatus {
        pub fn example() -> Self {
            Self {
                is_active: true,
                voting_start_date: "2024-03-01".to_string(),
                voting_end_date: "2024-03-01".to_string(),
                voting_start_time: "08:00".to_string(),
                voting_end_time: "17:00".to_string(),
                results_published: false,
            }
        }
    }

    impl FallbackWindow {
        pub fn example() -> Self {
            Self {
                start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn well_formed_status_parses_to_instants() {
        let status = ElectionStatus::example();
        let boundary = status.boundary(zone(), &FallbackWindow::example()).unwrap();
        assert_eq!(
            boundary.start,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
        );
        assert_eq!(
            boundary.end,
            Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap()
        );
    }

    #[test]
    fn malformed_time_is_repaired_with_the_default() {
        let mut status = ElectionStatus::example();
        status.voting_end_time = "5pm".to_string();
        let boundary = status.boundary(zone(), &FallbackWindow::example()).unwrap();
        // The date survives; only the unparseable time is replaced.
        assert_eq!(
            boundary.end,
            Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap()
        );
    }

    #[test]
    fn inverted_window_is_rejected() {
        let mut status = ElectionStatus::example();
        status.voting_start_date = "2024-03-02".to_string();
        assert!(status.boundary(zone(), &FallbackWindow::example()).is_err());
    }

    #[test]
    fn fallback_window_lands_on_today() {
        let fallback = FallbackWindow::example();
        let boundary = fallback.today(zone());
        assert!(boundary.start <= boundary.end);
        assert_eq!(
            boundary.start.date_naive(),
            Utc::now().with_timezone(&zone()).date_naive()
        );
    }

    #[test]
    fn wire_format_is_camel_case() {
        let status: ElectionStatus = serde_json::from_str(
            r#"{
                "isActive": true,
                "votingStartDate": "2024-03-01",
                "votingEndDate": "2024-03-01",
                "votingStartTime": "08:00",
                "votingEndTime": "17:00",
                "resultsPublished": false
            }"#,
        )
        .unwrap();
        assert_eq!(status, ElectionStatus::example());
    }
}
