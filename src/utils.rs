/// Time helpers for session bookkeeping and export naming
use time::{format_description, OffsetDateTime};
use tokio::time::Instant;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format.
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]")
        .ok()
        .and_then(|format| dt.format(&format).ok())
        .unwrap_or_else(|| dt.to_string())
}

/// File name for one session's export, e.g. `imu_session_20240131_142501.csv`.
pub fn export_file_name(dt: &OffsetDateTime) -> String {
    let stamp = format_description::parse("[year][month][day]_[hour][minute][second]")
        .ok()
        .and_then(|format| dt.format(&format).ok())
        .unwrap_or_else(|| dt.unix_timestamp().to_string());
    format!("imu_session_{}.csv", stamp)
}

/// Local wall-clock time, or UTC when the local offset is unavailable.
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Whole milliseconds elapsed since `since`.
pub fn elapsed_ms(since: Instant) -> i64 {
    i64::try_from(since.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn export_name_is_sortable() {
        let dt = datetime!(2024-01-31 14:25:01 UTC);
        assert_eq!(export_file_name(&dt), "imu_session_20240131_142501.csv");
        assert_eq!(format_datetime(&dt), "31.01.2024 - 14:25:01");
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_follows_tokio_clock() {
        let start = Instant::now();
        tokio::time::advance(std::time::Duration::from_millis(50)).await;
        assert_eq!(elapsed_ms(start), 50);
    }
}
