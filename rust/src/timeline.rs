//! Display labels for message timestamps.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};

/// Fixed offset used for every label, so tests are not tied to the host zone.
#[derive(Clone, Copy, Debug)]
pub struct LabelClock {
    offset: FixedOffset,
}

impl LabelClock {
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    /// The offset of the host's local zone right now.
    pub fn local() -> Self {
        let offset = chrono::Local::now().offset().fix();
        Self { offset }
    }

    fn at(&self, millis: i64) -> DateTime<FixedOffset> {
        let utc = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();
        utc.with_timezone(&self.offset)
    }

    fn day(&self, millis: i64) -> NaiveDate {
        self.at(millis).date_naive()
    }

    /// `HH:MM`, 24-hour.
    pub fn time_label(&self, millis: i64) -> String {
        self.at(millis).format("%H:%M").to_string()
    }

    /// "Today", "Yesterday", or a long date such as "June 10, 2024".
    pub fn date_label(&self, millis: i64, now: i64) -> String {
        let day = self.day(millis);
        let today = self.day(now);
        if day == today {
            "Today".to_string()
        } else if Some(day) == today.checked_sub_signed(Duration::days(1)) {
            "Yesterday".to_string()
        } else {
            day.format("%B %-d, %Y").to_string()
        }
    }

    /// True when the two instants fall on different calendar days.
    pub fn crosses_day(&self, a: i64, b: i64) -> bool {
        self.day(a) != self.day(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-06-10 12:00:00 UTC
    const NOON: i64 = 1_718_020_800_000;
    const DAY: i64 = 86_400_000;

    #[test]
    fn relative_day_labels() {
        let clock = LabelClock::new(0);
        assert_eq!(clock.date_label(NOON, NOON), "Today");
        assert_eq!(clock.date_label(NOON - DAY, NOON), "Yesterday");
        assert_eq!(clock.date_label(NOON - 3 * DAY, NOON), "June 7, 2024");
    }

    #[test]
    fn labels_follow_the_configured_offset() {
        let utc = LabelClock::new(0);
        let ist = LabelClock::new(330);
        assert_eq!(utc.time_label(NOON), "12:00");
        assert_eq!(ist.time_label(NOON), "17:30");

        // 20:00 UTC is already the next day at +05:30.
        let evening = NOON + 8 * 3_600_000;
        assert!(!utc.crosses_day(NOON, evening));
        assert!(ist.crosses_day(NOON, evening));
    }
}
