use chrono::{DateTime, Datelike, Weekday};

use crate::model::{Ms, SLOT_MS, Span};

const DAY_MS: Ms = 86_400_000;

/// Cut an administrator range into consecutive 30-minute slots starting at
/// `range.start`. The last slot may run past `range.end` when the range is not
/// a whole number of half hours.
pub fn half_hour_slots(range: Span) -> Vec<Span> {
    let mut out = Vec::new();
    let mut cur = range.start;
    while cur < range.end {
        out.push(Span::new(cur, cur + SLOT_MS));
        cur += SLOT_MS;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Daily,
    Weekly,
    /// Daily, skipping copies that land on Saturday or Sunday (UTC).
    Weekdays,
}

/// The base slots followed by `count` shifted copies of them.
pub fn repeat(base: &[Span], recurrence: Recurrence, count: u32) -> Vec<Span> {
    let mut out = base.to_vec();
    for i in 1..=Ms::from(count) {
        let shift = match recurrence {
            Recurrence::Weekly => 7 * DAY_MS * i,
            Recurrence::Daily | Recurrence::Weekdays => DAY_MS * i,
        };
        for span in base {
            let start = span.start + shift;
            if recurrence == Recurrence::Weekdays && is_weekend(start) {
                continue;
            }
            out.push(Span::new(start, span.end + shift));
        }
    }
    out
}

fn is_weekend(ms: Ms) -> bool {
    DateTime::from_timestamp_millis(ms)
        .is_some_and(|t| matches!(t.weekday(), Weekday::Sat | Weekday::Sun))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-06-06T09:00:00Z, a Friday.
    const FRI_9AM: Ms = 1_749_200_400_000;

    #[test]
    fn range_splits_into_half_hours() {
        let slots = half_hour_slots(Span::new(FRI_9AM, FRI_9AM + 2 * 3_600_000));
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0], Span::new(FRI_9AM, FRI_9AM + SLOT_MS));
        assert_eq!(slots[3].end, FRI_9AM + 2 * 3_600_000);
    }

    #[test]
    fn ragged_range_overshoots_end() {
        let slots = half_hour_slots(Span::new(FRI_9AM, FRI_9AM + 45 * 60_000));
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].end, FRI_9AM + 2 * SLOT_MS);
    }

    #[test]
    fn weekly_repeat_shifts_by_seven_days() {
        let base = [Span::new(FRI_9AM, FRI_9AM + SLOT_MS)];
        let all = repeat(&base, Recurrence::Weekly, 2);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].start, FRI_9AM + 14 * DAY_MS);
    }

    #[test]
    fn weekdays_repeat_skips_weekend() {
        let base = [Span::new(FRI_9AM, FRI_9AM + SLOT_MS)];
        // Sat, Sun skipped; Mon, Tue kept.
        let all = repeat(&base, Recurrence::Weekdays, 4);
        let starts: Vec<Ms> = all.iter().map(|s| s.start).collect();
        assert_eq!(
            starts,
            vec![FRI_9AM, FRI_9AM + 3 * DAY_MS, FRI_9AM + 4 * DAY_MS]
        );
    }
}
