//! Retention planning
//!
//! Given the flight keys present on disk and the retention count `N`, decide
//! which flights to evict (oldest first) and which key the new flight gets.
//! After applying a plan at most `N` flights remain, the new one included.

use super::naming::{FlightKey, MAX_SUFFIX};
use chrono::NaiveDate;
use std::collections::BTreeSet;

const SUFFIX_SPAN: u16 = MAX_SUFFIX as u16 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Flights to delete, oldest first
    pub evict: Vec<FlightKey>,
    pub next: FlightKey,
}

/// Plan for two-digit suffix keys.
///
/// Suffixes roll over from 99 to 0. A set holding both 0 and 99 is treated as
/// wrapped: the oldest flight is the one after the largest gap.
pub fn plan_suffix(present: &BTreeSet<u8>, retain: usize) -> RetentionPlan {
    let ordered = circular_order(present);
    let Some(&newest) = ordered.last() else {
        return RetentionPlan {
            evict: Vec::new(),
            next: FlightKey::Suffix(0),
        };
    };

    let next = ((newest as u16 + 1) % SUFFIX_SPAN) as u8;
    let distance = |from: u8| (next as u16 + SUFFIX_SPAN - from as u16) % SUFFIX_SPAN;
    let keep = retain.saturating_sub(1) as u16;

    let mut evict = Vec::new();
    for &suffix in &ordered {
        if distance(suffix) > keep || suffix == next {
            evict.push(FlightKey::Suffix(suffix));
        } else {
            break;
        }
    }
    // A full ring wraps onto the oldest flight.
    if !evict.contains(&FlightKey::Suffix(next)) && present.contains(&next) {
        evict.push(FlightKey::Suffix(next));
    }

    RetentionPlan {
        evict,
        next: FlightKey::Suffix(next),
    }
}

/// Present suffixes ordered oldest to newest.
fn circular_order(present: &BTreeSet<u8>) -> Vec<u8> {
    let sorted: Vec<u8> = present.iter().copied().collect();
    if !(present.contains(&0) && present.contains(&MAX_SUFFIX)) {
        return sorted;
    }

    // Index after the largest gap, counting the gap across the rollover.
    let mut start = 0;
    let mut widest = 0u16;
    for (i, &suffix) in sorted.iter().enumerate() {
        let prev = if i == 0 {
            sorted[sorted.len() - 1]
        } else {
            sorted[i - 1]
        };
        let gap = (suffix as u16 + SUFFIX_SPAN - prev as u16) % SUFFIX_SPAN;
        if gap > widest {
            widest = gap;
            start = i;
        }
    }
    sorted[start..]
        .iter()
        .chain(sorted[..start].iter())
        .copied()
        .collect()
}

/// Plan for date-sequence keys: the new flight is `today` with the next
/// unused sequence number for that day.
pub fn plan_dated(present: &BTreeSet<FlightKey>, retain: usize, today: NaiveDate) -> RetentionPlan {
    let seq = present
        .iter()
        .filter_map(|key| match key {
            FlightKey::Dated { date, seq } if *date == today => Some(*seq),
            _ => None,
        })
        .max()
        .unwrap_or(0)
        + 1;

    let keep = retain.saturating_sub(1);
    let excess = present.len().saturating_sub(keep);
    RetentionPlan {
        evict: present.iter().take(excess).copied().collect(),
        next: FlightKey::Dated { date: today, seq },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes(values: &[u8]) -> BTreeSet<u8> {
        values.iter().copied().collect()
    }

    fn keys(plan: &RetentionPlan) -> Vec<u8> {
        plan.evict
            .iter()
            .map(|k| match k {
                FlightKey::Suffix(n) => *n,
                other => panic!("unexpected key {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_empty_disk_starts_at_zero() {
        let plan = plan_suffix(&BTreeSet::new(), 3);
        assert_eq!(plan.next, FlightKey::Suffix(0));
        assert!(plan.evict.is_empty());
    }

    #[test]
    fn test_evicts_oldest_to_make_room() {
        let plan = plan_suffix(&suffixes(&[0, 1, 2]), 3);
        assert_eq!(keys(&plan), vec![0]);
        assert_eq!(plan.next, FlightKey::Suffix(3));
    }

    #[test]
    fn test_under_limit_keeps_everything() {
        let plan = plan_suffix(&suffixes(&[4, 5]), 3);
        assert!(plan.evict.is_empty());
        assert_eq!(plan.next, FlightKey::Suffix(6));
    }

    #[test]
    fn test_rolls_over_at_ninety_nine() {
        let plan = plan_suffix(&suffixes(&[97, 98, 99]), 3);
        assert_eq!(keys(&plan), vec![97]);
        assert_eq!(plan.next, FlightKey::Suffix(0));

        let plan = plan_suffix(&suffixes(&[98, 99, 0]), 3);
        assert_eq!(keys(&plan), vec![98]);
        assert_eq!(plan.next, FlightKey::Suffix(1));
    }

    #[test]
    fn test_gaps_count_against_retention() {
        let plan = plan_suffix(&suffixes(&[1, 8]), 3);
        assert_eq!(keys(&plan), vec![1]);
        assert_eq!(plan.next, FlightKey::Suffix(9));
    }

    #[test]
    fn test_retain_one() {
        let plan = plan_suffix(&suffixes(&[5]), 1);
        assert_eq!(keys(&plan), vec![5]);
        assert_eq!(plan.next, FlightKey::Suffix(6));
    }

    #[test]
    fn test_full_ring_reuses_oldest() {
        let all: BTreeSet<u8> = (0..=MAX_SUFFIX).collect();
        let plan = plan_suffix(&all, 99);
        assert!(plan.evict.contains(&plan.next));
    }

    #[test]
    fn test_dated_sequence_per_day() {
        let day = |d| NaiveDate::from_ymd_opt(2024, 6, d).unwrap();
        let present: BTreeSet<FlightKey> = [
            FlightKey::Dated { date: day(1), seq: 1 },
            FlightKey::Dated { date: day(2), seq: 1 },
            FlightKey::Dated { date: day(2), seq: 2 },
        ]
        .into_iter()
        .collect();

        let plan = plan_dated(&present, 3, day(2));
        assert_eq!(plan.next, FlightKey::Dated { date: day(2), seq: 3 });
        assert_eq!(plan.evict, vec![FlightKey::Dated { date: day(1), seq: 1 }]);

        let plan = plan_dated(&present, 8, day(3));
        assert_eq!(plan.next, FlightKey::Dated { date: day(3), seq: 1 });
        assert!(plan.evict.is_empty());
    }
}
