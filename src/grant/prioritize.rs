//! Burn-down order over grants.

use std::cmp::Ordering;

use super::model::Grant;

/// Sorts grants into burn-down order: lower `priority` first, then sooner
/// expiration, then original order. Grants without an expiration sort last
/// among equal priorities.
///
/// Implemented as two stable sorts so ties keep the order of the previous
/// pass.
pub fn prioritize_grants(grants: &mut [Grant]) {
    if grants.is_empty() {
        return;
    }
    grants.sort_by(|a, b| compare_expiration(a, b));
    grants.sort_by_key(|g| g.priority);
}

fn compare_expiration(a: &Grant, b: &Grant) -> Ordering {
    match (a.expiration(), b.expiration()) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn ids(grants: &[Grant]) -> Vec<&str> {
        grants.iter().map(|g| g.id.as_str()).collect()
    }

    #[test]
    fn test_priority_is_primary() {
        let mut grants = vec![
            Grant::new("low", "o", dec!(1), t0()).with_priority(5),
            Grant::new("high", "o", dec!(1), t0())
                .with_priority(1)
                .with_expires_at(t0() + Duration::days(30)),
        ];
        prioritize_grants(&mut grants);
        assert_eq!(ids(&grants), vec!["high", "low"]);
    }

    #[test]
    fn test_expiration_breaks_ties() {
        let mut grants = vec![
            Grant::new("never", "o", dec!(1), t0()),
            Grant::new("late", "o", dec!(1), t0()).with_expires_at(t0() + Duration::days(10)),
            Grant::new("soon", "o", dec!(1), t0()).with_expires_at(t0() + Duration::days(1)),
        ];
        prioritize_grants(&mut grants);
        assert_eq!(ids(&grants), vec!["soon", "late", "never"]);
    }

    #[test]
    fn test_original_order_is_final_tiebreak() {
        let mut grants = vec![
            Grant::new("first", "o", dec!(1), t0()),
            Grant::new("second", "o", dec!(1), t0()),
        ];
        prioritize_grants(&mut grants);
        assert_eq!(ids(&grants), vec!["first", "second"]);

        let mut empty: Vec<Grant> = vec![];
        prioritize_grants(&mut empty);
        assert!(empty.is_empty());
    }
}
