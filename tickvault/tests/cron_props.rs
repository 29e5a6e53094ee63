//! Property tests for cron next-fire computation.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use proptest::prelude::*;
use tickvault::CronExpression;

fn arb_field(max: u32, one_based: bool) -> impl Strategy<Value = String> {
    let lo = u32::from(one_based);
    prop_oneof![
        Just("*".to_string()),
        (lo..=max).prop_map(|v| v.to_string()),
        (1..=9u32).prop_map(|n| format!("*/{n}")),
        (lo..=max).prop_flat_map(move |a| (a..=max).prop_map(move |b| format!("{a}-{b}"))),
    ]
}

fn arb_cron() -> impl Strategy<Value = String> {
    (
        arb_field(59, false),
        arb_field(23, false),
        arb_field(28, true), // stay within every month's day count
        arb_field(12, true),
        arb_field(6, false),
    )
        .prop_map(|(m, h, dom, mo, dow)| format!("{m} {h} {dom} {mo} {dow}"))
}

fn arb_zone() -> impl Strategy<Value = Tz> {
    prop_oneof![
        Just(chrono_tz::UTC),
        Just(chrono_tz::America::New_York),
        Just(chrono_tz::Europe::London),
        Just(chrono_tz::Asia::Tokyo),
        Just(chrono_tz::Australia::Sydney),
    ]
}

fn arb_start() -> impl Strategy<Value = DateTime<Utc>> {
    // 2025-01-01 .. 2027-12-31, minute granularity; spans DST transitions.
    (0i64..(3 * 365 * 24 * 60)).prop_map(|minutes| {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// `next_after` is strictly in the future, and iterating it never
    /// produces a fire at or before the previous one.
    #[test]
    fn next_fire_is_strictly_monotonic(expr in arb_cron(), tz in arb_zone(), start in arb_start()) {
        let cron = CronExpression::parse(&expr).unwrap();
        let first = cron.next_after(start, tz);
        prop_assume!(first.is_some());
        let first = first.unwrap();
        prop_assert!(first > start);

        let second = cron.next_after(first, tz).unwrap();
        prop_assert!(second > first);
    }

    /// The fire instant matches the expression on the local wall clock.
    #[test]
    fn fire_matches_expression_locally(expr in arb_cron(), tz in arb_zone(), start in arb_start()) {
        let cron = CronExpression::parse(&expr).unwrap();
        prop_assume!(cron.next_after(start, tz).is_some());
        let fire = cron.next_after(start, tz).unwrap();
        let local = fire.with_timezone(&tz).naive_local();
        prop_assert!(cron.matches_local(&local));
    }
}
