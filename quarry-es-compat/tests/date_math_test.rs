//! Property tests for date math: rendering then parsing gives back the same
//! expression, and evaluation never panics.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use quarry_es_compat::query::date_math::{self, DateMathExpression, DateUnit, Interval};

fn unit() -> impl Strategy<Value = DateUnit> {
    prop::sample::select(vec![
        DateUnit::Second,
        DateUnit::Minute,
        DateUnit::Hour,
        DateUnit::Day,
        DateUnit::Week,
        DateUnit::Month,
        DateUnit::Year,
    ])
}

fn expression() -> impl Strategy<Value = DateMathExpression> {
    (
        prop::collection::vec((-5000i64..5000, unit()), 0..5),
        prop::option::of(unit()),
    )
        .prop_map(|(intervals, rounding)| DateMathExpression {
            intervals: intervals
                .into_iter()
                .map(|(amount, unit)| Interval::new(amount, unit))
                .collect(),
            rounding,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_render_parse_round_trip(expr in expression()) {
        let text = expr.to_string();
        prop_assert_eq!(date_math::parse(&text).unwrap(), expr);
    }

    #[test]
    fn test_evaluate_never_panics(expr in expression(), secs in 0i64..4_102_444_800) {
        let now = Utc.timestamp_opt(secs, 0).unwrap();
        let _ = expr.evaluate(now);
    }

    #[test]
    fn test_garbage_is_rejected_without_panic(input in "now[-+/0-9a-zA-Z ]{0,16}") {
        let _ = date_math::parse(&input);
    }
}

#[test]
fn test_rounding_applies_after_intervals() {
    let now = Utc.with_ymd_and_hms(2024, 3, 31, 15, 30, 0).unwrap();
    let expr = date_math::parse("now-1M/M").unwrap();
    assert_eq!(
        expr.evaluate(now).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    );
}
