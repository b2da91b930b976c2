//! Elasticsearch date math (`now-15m-25s/d`)
//!
//! Expressions are parsed into an ordered list of signed intervals plus an
//! optional rounding unit. Intervals apply left to right exactly as written and
//! rounding applies last. The parsed form can be rendered as store SQL or
//! evaluated against a concrete instant.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use nom::{
    bytes::complete::tag,
    character::complete::{char, digit0, multispace0, one_of, satisfy},
    combinator::opt,
    multi::many0,
    sequence::{pair, preceded, tuple},
    IResult,
};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DateMathError {
    #[error("'{0}' must start with 'now'")]
    MissingAnchor(String),

    #[error("invalid amount '{amount}' in '{expr}'")]
    InvalidAmount { expr: String, amount: String },

    #[error("unknown time unit '{unit}' in '{expr}'")]
    InvalidUnit { expr: String, unit: String },

    #[error("unexpected '{rest}' in '{expr}'")]
    TrailingInput { expr: String, rest: String },

    #[error("'{0}' is outside the supported date range")]
    OutOfRange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DateUnit {
    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            's' => Some(DateUnit::Second),
            'm' => Some(DateUnit::Minute),
            'h' | 'H' => Some(DateUnit::Hour),
            'd' => Some(DateUnit::Day),
            'w' => Some(DateUnit::Week),
            'M' => Some(DateUnit::Month),
            'y' | 'Y' => Some(DateUnit::Year),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            DateUnit::Second => 's',
            DateUnit::Minute => 'm',
            DateUnit::Hour => 'h',
            DateUnit::Day => 'd',
            DateUnit::Week => 'w',
            DateUnit::Month => 'M',
            DateUnit::Year => 'y',
        }
    }

    /// Unit keyword inside an SQL `INTERVAL`
    pub fn sql_name(&self) -> &'static str {
        match self {
            DateUnit::Second => "second",
            DateUnit::Minute => "minute",
            DateUnit::Hour => "hour",
            DateUnit::Day => "day",
            DateUnit::Week => "week",
            DateUnit::Month => "month",
            DateUnit::Year => "year",
        }
    }

    /// Fixed length in seconds, `None` for calendar units
    fn fixed_seconds(&self) -> Option<i64> {
        match self {
            DateUnit::Second => Some(1),
            DateUnit::Minute => Some(60),
            DateUnit::Hour => Some(3_600),
            DateUnit::Day => Some(86_400),
            DateUnit::Week => Some(604_800),
            DateUnit::Month | DateUnit::Year => None,
        }
    }
}

/// One signed step, e.g. `-15m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub amount: i64,
    pub unit: DateUnit,
}

impl Interval {
    pub fn new(amount: i64, unit: DateUnit) -> Self {
        Self { amount, unit }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DateMathExpression {
    pub intervals: Vec<Interval>,
    pub rounding: Option<DateUnit>,
}

/// Quick check used before trying to parse a range bound as date math
pub fn is_date_math(s: &str) -> bool {
    s.trim_start().starts_with("now")
}

/// Parse an expression such as `now-1d/d`
pub fn parse(expr: &str) -> Result<DateMathExpression, DateMathError> {
    let (remaining, raw) = raw_expression(expr)
        .map_err(|_| DateMathError::MissingAnchor(expr.to_string()))?;
    if !remaining.is_empty() {
        return Err(DateMathError::TrailingInput {
            expr: expr.to_string(),
            rest: remaining.to_string(),
        });
    }

    let mut intervals = Vec::with_capacity(raw.ops.len());
    let last = raw.ops.len().saturating_sub(1);
    for (i, op) in raw.ops.iter().enumerate() {
        match (op.digits.is_empty(), op.unit) {
            // A bare sign at the end (`now-`, `now-1d+/M`) is ignored
            (true, None) if i == last => {}
            (true, _) => {
                return Err(DateMathError::InvalidAmount {
                    expr: expr.to_string(),
                    amount: format!(
                        "{}{}",
                        op.sign,
                        op.unit.map(String::from).unwrap_or_default()
                    ),
                })
            }
            (false, None) => {
                return Err(DateMathError::InvalidUnit {
                    expr: expr.to_string(),
                    unit: String::new(),
                })
            }
            (false, Some(unit)) => {
                let unit =
                    DateUnit::from_symbol(unit).ok_or_else(|| DateMathError::InvalidUnit {
                        expr: expr.to_string(),
                        unit: unit.to_string(),
                    })?;
                let signed = format!("{}{}", op.sign, op.digits);
                let amount = signed
                    .parse::<i64>()
                    .map_err(|_| DateMathError::InvalidAmount {
                        expr: expr.to_string(),
                        amount: signed.clone(),
                    })?;
                intervals.push(Interval::new(amount, unit));
            }
        }
    }

    let rounding = match raw.rounding {
        None => None,
        Some(None) => {
            return Err(DateMathError::InvalidUnit {
                expr: expr.to_string(),
                unit: String::new(),
            })
        }
        Some(Some(c)) => Some(DateUnit::from_symbol(c).ok_or_else(|| {
            DateMathError::InvalidUnit {
                expr: expr.to_string(),
                unit: c.to_string(),
            }
        })?),
    };

    Ok(DateMathExpression {
        intervals,
        rounding,
    })
}

struct RawOp<'a> {
    sign: char,
    digits: &'a str,
    unit: Option<char>,
}

struct RawExpression<'a> {
    ops: Vec<RawOp<'a>>,
    rounding: Option<Option<char>>,
}

fn raw_op(input: &str) -> IResult<&str, RawOp<'_>> {
    let (input, (sign, digits, unit)) = tuple((
        one_of("+-"),
        digit0,
        opt(satisfy(|c| c.is_ascii_alphabetic())),
    ))(input)?;
    Ok((input, RawOp { sign, digits, unit }))
}

fn raw_rounding(input: &str) -> IResult<&str, Option<char>> {
    preceded(char('/'), opt(satisfy(|c| c.is_ascii_alphabetic())))(input)
}

fn raw_expression(input: &str) -> IResult<&str, RawExpression<'_>> {
    let (input, _) = pair(multispace0, tag("now"))(input)?;
    let (input, ops) = many0(raw_op)(input)?;
    let (input, rounding) = opt(raw_rounding)(input)?;
    let (input, _) = multispace0(input)?;
    Ok((input, RawExpression { ops, rounding }))
}

/// Target dialect for [`DateMathExpression::render`]
pub trait DateMathDialect {
    /// The evaluation instant
    fn now(&self) -> String;

    /// Apply one signed interval to an inner expression
    fn shift(&self, inner: String, interval: &Interval) -> String;

    /// Truncate to the start of a unit
    fn round(&self, inner: String, unit: DateUnit) -> String;
}

/// ClickHouse date arithmetic
#[derive(Debug, Clone, Copy, Default)]
pub struct ClickHouseDateMath;

impl DateMathDialect for ClickHouseDateMath {
    fn now(&self) -> String {
        "now()".to_string()
    }

    fn shift(&self, inner: String, interval: &Interval) -> String {
        let function = if interval.amount < 0 { "subDate" } else { "addDate" };
        format!(
            "{function}({inner}, INTERVAL {} {})",
            interval.amount.unsigned_abs(),
            interval.unit.sql_name()
        )
    }

    fn round(&self, inner: String, unit: DateUnit) -> String {
        match unit {
            // now() already has second precision
            DateUnit::Second => inner,
            DateUnit::Minute => format!("toStartOfMinute({inner})"),
            DateUnit::Hour => format!("toStartOfHour({inner})"),
            DateUnit::Day => format!("toStartOfDay({inner})"),
            DateUnit::Week => format!("toStartOfWeek({inner}, 1)"),
            DateUnit::Month => format!("toStartOfMonth({inner})"),
            DateUnit::Year => format!("toStartOfYear({inner})"),
        }
    }
}

impl DateMathExpression {
    /// Render as nested calls, the first interval innermost
    pub fn render(&self, dialect: &dyn DateMathDialect) -> String {
        let shifted = self
            .intervals
            .iter()
            .fold(dialect.now(), |inner, interval| dialect.shift(inner, interval));
        match self.rounding {
            Some(unit) => dialect.round(shifted, unit),
            None => shifted,
        }
    }

    pub fn to_clickhouse(&self) -> String {
        self.render(&ClickHouseDateMath)
    }

    /// Evaluate against a concrete instant (UTC, weeks start on Monday)
    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, DateMathError> {
        let out_of_range = || DateMathError::OutOfRange(self.to_string());

        let mut instant = now;
        for interval in &self.intervals {
            instant = match interval.unit.fixed_seconds() {
                Some(unit_seconds) => {
                    let seconds = interval
                        .amount
                        .checked_mul(unit_seconds)
                        .ok_or_else(out_of_range)?;
                    let delta = Duration::try_seconds(seconds).ok_or_else(out_of_range)?;
                    instant.checked_add_signed(delta).ok_or_else(out_of_range)?
                }
                None => {
                    let months = match interval.unit {
                        DateUnit::Year => interval.amount.checked_mul(12),
                        _ => Some(interval.amount),
                    }
                    .ok_or_else(out_of_range)?;
                    let magnitude = u32::try_from(months.unsigned_abs())
                        .map_err(|_| out_of_range())?;
                    if months < 0 {
                        instant.checked_sub_months(Months::new(magnitude))
                    } else {
                        instant.checked_add_months(Months::new(magnitude))
                    }
                    .ok_or_else(out_of_range)?
                }
            };
        }

        match self.rounding {
            Some(unit) => round_down(instant, unit).ok_or_else(out_of_range),
            None => Ok(instant),
        }
    }
}

/// Truncate an instant to the start of a unit
pub fn round_down(instant: DateTime<Utc>, unit: DateUnit) -> Option<DateTime<Utc>> {
    let date = instant.date_naive();
    let midnight = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    match unit {
        DateUnit::Second => instant.with_nanosecond(0),
        DateUnit::Minute => instant.with_nanosecond(0)?.with_second(0),
        DateUnit::Hour => instant.with_nanosecond(0)?.with_second(0)?.with_minute(0),
        DateUnit::Day => midnight(date),
        DateUnit::Week => {
            let back = i64::from(date.weekday().num_days_from_monday());
            midnight(date.checked_sub_signed(Duration::try_days(back)?)?)
        }
        DateUnit::Month => midnight(NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?),
        DateUnit::Year => midnight(NaiveDate::from_ymd_opt(date.year(), 1, 1)?),
    }
}

impl fmt::Display for DateMathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("now")?;
        for interval in &self.intervals {
            let sign = if interval.amount < 0 { '-' } else { '+' };
            write!(
                f,
                "{sign}{}{}",
                interval.amount.unsigned_abs(),
                interval.unit.symbol()
            )?;
        }
        if let Some(unit) = self.rounding {
            write!(f, "/{}", unit.symbol())?;
        }
        Ok(())
    }
}
