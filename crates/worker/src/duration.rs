//! Human-friendly duration strings: `500ms`, `30s`, `10m`, `1h`, compound
//! forms such as `1m30s` or `2h 45m`, and fractional components such as
//! `1.5s`. A bare number is read as seconds.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseDurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration `{input}`: {reason}")]
    Invalid { input: String, reason: String },

    #[error("duration `{0}` is too large")]
    Overflow(String),
}

impl ParseDurationError {
    fn invalid(input: &str, reason: impl ToString) -> Self {
        ParseDurationError::Invalid {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }

    fn from_humantime(input: &str, err: humantime::DurationError) -> Self {
        match err {
            humantime::DurationError::Empty => ParseDurationError::Empty,
            humantime::DurationError::NumberOverflow => {
                ParseDurationError::Overflow(input.to_string())
            }
            other => ParseDurationError::invalid(input, other),
        }
    }
}

pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ParseDurationError::Empty);
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ParseDurationError::Overflow(input.to_string()));
    }

    if !s.contains('.') {
        return humantime::parse_duration(s)
            .map_err(|e| ParseDurationError::from_humantime(input, e));
    }

    parse_fractional(input, s)
}

/// Sum `<decimal><unit>` components; unit names are resolved by humantime.
fn parse_fractional(input: &str, s: &str) -> Result<Duration, ParseDurationError> {
    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| ParseDurationError::invalid(input, "missing unit"))?;
        let (number, tail) = rest.split_at(number_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let value: f64 = number
            .parse()
            .map_err(|_| ParseDurationError::invalid(input, format!("bad number `{number}`")))?;
        let per_unit = humantime::parse_duration(&format!("1{}", unit.trim()))
            .map_err(|e| ParseDurationError::from_humantime(input, e))?;
        let part = Duration::try_from_secs_f64(per_unit.as_secs_f64() * value)
            .map_err(|_| ParseDurationError::Overflow(input.to_string()))?;

        total = total
            .checked_add(part)
            .ok_or_else(|| ParseDurationError::Overflow(input.to_string()))?;
        rest = next.trim_start();
    }

    Ok(total)
}
