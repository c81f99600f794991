use std::{str::FromStr, time::Duration};

/// A user-supplied timeout setting.
///
/// Settings are written as Go-style durations (`1h2m3s`, `250ms`, `1.5s`). The
/// empty string selects the proxy's default and `infinity` disables the
/// timeout altogether.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Default,
    Disabled,
    Value(Duration),
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid number: {0}")]
    NotANumber(String),

    #[error("negative durations are not permitted")]
    Negative,

    #[error("duration is too large")]
    Overflow,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

// === impl Timeout ===

impl Timeout {
    /// Parses an optional setting; an absent value selects the default.
    pub fn parse_opt(value: Option<&str>) -> Result<Self, ParseError> {
        value.map(str::parse).unwrap_or(Ok(Self::Default))
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

impl FromStr for Timeout {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(Self::Default),
            "infinity" | "infinite" => Ok(Self::Disabled),
            s => parse_duration(s).map(Self::Value),
        }
    }
}

/// Parses a Go-formatted duration into a non-negative `Duration`.
pub fn parse_duration(s: &str) -> Result<Duration, ParseError> {
    let s = match s.strip_prefix('-') {
        Some("0") => return Ok(Duration::ZERO),
        Some(_) => return Err(ParseError::Negative),
        None => s.strip_prefix('+').unwrap_or(s),
    };

    // Go permits a bare zero without a unit.
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(ParseError::NotANumber(rest.to_string()));
        }
        let (num, tail) = rest.split_at(num_len);
        let (whole, frac) = num.split_once('.').unwrap_or((num, ""));
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(ParseError::NotANumber(num.to_string()));
        }

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let unit_nanos: u128 = match unit {
            "" => return Err(ParseError::NoUnit),
            "ns" => 1,
            "us" | "\u{00b5}s" | "\u{03bc}s" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(ParseError::InvalidUnit),
        };

        let parse = |digits: &str| -> Result<u128, ParseError> {
            if digits.is_empty() {
                return Ok(0);
            }
            digits
                .parse::<u128>()
                .map_err(|_| ParseError::NotANumber(num.to_string()))
        };
        let mut nanos = parse(whole)?
            .checked_mul(unit_nanos)
            .ok_or(ParseError::Overflow)?;
        if !frac.is_empty() {
            // Digits beyond nanosecond precision are dropped.
            let frac = &frac[..frac.len().min(18)];
            let frac_nanos = parse(frac)?
                .checked_mul(unit_nanos)
                .ok_or(ParseError::Overflow)?
                / 10u128.pow(frac.len() as u32);
            nanos = nanos.checked_add(frac_nanos).ok_or(ParseError::Overflow)?;
        }
        total = total.checked_add(nanos).ok_or(ParseError::Overflow)?;
        rest = tail;
    }

    let secs = u64::try_from(total / 1_000_000_000).map_err(|_| ParseError::Overflow)?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}
