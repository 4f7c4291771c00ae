//! Canonical scalar encodings
//!
//! Every decode path reduces a cell to a [`Scalar`] and hands it to
//! [`canonicalize`] together with the declared column type. The per-type
//! rules live here once, so the document and columnar paths cannot drift.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

use crate::schema::FieldType;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    #[error("invalid {field_type} value: {text:?}")]
    Invalid { field_type: FieldType, text: String },

    #[error("{field_type} value out of range: {value}")]
    OutOfRange { field_type: FieldType, value: i64 },

    #[error("cannot decode {found} as {field_type}")]
    Mismatch {
        field_type: FieldType,
        found: &'static str,
    },

    #[error("{0} values are not supported")]
    Unsupported(FieldType),
}

/// Typed intermediate produced by a decoder before canonicalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar<'a> {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Text as it appears on the document wire.
    Text(&'a str),
    Bytes(&'a [u8]),
    /// Plain decimal text, possibly with trailing fractional zeros.
    Decimal(&'a str),
    /// Days since the unix epoch.
    DateDays(i32),
    /// Microseconds since midnight.
    TimeMicros(i64),
    /// Wall-clock microseconds since the unix epoch, no zone.
    DateTimeMicros(i64),
    /// Microseconds since the unix epoch, UTC.
    TimestampMicros(i64),
}

impl Scalar<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "integer",
            Scalar::Float(_) => "float",
            Scalar::Text(_) => "text",
            Scalar::Bytes(_) => "bytes",
            Scalar::Decimal(_) => "decimal",
            Scalar::DateDays(_) => "date",
            Scalar::TimeMicros(_) => "time",
            Scalar::DateTimeMicros(_) => "datetime",
            Scalar::TimestampMicros(_) => "timestamp",
        }
    }
}

/// Convert `scalar` into the canonical [`Value`] for a column of `field_type`.
pub fn canonicalize(field_type: FieldType, scalar: Scalar<'_>) -> Result<Value, CanonicalError> {
    let invalid = |text: &str| CanonicalError::Invalid {
        field_type,
        text: text.to_string(),
    };
    let out_of_range = |value: i64| CanonicalError::OutOfRange { field_type, value };

    let value = match (field_type, scalar) {
        (FieldType::Range | FieldType::Interval, _) => {
            return Err(CanonicalError::Unsupported(field_type))
        }

        (FieldType::Boolean, Scalar::Bool(b)) => Value::Bool(b),
        (FieldType::Boolean, Scalar::Text(s)) => Value::Bool(parse_bool(s).ok_or_else(|| invalid(s))?),

        (FieldType::Integer, Scalar::Int(i)) => Value::Int64(i),
        (FieldType::Integer, Scalar::Text(s)) => Value::Int64(s.parse().map_err(|_| invalid(s))?),

        (FieldType::Float, Scalar::Float(f)) => Value::Float64(f),
        (FieldType::Float, Scalar::Text(s)) => Value::Float64(s.parse().map_err(|_| invalid(s))?),

        (FieldType::String, Scalar::Text(s)) => Value::String(s.to_string()),
        (FieldType::Json, Scalar::Text(s)) => Value::Json(s.to_string()),
        (FieldType::Geography, Scalar::Text(s)) => Value::Geography(s.to_string()),

        (FieldType::Bytes, Scalar::Bytes(b)) => Value::Bytes(STANDARD.encode(b)),
        (FieldType::Bytes, Scalar::Text(s)) => {
            let raw = STANDARD.decode(s).map_err(|_| invalid(s))?;
            Value::Bytes(STANDARD.encode(raw))
        }

        (FieldType::Numeric, Scalar::Decimal(s) | Scalar::Text(s)) => {
            Value::Numeric(canonical_decimal(s).ok_or_else(|| invalid(s))?)
        }
        (FieldType::BigNumeric, Scalar::Decimal(s) | Scalar::Text(s)) => {
            Value::BigNumeric(canonical_decimal(s).ok_or_else(|| invalid(s))?)
        }

        (FieldType::Date, Scalar::DateDays(days)) => {
            let date = date_from_days(days).ok_or_else(|| out_of_range(days.into()))?;
            Value::Date(format_date(date))
        }
        (FieldType::Date, Scalar::Text(s)) => {
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| invalid(s))?;
            Value::Date(format_date(date))
        }

        (FieldType::Time, Scalar::TimeMicros(micros)) => {
            let time = time_from_micros(micros).ok_or_else(|| out_of_range(micros))?;
            Value::Time(format_time(time))
        }
        (FieldType::Time, Scalar::Text(s)) => {
            let time = NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|_| invalid(s))?;
            Value::Time(format_time(time))
        }

        (FieldType::DateTime, Scalar::DateTimeMicros(micros)) => {
            let dt = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| out_of_range(micros))?
                .naive_utc();
            Value::DateTime(format_datetime(dt))
        }
        (FieldType::DateTime, Scalar::Text(s)) => {
            let dt = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map_err(|_| invalid(s))?;
            Value::DateTime(format_datetime(dt))
        }

        (FieldType::Timestamp, Scalar::TimestampMicros(micros)) => {
            Value::Timestamp(format_timestamp_micros(micros).ok_or_else(|| out_of_range(micros))?)
        }
        (FieldType::Timestamp, Scalar::Text(s)) => {
            let micros = parse_epoch_seconds(s)
                .or_else(|| {
                    DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|t| t.timestamp_micros())
                })
                .ok_or_else(|| invalid(s))?;
            Value::Timestamp(format_timestamp_micros(micros).ok_or_else(|| out_of_range(micros))?)
        }

        (field_type, scalar) => {
            return Err(CanonicalError::Mismatch {
                field_type,
                found: scalar.kind(),
            })
        }
    };
    Ok(value)
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "true" | "TRUE" | "True" | "t" | "T" | "1" => Some(true),
        "false" | "FALSE" | "False" | "f" | "F" | "0" => Some(false),
        _ => None,
    }
}

/// Plain decimal with trailing fractional zeros and a dangling point removed.
pub fn canonical_decimal(text: &str) -> Option<String> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let int_part = match int_part.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };
    let frac_part = frac_part.trim_end_matches('0');
    let is_zero = int_part == "0" && frac_part.is_empty();

    let mut out = String::with_capacity(text.len());
    if negative && !is_zero {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    Some(out)
}

/// Parse the legacy float-seconds timestamp form (`1.458486245E9`) exactly,
/// truncating below microsecond precision.
pub fn parse_epoch_seconds(text: &str) -> Option<i64> {
    let (mantissa, exponent) = match text.find(['e', 'E']) {
        Some(i) => (&text[..i], text[i + 1..].parse::<i32>().ok()?),
        None => (text, 0),
    };
    let (negative, digits) = match mantissa.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, mantissa.strip_prefix('+').unwrap_or(mantissa)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    // number of leading digits that make up the integral microsecond count
    let keep = int_part.len() as i64 + i64::from(exponent) + 6;
    if keep > 40 {
        return None;
    }

    let mut micros: i128 = 0;
    let mut taken = 0i64;
    for b in int_part.bytes().chain(frac_part.bytes()) {
        if taken >= keep {
            break;
        }
        micros = micros * 10 + i128::from(b - b'0');
        taken += 1;
    }
    while taken < keep {
        micros *= 10;
        taken += 1;
    }
    if negative {
        micros = -micros;
    }
    i64::try_from(micros).ok()
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    DateTime::from_timestamp(i64::from(days) * 86_400, 0).map(|t| t.date_naive())
}

fn time_from_micros(micros: i64) -> Option<NaiveTime> {
    if !(0..86_400_000_000).contains(&micros) {
        return None;
    }
    let secs = u32::try_from(micros / 1_000_000).ok()?;
    let nanos = u32::try_from(micros % 1_000_000).ok()? * 1_000;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

fn fraction(nanos: u32) -> String {
    match nanos / 1_000 {
        0 => String::new(),
        micros => format!(".{:06}", micros),
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn format_time(time: NaiveTime) -> String {
    format!("{}{}", time.format("%H:%M:%S"), fraction(time.nanosecond()))
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    format!("{}T{}", format_date(dt.date()), format_time(dt.time()))
}

pub fn format_timestamp_micros(micros: i64) -> Option<String> {
    DateTime::from_timestamp_micros(micros).map(|t| format!("{}Z", format_datetime(t.naive_utc())))
}
