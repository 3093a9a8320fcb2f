//! Column type tags and typed value decoding.
//!
//! Decoding is decoupled from both the wire format and the column type
//! system: a driver only supplies `(tag, bytes)` pairs and this module
//! turns them into typed values. Timestamps are the one tolerant path —
//! an unparsable timestamp degrades to the raw text with a diagnostic
//! instead of an error.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use bytes::Bytes;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone};

use crate::error::{Error, Result};

// ============================================================================
// Type tags
// ============================================================================

/// Driver-reported column type, selecting the decode rule for raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Boolean,
    Integer,
    Float,
    Numeric,
    Text,
    Blob,
    Timestamp,
}

// ============================================================================
// Values
// ============================================================================

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Exact decimal text parsed into an arbitrary-precision decimal;
    /// never a binary float.
    Numeric(BigDecimal),
    Text(String),
    Blob(Bytes),
    Timestamp(DateTime<FixedOffset>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            Value::Timestamp(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_numeric(&self) -> Option<&BigDecimal> {
        match self {
            Value::Numeric(n) => Some(n),
            _ => None,
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode raw column bytes under the given tag.
///
/// `server_tzoffset` is the session timezone in seconds east of UTC; it
/// applies only to timestamps without an explicit zone suffix.
pub fn decode(tag: TypeTag, raw: &[u8], server_tzoffset: i32) -> Result<Value> {
    match tag {
        TypeTag::Boolean => Ok(Value::Boolean(raw == b"t" || raw == b"1")),

        TypeTag::Integer => {
            let text = as_utf8(raw)?;
            text.parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| Error::general("decode", format!("invalid integer {text:?}: {e}")))
        }

        TypeTag::Float => {
            let text = as_utf8(raw)?;
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|e| Error::general("decode", format!("invalid float {text:?}: {e}")))
        }

        TypeTag::Numeric => {
            let text = as_utf8(raw)?;
            BigDecimal::from_str(text)
                .map(Value::Numeric)
                .map_err(|e| Error::general("decode", format!("invalid numeric {text:?}: {e}")))
        }

        TypeTag::Text => Ok(Value::Text(as_utf8(raw)?.to_string())),

        TypeTag::Blob => Ok(Value::Blob(Bytes::copy_from_slice(raw))),

        TypeTag::Timestamp => {
            match std::str::from_utf8(raw)
                .ok()
                .and_then(|text| parse_timestamp(text, server_tzoffset))
            {
                Some(ts) => Ok(Value::Timestamp(ts)),
                // Tolerant fallback: hand the raw text back unmodified.
                None => {
                    let text = String::from_utf8_lossy(raw).into_owned();
                    tracing::warn!(raw = %text, "typecast failed to parse date");
                    Ok(Value::Text(text))
                }
            }
        }
    }
}

fn as_utf8(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw)
        .map_err(|e| Error::general("decode", format!("invalid UTF-8 in column data: {e}")))
}

/// Strict `YYYY-MM-DD HH:MM:SS[.ffffff][±HH:MM]` parser.
///
/// Without a zone suffix the value is in the server timezone; an explicit
/// suffix overrides it. Fractional digits are decimal seconds. Anything
/// that does not match exactly is `None` (the caller falls back to text).
fn parse_timestamp(text: &str, server_tzoffset: i32) -> Option<DateTime<FixedOffset>> {
    if text.len() < 19 || !text.is_ascii() {
        return None;
    }
    let (head, mut rest) = text.split_at(19);
    let naive = NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S").ok()?;

    let mut nanos: i64 = 0;
    if let Some(frac) = rest.strip_prefix('.') {
        let end = frac
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(frac.len());
        if end == 0 {
            return None;
        }
        let digits = &frac[..end.min(9)];
        nanos = digits.parse::<i64>().ok()? * 10_i64.pow(9 - digits.len() as u32);
        rest = &frac[end..];
    }

    let offset_secs = if rest.is_empty() {
        server_tzoffset
    } else {
        let sign = match rest.as_bytes()[0] {
            b'+' => 1,
            b'-' => -1,
            _ => return None,
        };
        let body = &rest[1..];
        if body.len() != 5 || body.as_bytes()[2] != b':' {
            return None;
        }
        let hours: i32 = body[..2].parse().ok()?;
        let minutes: i32 = body[3..5].parse().ok()?;
        sign * (hours * 3600 + minutes * 60)
    };

    let zone = FixedOffset::east_opt(offset_secs)?;
    let stamped = zone.from_local_datetime(&naive).single()?;
    Some(stamped + Duration::nanoseconds(nanos))
}
