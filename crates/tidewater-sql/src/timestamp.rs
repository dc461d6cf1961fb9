//! Event-time resolution
//!
//! Every output record carries an event time. By default it is the input
//! record's event time. A query (or the source stream) may instead name a field
//! holding the time, either as epoch milliseconds or as text plus a pattern; the
//! text is parsed in one step. A value that cannot be parsed is an error for
//! that record, never a silent fallback to arrival time.
//!
//! Patterns use Java-style letters (`yyyy-MM-dd'T'HH:mm:ssX`) or, when they
//! contain a `%`, chrono's strftime syntax. Times without an offset are UTC.

use crate::error::SqlError;
use crate::path::FieldPath;
use crate::Result;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tidewater_core::Value;

/// Field (and optional pattern) holding an event time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampSpec {
    pub field: FieldPath,

    /// Pattern of a text field; `None` means the field holds epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl TimestampSpec {
    pub fn new(field: FieldPath, format: Option<String>) -> Self {
        Self { field, format }
    }

    /// Event time of a decoded record
    pub fn resolve(&self, value: &Value) -> Result<i64> {
        let node = self.field.resolve(value);
        match (&self.format, node) {
            (Some(pattern), Value::Text(text)) => parse_timestamp(text, pattern),
            (None, Value::Int(millis)) => Ok(*millis),
            (pattern, other) => Err(SqlError::TimestampParseError {
                value: other.to_string(),
                pattern: pattern.clone().unwrap_or_else(|| "epoch millis".to_string()),
            }),
        }
    }
}

/// Where an output record's event time comes from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TimestampResolver {
    /// Keep the input record's event time
    #[default]
    Inherit,
    /// Read it from a field of the decoded input record
    Field(TimestampSpec),
    /// Read it from a column of the projected output record
    Output(TimestampSpec),
}

impl TimestampResolver {
    pub fn resolve(&self, source: &Value, projected: &Value, input_timestamp: i64) -> Result<i64> {
        match self {
            TimestampResolver::Inherit => Ok(input_timestamp),
            TimestampResolver::Field(spec) => spec.resolve(source),
            TimestampResolver::Output(spec) => spec.resolve(projected),
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

struct ChronoPattern {
    format: String,
    has_offset: bool,
}

fn push_run(out: &mut ChronoPattern, letter: char, count: usize, for_parse: bool) -> Result<()> {
    let spec = match (letter, count) {
        ('y', 2) => "%y",
        ('y', _) | ('u', _) => "%Y",
        ('M', 1) if !for_parse => "%-m",
        ('M', 1 | 2) => "%m",
        ('M', 3) => "%b",
        ('M', _) => "%B",
        ('d', 1) if !for_parse => "%-d",
        ('d', _) => "%d",
        ('D', _) => "%j",
        ('H', 1) if !for_parse => "%-H",
        ('H', _) => "%H",
        ('h', _) => "%I",
        ('m', _) => "%M",
        ('s', _) => "%S",
        ('S', 1..=3) => "%3f",
        ('S', 4..=6) => "%6f",
        ('S', _) => "%9f",
        ('a', _) => "%p",
        ('E', 1..=3) => "%a",
        ('E', _) => "%A",
        ('X' | 'x' | 'Z', _) => {
            out.has_offset = true;
            if for_parse {
                "%#z"
            } else if letter == 'X' {
                // Formatting is always in UTC
                "Z"
            } else {
                "%z"
            }
        }
        _ => {
            return Err(SqlError::EvaluationError(format!(
                "unsupported pattern letter '{letter}'"
            )))
        }
    };
    out.format.push_str(spec);
    Ok(())
}

fn translate(pattern: &str, for_parse: bool) -> Result<ChronoPattern> {
    if pattern.contains('%') {
        return Ok(ChronoPattern {
            format: pattern.to_string(),
            has_offset: pattern.contains("%z") || pattern.contains(":z") || pattern.contains("#z"),
        });
    }

    let mut out = ChronoPattern {
        format: String::with_capacity(pattern.len() * 2),
        has_offset: false,
    };
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // quoted literal; '' is an escaped quote
            i += 1;
            if chars.get(i) == Some(&'\'') {
                out.format.push('\'');
                i += 1;
                continue;
            }
            while i < chars.len() {
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        out.format.push('\'');
                        i += 2;
                        continue;
                    }
                    break;
                }
                out.format.push(chars[i]);
                i += 1;
            }
            i += 1;
        } else if c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i] == c {
                i += 1;
            }
            push_run(&mut out, c, i - start, for_parse)?;
        } else {
            out.format.push(c);
            i += 1;
        }
    }
    Ok(out)
}

/// Parse `text` with `pattern` into epoch milliseconds
pub fn parse_timestamp(text: &str, pattern: &str) -> Result<i64> {
    let parse_error = || SqlError::TimestampParseError {
        value: text.to_string(),
        pattern: pattern.to_string(),
    };

    let chrono_pattern = translate(pattern, true).map_err(|_| parse_error())?;
    let input = text.trim();

    if chrono_pattern.has_offset {
        let normalized = match input.strip_suffix(['Z', 'z']) {
            Some(rest) => format!("{rest}+00:00"),
            None => input.to_string(),
        };
        return DateTime::parse_from_str(&normalized, &chrono_pattern.format)
            .map(|dt| dt.timestamp_millis())
            .map_err(|_| parse_error());
    }

    NaiveDateTime::parse_from_str(input, &chrono_pattern.format)
        .or_else(|_| {
            NaiveDate::parse_from_str(input, &chrono_pattern.format)
                .map(|date| date.and_time(chrono::NaiveTime::MIN))
        })
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis())
        .map_err(|_| parse_error())
}

/// Render epoch milliseconds with `pattern`, in UTC
pub fn format_timestamp(millis: i64, pattern: &str) -> Result<String> {
    let chrono_pattern = translate(pattern, false)?;
    let items: Vec<Item<'_>> = StrftimeItems::new(&chrono_pattern.format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(SqlError::EvaluationError(format!(
            "invalid timestamp pattern '{pattern}'"
        )));
    }

    let datetime = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        SqlError::EvaluationError(format!("timestamp {millis} is out of range"))
    })?;

    let mut rendered = String::new();
    write!(rendered, "{}", datetime.format_with_items(items.into_iter())).map_err(|_| {
        SqlError::EvaluationError(format!("cannot render timestamp with '{pattern}'"))
    })?;
    Ok(rendered)
}
