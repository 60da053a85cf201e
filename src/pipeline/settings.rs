//! Settings normalization
//!
//! Calibration can leave numeric and boolean settings encoded as strings.
//! The compiler expects typed values, so every string leaf is coerced to an
//! integer, then a float, then a boolean, and otherwise left alone.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde_json::{Number, Value};

/// Coerce one string to its most specific JSON type
///
/// Numbers may carry surrounding whitespace and single `_` separators
/// between digits (`" 17 "`, `"1_000"`). Booleans must match exactly,
/// ignoring case.
pub fn coerce_string(s: &str) -> Value {
    if let Some(n) = numeric_literal(s).and_then(|digits| parse_number(&digits)) {
        return Value::Number(n);
    }
    if s.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(s.to_string())
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(i.into());
    }
    if let Ok(u) = s.parse::<u64>() {
        return Some(u.into());
    }
    // inf and NaN are not representable in JSON and stay strings
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

/// Trim whitespace and drop digit separators. `None` for a misplaced `_`.
fn numeric_literal(s: &str) -> Option<String> {
    let s = s.trim();
    if !s.contains('_') {
        return Some(s.to_string());
    }
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.char_indices() {
        if c == '_' {
            let before = i > 0 && bytes[i - 1].is_ascii_digit();
            let after = bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
            if !(before && after) {
                return None;
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Recursively coerce every string leaf. Object keys are never touched.
pub fn normalize_settings(value: Value) -> Value {
    match value {
        Value::String(s) => coerce_string(&s),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_settings).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_settings(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Normalize a settings file in place. The rewrite is atomic.
pub fn normalize_settings_file(path: &Path) -> std::io::Result<()> {
    let raw = fs::read(path)?;
    let value: Value = serde_json::from_slice(&raw)?;
    let normalized = normalize_settings(value);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, &normalized)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
