//! Defensive conversion of untyped upstream values. The platform freely
//! swaps numbers for numeric strings (and back) between deployments, so no
//! field is trusted to hold the type it held yesterday.

use serde_json::Value;

/// Best-effort numeric read: numbers pass through, numeric strings are
/// parsed (thousands separators stripped), everything else is 0.
pub fn lossy_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let cleaned = s.trim().replace(',', "");
            cleaned.parse::<f64>().unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

pub fn field_f64(obj: &Value, key: &str) -> f64 {
    obj.get(key).map(lossy_f64).unwrap_or(0.0)
}

/// Positive numeric field, or `None` when absent, non-numeric, or <= 0.
pub fn field_positive_f64(obj: &Value, key: &str) -> Option<f64> {
    let n = field_f64(obj, key);
    (n > 0.0).then_some(n)
}

pub fn lossy_u32(value: &Value) -> u32 {
    let n = lossy_f64(value);
    if n.is_finite() && n > 0.0 {
        n.round().min(u32::MAX as f64) as u32
    } else {
        0
    }
}

pub fn field_u32(obj: &Value, key: &str) -> u32 {
    obj.get(key).map(lossy_u32).unwrap_or(0)
}

/// Stringify scalars; objects/arrays/null become the empty string.
pub fn lossy_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

pub fn field_string(obj: &Value, key: &str) -> String {
    obj.get(key).map(lossy_string).unwrap_or_default()
}

pub fn field_non_empty(obj: &Value, key: &str) -> Option<String> {
    let s = field_string(obj, key);
    (!s.is_empty()).then_some(s)
}

/// String field with a default when missing or blank.
pub fn field_or(obj: &Value, key: &str, default: &str) -> String {
    field_non_empty(obj, key).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_and_numeric_strings_coerce() {
        assert_eq!(lossy_f64(&json!(12.5)), 12.5);
        assert_eq!(lossy_f64(&json!("500")), 500.0);
        assert_eq!(lossy_f64(&json!(" 1,234.5 ")), 1234.5);
    }

    #[test]
    fn garbage_coerces_to_zero() {
        assert_eq!(lossy_f64(&json!("n/a")), 0.0);
        assert_eq!(lossy_f64(&json!(null)), 0.0);
        assert_eq!(lossy_f64(&json!({"nested": true})), 0.0);
    }

    #[test]
    fn count_field_rounds_and_floors_at_zero() {
        assert_eq!(lossy_u32(&json!("3")), 3);
        assert_eq!(lossy_u32(&json!(2.6)), 3);
        assert_eq!(lossy_u32(&json!(-1)), 0);
    }

    #[test]
    fn string_fields_trim_and_default() {
        let obj = json!({"carrier": "  DHL ", "empty": "   "});
        assert_eq!(field_string(&obj, "carrier"), "DHL");
        assert_eq!(field_non_empty(&obj, "empty"), None);
        assert_eq!(field_or(&obj, "missing", "Unknown"), "Unknown");
    }

    #[test]
    fn positive_field_rejects_zero_and_negative() {
        let obj = json!({"rate": 0.0, "neg": -2, "ok": "7.2"});
        assert_eq!(field_positive_f64(&obj, "rate"), None);
        assert_eq!(field_positive_f64(&obj, "neg"), None);
        assert_eq!(field_positive_f64(&obj, "ok"), Some(7.2));
    }
}
