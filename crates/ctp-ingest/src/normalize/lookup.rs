//! Optional-path accessors over nested JSON
//!
//! Every accessor returns `None` when any step of the path is missing, is not
//! an object, or holds `null`. None of them panic.

use serde_json::Value;

/// Follow `path` through nested objects
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    (!current.is_null()).then_some(current)
}

/// String at `path`; numbers and booleans are rendered as text
pub fn lookup_str(value: &Value, path: &[&str]) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Non-empty string at `path`
pub fn lookup_name(value: &Value, path: &[&str]) -> Option<String> {
    lookup_str(value, path).filter(|s| !s.trim().is_empty())
}

pub fn lookup_bool(value: &Value, path: &[&str]) -> Option<bool> {
    match lookup(value, path)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "True" | "TRUE" => Some(true),
            "false" | "False" | "FALSE" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn lookup_i64(value: &Value, path: &[&str]) -> Option<i64> {
    match lookup(value, path)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn lookup_f64(value: &Value, path: &[&str]) -> Option<f64> {
    match lookup(value, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Array at `path`, empty when absent or not an array
pub fn lookup_array<'a>(value: &'a Value, path: &[&str]) -> &'a [Value] {
    lookup(value, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Whole years from an age such as `"18 Years"`.
///
/// Absent values, `N/A` and values without a leading integer token yield
/// `None`.
pub fn parse_age_years(value: Option<&Value>) -> Option<i32> {
    match value? {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => {
            let token = s.split_whitespace().next()?;
            if token.eq_ignore_ascii_case("N/A") {
                return None;
            }
            token.parse().ok()
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_path() {
        let v = json!({"a": {"b": {"c": "deep"}}});
        assert_eq!(lookup_str(&v, &["a", "b", "c"]).as_deref(), Some("deep"));
    }

    #[test]
    fn test_lookup_never_panics_on_bad_intermediates() {
        let v = json!({"a": "scalar", "b": [1, 2], "c": null});
        assert!(lookup(&v, &["a", "x"]).is_none());
        assert!(lookup(&v, &["b", "0"]).is_none());
        assert!(lookup(&v, &["c"]).is_none());
        assert!(lookup(&v, &["c", "x"]).is_none());
        assert!(lookup(&v, &["missing", "x", "y"]).is_none());
        assert!(lookup(&json!(null), &["a"]).is_none());
    }

    #[test]
    fn test_typed_lookups() {
        let v = json!({
            "count": 120,
            "countText": "45",
            "flag": true,
            "flagText": "false",
            "lat": 44.02,
            "name": "   ",
        });
        assert_eq!(lookup_i64(&v, &["count"]), Some(120));
        assert_eq!(lookup_i64(&v, &["countText"]), Some(45));
        assert_eq!(lookup_str(&v, &["count"]).as_deref(), Some("120"));
        assert_eq!(lookup_bool(&v, &["flag"]), Some(true));
        assert_eq!(lookup_bool(&v, &["flagText"]), Some(false));
        assert_eq!(lookup_bool(&v, &["count"]), None);
        assert_eq!(lookup_f64(&v, &["lat"]), Some(44.02));
        assert_eq!(lookup_name(&v, &["name"]), None);
    }

    #[test]
    fn test_lookup_array_defaults_to_empty() {
        let v = json!({"list": ["a", "b"], "scalar": "x"});
        assert_eq!(lookup_array(&v, &["list"]).len(), 2);
        assert!(lookup_array(&v, &["scalar"]).is_empty());
        assert!(lookup_array(&v, &["missing"]).is_empty());
    }

    #[test]
    fn test_parse_age_years() {
        assert_eq!(parse_age_years(Some(&json!("18 Years"))), Some(18));
        assert_eq!(parse_age_years(Some(&json!("6 Months"))), Some(6));
        assert_eq!(parse_age_years(Some(&json!(65))), Some(65));
        assert_eq!(parse_age_years(Some(&json!("N/A"))), None);
        assert_eq!(parse_age_years(Some(&json!("Adult"))), None);
        assert_eq!(parse_age_years(Some(&json!("18.5 Years"))), None);
        assert_eq!(parse_age_years(Some(&json!(""))), None);
        assert_eq!(parse_age_years(None), None);
    }
}
