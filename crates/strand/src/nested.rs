//! Nested lookup helpers for dynamic JSON objects.
//!
//! Custom resources and runner events are handled as untyped
//! `serde_json::Value` maps because their schemas evolve outside this
//! repository. These helpers keep the access sites short and total.

use serde_json::Value;

/// Walk a path of object keys, returning the value at the end.
pub fn get_nested<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Nested lookup returning a string slice.
pub fn get_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    get_nested(value, path).and_then(Value::as_str)
}

/// Nested lookup returning an owned, non-empty string.
pub fn get_string(value: &Value, path: &[&str]) -> Option<String> {
    get_str(value, path)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Nested lookup returning an integer.
pub fn get_i64(value: &Value, path: &[&str]) -> Option<i64> {
    get_nested(value, path).and_then(Value::as_i64)
}

/// Nested lookup returning a float.
pub fn get_f64(value: &Value, path: &[&str]) -> Option<f64> {
    get_nested(value, path).and_then(Value::as_f64)
}

/// Nested lookup returning a boolean.
pub fn get_bool(value: &Value, path: &[&str]) -> Option<bool> {
    get_nested(value, path).and_then(Value::as_bool)
}

/// Nested lookup returning an array slice.
pub fn get_array<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Vec<Value>> {
    get_nested(value, path).and_then(Value::as_array)
}

/// Set a value at a nested path, creating intermediate objects as needed.
///
/// Does nothing if an intermediate step exists but is not an object.
pub fn set_nested(value: &mut Value, path: &[&str], new_value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for key in parents {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.to_string(), new_value);
    }
}

/// Read a field accepting both camelCase and snake_case spellings.
pub fn get_either<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    map.get(camel).or_else(|| map.get(snake))
}

/// String variant of [`get_either`], filtering empty strings.
pub fn get_either_str<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a str> {
    get_either(value, camel, snake)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_nested_walks_objects() {
        let v = json!({"spec": {"gitConfig": {"user": {"name": "dev"}}}});
        assert_eq!(
            get_str(&v, &["spec", "gitConfig", "user", "name"]),
            Some("dev")
        );
        assert_eq!(get_str(&v, &["spec", "missing", "name"]), None);
    }

    #[test]
    fn get_nested_stops_at_non_objects() {
        let v = json!({"spec": {"prompt": "hello"}});
        assert_eq!(get_nested(&v, &["spec", "prompt", "deeper"]), None);
    }

    #[test]
    fn get_string_filters_empty() {
        let v = json!({"runId": ""});
        assert_eq!(get_string(&v, &["runId"]), None);
    }

    #[test]
    fn set_nested_creates_intermediates() {
        let mut v = json!({});
        set_nested(&mut v, &["status", "phase"], json!("Running"));
        assert_eq!(get_str(&v, &["status", "phase"]), Some("Running"));
    }

    #[test]
    fn set_nested_preserves_siblings() {
        let mut v = json!({"status": {"phase": "Pending", "startTime": "t"}});
        set_nested(&mut v, &["status", "phase"], json!("Running"));
        assert_eq!(get_str(&v, &["status", "startTime"]), Some("t"));
        assert_eq!(get_str(&v, &["status", "phase"]), Some("Running"));
    }

    #[test]
    fn either_prefers_camel() {
        let v = json!({"toolCallId": "a", "tool_call_id": "b"});
        assert_eq!(get_either_str(&v, "toolCallId", "tool_call_id"), Some("a"));
        let v = json!({"tool_call_id": "b"});
        assert_eq!(get_either_str(&v, "toolCallId", "tool_call_id"), Some("b"));
    }
}
