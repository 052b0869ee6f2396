//! Logging utilities with credential protection
//!
//! Provider credentials (FRED API keys, Haver usernames and passwords) travel
//! through configuration and error context. These helpers keep them out of log
//! lines and emitted operation records.

use serde_json::Value;

/// Fragments that mark a context or parameter key as sensitive
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "key",
    "password",
    "secret",
    "token",
    "credential",
    "username",
];

/// Keys that match a fragment above but never hold secret material
const NON_SENSITIVE_KEYS: &[&str] = &["config_key", "api_key_hint"];

/// Obscures a credential string by showing only the first few characters
///
/// # Examples
///
/// ```rust
/// use fedetl::utils::logging::obscure_credential;
///
/// let credential = "abcdef0123456789abcdef0123456789";
/// assert_eq!(obscure_credential(credential), "abcde***");
/// ```
pub fn obscure_credential(credential: &str) -> String {
    let char_count = credential.chars().count();
    if char_count <= 5 {
        "*".repeat(char_count)
    } else {
        format!("{}***", truncate_string(credential, 5))
    }
}

/// First and last four characters of an API key, for authentication diagnostics
///
/// Keys too short to hint at safely are fully obscured.
pub fn api_key_hint(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() < 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Whether a key names a credential-bearing field
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    if NON_SENSITIVE_KEYS.iter().any(|k| lower.ends_with(k)) {
        return false;
    }
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

/// Masks `value` stored under `key`
///
/// Values under a sensitive key are obscured (strings) or replaced wholesale.
/// Objects and arrays are walked so nested credentials are caught too, and
/// other strings go through [`sanitize_for_logging`].
pub fn mask_value(key: &str, value: &Value) -> Value {
    if is_sensitive_key(key) {
        return match value {
            Value::String(s) => Value::String(obscure_credential(s)),
            Value::Null => Value::Null,
            _ => Value::String("***".to_string()),
        };
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask_value(k, v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| mask_value(key, v)).collect()),
        Value::String(s) => Value::String(sanitize_for_logging(s)),
        other => other.clone(),
    }
}

/// Safely truncates a string to a maximum number of characters, respecting UTF-8 boundaries
///
/// # Examples
///
/// ```rust
/// use fedetl::utils::logging::truncate_string;
///
/// assert_eq!(truncate_string("FEDFUNDS", 3), "FED");
/// assert_eq!(truncate_string("Short", 100), "Short");
/// ```
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Obscures the values of credential-like `name=value` pairs in free-form
/// text such as request URLs (`?api_key=...`) or connection strings
pub fn sanitize_for_logging(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(eq) = rest.find('=') {
        let (head, tail) = rest.split_at(eq + 1);
        result.push_str(head);
        let name = head[..eq]
            .rsplit(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .next()
            .unwrap_or("");
        if name.is_empty() || !is_sensitive_key(name) {
            rest = tail;
            continue;
        }
        let value_end = tail
            .find(|c: char| matches!(c, '&' | ')' | '"' | '\'' | ',' | ';') || c.is_whitespace())
            .unwrap_or(tail.len());
        result.push_str(&obscure_credential(&tail[..value_end]));
        rest = &tail[value_end..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obscure_credential() {
        assert_eq!(obscure_credential("abcdef0123456789abcdef0123456789"), "abcde***");
        assert_eq!(obscure_credential("short"), "*****");
        assert_eq!(obscure_credential(""), "");
        assert_eq!(obscure_credential("a"), "*");
    }

    #[test]
    fn test_api_key_hint() {
        assert_eq!(api_key_hint("abcd0123456789abcdef0123456789wxyz"), "abcd...wxyz");
        assert_eq!(api_key_hint("tiny"), "****");
    }

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("fred.api_key"));
        assert!(is_sensitive_key("HAVER_PASSWORD"));
        assert!(is_sensitive_key("username"));
        assert!(!is_sensitive_key("api_key_hint"));
        assert!(!is_sensitive_key("config_key"));
        assert!(!is_sensitive_key("series_id"));
        assert!(!is_sensitive_key("start_date"));
    }

    #[test]
    fn test_mask_value() {
        assert_eq!(
            mask_value("password", &Value::from("hunter22")),
            Value::from("hunte***")
        );
        assert_eq!(mask_value("token", &Value::from(42)), Value::from("***"));
        assert_eq!(mask_value("series_id", &Value::from("GDP")), Value::from("GDP"));
    }

    #[test]
    fn test_mask_value_walks_nested_values() {
        let value = serde_json::json!({
            "series_id": "GDP",
            "auth": { "api_key": "abcdef0123456789abcdef0123456789", "user": "analyst" },
            "logins": [{ "password": "hunter22" }],
        });
        let masked = mask_value("request", &value);
        assert_eq!(masked["series_id"], "GDP");
        assert_eq!(masked["auth"]["api_key"], "abcde***");
        assert_eq!(masked["auth"]["user"], "analyst");
        assert_eq!(masked["logins"][0]["password"], "hunte***");
        assert!(!masked.to_string().contains("hunter22"));
    }

    #[test]
    fn test_sanitize_for_logging() {
        let input = "GET https://api.stlouisfed.org/fred/series?api_key=abcdef0123456789&series_id=GDP";
        let sanitized = sanitize_for_logging(input);
        assert!(sanitized.contains("api_key=abcde***&series_id=GDP"));
        assert!(!sanitized.contains("abcdef0123456789"));

        let wrapped = "error sending request for url (https://api.haver.com/v1?username=analyst&password=hunter22)";
        let sanitized = sanitize_for_logging(wrapped);
        assert!(sanitized.ends_with("username=analy***&password=hunte***)"));

        let plain = "a=b c==d config_key=fred.api_key";
        assert_eq!(sanitize_for_logging(plain), plain);
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello World", 5), "Hello");
        assert_eq!(truncate_string("日本語テキスト", 3), "日本語");
        assert_eq!(truncate_string("", 10), "");
    }
}
