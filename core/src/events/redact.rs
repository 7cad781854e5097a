//! Content-based secret masking.
//!
//! Payloads reaching the log are frequently opaque: form bodies copied
//! into a string, JSON serialized inside JSON, upstream echoes. Masking
//! therefore works on field names and on text patterns, never on Rust
//! types. Two passes run over every record:
//!
//! 1. **Key pass**: any object key that looks like a password, signature
//!    or username has its value replaced, at any depth.
//! 2. **Text pass**: every remaining string is scanned for `PWD=...`-style
//!    form fragments and `"password": "..."`-style JSON fragments.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::config::REDACTION_MARKER;

use super::record::LogRecord;

fn form_fragment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(PWD|PASSWORD|PASSWD|PASS|SIGNATURE|USERNAME|USER)=([^&\s"\\]+)"#)
            .expect("form fragment pattern is valid")
    })
}

fn json_fragment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)("(?:password|passwd|pwd|signature|username|user)"\s*:\s*")((?:[^"\\]|\\.)*)(")"#)
            .expect("json fragment pattern is valid")
    })
}

/// Whether a field name is password-, signature- or username-shaped.
pub fn is_secret_key(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(lower.as_str(), "pwd" | "pass" | "passwd" | "user")
        || lower.contains("password")
        || lower.contains("signature")
        || lower.contains("username")
}

/// Masks secrets in log records. Stateless; cheap to share.
#[derive(Debug, Default, Clone, Copy)]
pub struct Redactor;

impl Redactor {
    pub fn new() -> Self {
        Self
    }

    /// Redact the event-specific fields of a record in place. The envelope
    /// (`id`, `ts`, `source`, `type`) is left alone.
    pub fn redact_record(&self, record: &mut LogRecord) {
        for (name, value) in record.fields.iter_mut() {
            if is_secret_key(name) {
                mask(value);
            } else {
                self.redact_value(value);
            }
        }
    }

    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                if let Cow::Owned(masked) = self.redact_str(s) {
                    *s = masked;
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.redact_value(v)),
            Value::Object(map) => {
                for (name, v) in map.iter_mut() {
                    if is_secret_key(name) {
                        mask(v);
                    } else {
                        self.redact_value(v);
                    }
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    /// Mask secret fragments inside free text. Borrows when nothing matched.
    pub fn redact_str<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let replacement = format!("${{1}}={REDACTION_MARKER}");
        let pass_one = form_fragment().replace_all(text, replacement.as_str());

        if !json_fragment().is_match(&pass_one) {
            return pass_one;
        }
        let replacement = format!("${{1}}{REDACTION_MARKER}${{3}}");
        Cow::Owned(
            json_fragment()
                .replace_all(&pass_one, replacement.as_str())
                .into_owned(),
        )
    }
}

fn mask(value: &mut Value) {
    if !value.is_null() {
        *value = Value::String(REDACTION_MARKER.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::record::NewRecord;
    use serde_json::json;

    fn redacted(record: NewRecord) -> LogRecord {
        let mut record = record.stamp();
        Redactor::new().redact_record(&mut record);
        record
    }

    fn serialized(record: &LogRecord) -> String {
        serde_json::to_string(record).unwrap()
    }

    #[test]
    fn masks_password_field() {
        let record = redacted(NewRecord::new("session", "login").field("password", "secret123"));
        assert_eq!(record.fields["password"], REDACTION_MARKER);
        assert!(!serialized(&record).contains("secret123"));
    }

    #[test]
    fn masks_form_blob() {
        let record = redacted(
            NewRecord::new("nvp", "raw")
                .field("body", "METHOD=GetBalance&USER=u1&PWD=secret123&SIGNATURE=sig9"),
        );
        let body = record.fields["body"].as_str().unwrap();
        assert!(!body.contains("secret123"));
        assert!(!body.contains("sig9"));
        assert!(!body.contains("u1"));
        assert!(body.starts_with("METHOD=GetBalance&"));
        assert!(body.contains("PWD=[REDACTED]"));
    }

    #[test]
    fn masks_json_inside_string() {
        let record = redacted(NewRecord::new("nvp", "raw").field(
            "payload",
            r#"{"username": "merchant_api1", "signature":"AbC", "note":"ok"}"#,
        ));
        let text = record.fields["payload"].as_str().unwrap();
        assert!(!text.contains("merchant_api1"));
        assert!(!text.contains("AbC"));
        assert!(text.contains(r#""note":"ok""#));
    }

    #[test]
    fn masks_json_value_with_escaped_quote() {
        let record = redacted(NewRecord::new("nvp", "raw").field(
            "payload",
            r#"{"password":"ab\"SECRETTAIL","note":"ok"}"#,
        ));
        let text = record.fields["payload"].as_str().unwrap();
        assert!(!text.contains("SECRETTAIL"));
        assert_eq!(text, r#"{"password":"[REDACTED]","note":"ok"}"#);
    }

    #[test]
    fn masks_nested_keys_case_insensitively() {
        let record = redacted(NewRecord::new("nvp", "request").field(
            "params",
            json!({"USER": "u1", "Pwd": "p1", "inner": {"Signature": "s1", "AMT": "1.00"}}),
        ));
        let params = &record.fields["params"];
        assert_eq!(params["USER"], REDACTION_MARKER);
        assert_eq!(params["Pwd"], REDACTION_MARKER);
        assert_eq!(params["inner"]["Signature"], REDACTION_MARKER);
        assert_eq!(params["inner"]["AMT"], "1.00");
    }

    #[test]
    fn unrelated_fields_are_unchanged() {
        let original = NewRecord::new("nvp", "response")
            .field("method", "GetBalance")
            .field("status", 200)
            .field("data", json!({"ACK": "Success", "BALANCE": "12.34"}));
        let before = original.clone().stamp().fields;
        let after = redacted(original).fields;
        assert_eq!(before, after);
    }

    #[test]
    fn redact_str_borrows_when_clean() {
        let redactor = Redactor::new();
        assert!(matches!(redactor.redact_str("ACK=Success"), Cow::Borrowed(_)));
    }

    #[test]
    fn secret_key_shapes() {
        for key in ["PWD", "password", "newPassword", "SIGNATURE", "api_signature", "USER", "username"] {
            assert!(is_secret_key(key), "{key}");
        }
        for key in ["method", "status", "source", "EMAIL", "TRANSACTIONID"] {
            assert!(!is_secret_key(key), "{key}");
        }
    }
}
