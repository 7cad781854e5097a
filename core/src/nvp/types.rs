//! Request parameters and decoded responses of the NVP dialect.
//!
//! Both sides are deliberately untyped: the protocol is a flat bag of
//! text fields and the meaning of each field is method-specific. The only
//! structure we impose is insertion order on the way out and a handful of
//! accessors for the status fields every response shares.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

// ---------------------------------------------------------------------------
// NvpParams
// ---------------------------------------------------------------------------

/// Insertion-ordered name/value list for an outbound call.
///
/// `set` overwrites an existing name in place, so a caller overriding a
/// base field keeps the field at its original position on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvpParams {
    pairs: Vec<(String, String)>,
}

impl NvpParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or overwrite `name`. Names compare case-insensitively; an
    /// overwrite keeps the spelling first inserted.
    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        let value = value.to_string();
        match self.pairs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self
            .pairs
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.pairs.remove(idx).1)
    }

    /// Drop every pair for which `keep` returns false.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.pairs.retain(|(k, v)| keep(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Build parameters from a JSON object, as received in request bodies.
    ///
    /// Strings are kept verbatim, numbers and booleans are stringified,
    /// `null` is skipped, and nested arrays/objects are sent as their JSON
    /// text (the protocol has no nesting, so this is the least surprising
    /// flattening).
    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut params = Self::new();
        for (name, value) in object {
            let text = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => other.to_string(),
            };
            params.set(name.clone(), text);
        }
        params
    }
}

impl<K, V> FromIterator<(K, V)> for NvpParams
where
    K: Into<String>,
    V: ToString,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.set(k, v);
        }
        params
    }
}

impl Serialize for NvpParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (k, v) in &self.pairs {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Ack
// ---------------------------------------------------------------------------

/// Value of the top-level `ACK` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Success,
    SuccessWithWarning,
    Failure,
    FailureWithWarning,
    /// Anything the upstream invents later. Kept verbatim.
    Unknown(String),
}

impl Ack {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Success" => Ack::Success,
            "SuccessWithWarning" => Ack::SuccessWithWarning,
            "Failure" => Ack::Failure,
            "FailureWithWarning" => Ack::FailureWithWarning,
            other => Ack::Unknown(other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Ack::Success | Ack::SuccessWithWarning)
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ack::Success => f.write_str("Success"),
            Ack::SuccessWithWarning => f.write_str("SuccessWithWarning"),
            Ack::Failure => f.write_str("Failure"),
            Ack::FailureWithWarning => f.write_str("FailureWithWarning"),
            Ack::Unknown(s) => f.write_str(s),
        }
    }
}

// ---------------------------------------------------------------------------
// NvpResponse
// ---------------------------------------------------------------------------

/// One entry of the `L_ERRORCODEn` / `L_SHORTMESSAGEn` / ... error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvpErrorDetail {
    pub code: Option<String>,
    pub short_message: Option<String>,
    pub long_message: Option<String>,
    pub severity: Option<String>,
}

/// A decoded response body: a flat map of text fields.
///
/// A non-success `ACK` is still a perfectly valid response. Callers decide
/// what a `Failure` means for them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NvpResponse {
    fields: BTreeMap<String, String>,
}

impl NvpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing any previous value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.fields
    }

    /// Parsed `ACK`, or `None` when the upstream omitted it entirely.
    pub fn ack(&self) -> Option<Ack> {
        self.get("ACK").map(Ack::parse)
    }

    pub fn is_success(&self) -> bool {
        self.ack().map(|a| a.is_success()).unwrap_or(false)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get("CORRELATIONID")
    }

    /// Collect the indexed error list.
    pub fn errors(&self) -> Vec<NvpErrorDetail> {
        self.indexed_rows(&[
            "L_ERRORCODE",
            "L_SHORTMESSAGE",
            "L_LONGMESSAGE",
            "L_SEVERITYCODE",
        ])
        .into_iter()
        .map(|mut row| NvpErrorDetail {
            code: row.remove("L_ERRORCODE"),
            short_message: row.remove("L_SHORTMESSAGE"),
            long_message: row.remove("L_LONGMESSAGE"),
            severity: row.remove("L_SEVERITYCODE"),
        })
        .collect()
    }

    /// Group suffixed list fields into rows.
    ///
    /// For prefixes `["L_TRANSACTIONID", "L_AMT"]`, row `n` holds whichever
    /// of `L_TRANSACTIONIDn` / `L_AMTn` exist, keyed by prefix. Collection
    /// stops at the first index where none of the prefixes is present.
    pub fn indexed_rows(&self, prefixes: &[&str]) -> Vec<BTreeMap<String, String>> {
        let mut rows = Vec::new();
        for index in 0.. {
            let row: BTreeMap<String, String> = prefixes
                .iter()
                .filter_map(|prefix| {
                    self.get(&format!("{prefix}{index}"))
                        .map(|v| (prefix.to_string(), v.to_string()))
                })
                .collect();
            if row.is_empty() {
                break;
            }
            rows.push(row);
        }
        rows
    }
}

impl From<BTreeMap<String, String>> for NvpResponse {
    fn from(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_in_place() {
        let mut params = NvpParams::new().with("METHOD", "A").with("VERSION", "1");
        params.set("METHOD", "B");
        let order: Vec<_> = params.iter().collect();
        assert_eq!(order, vec![("METHOD", "B"), ("VERSION", "1")]);
    }

    #[test]
    fn names_compare_case_insensitively() {
        let mut params = NvpParams::new().with("TRANSACTIONID", "9XY");
        assert_eq!(params.get("transactionId"), Some("9XY"));
        assert!(params.contains("TransactionID"));

        params.set("transactionid", "7AB");
        assert_eq!(params.len(), 1);
        assert_eq!(params.iter().next(), Some(("TRANSACTIONID", "7AB")));

        assert_eq!(params.remove("TransactionId"), Some("7AB".to_string()));
        assert!(params.is_empty());
    }

    #[test]
    fn from_json_object_flattens_scalars_and_skips_null() {
        let body = serde_json::json!({
            "STARTDATE": "2024-01-01T00:00:00Z",
            "AMT": 12.5,
            "RETURNALLCURRENCIES": 1,
            "FLAG": true,
            "NOTE": null,
        });
        let params = NvpParams::from_json_object(body.as_object().unwrap());

        assert_eq!(params.get("STARTDATE"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(params.get("AMT"), Some("12.5"));
        assert_eq!(params.get("RETURNALLCURRENCIES"), Some("1"));
        assert_eq!(params.get("FLAG"), Some("true"));
        assert!(!params.contains("NOTE"));
    }

    #[test]
    fn ack_parsing_and_success() {
        assert!(Ack::parse("Success").is_success());
        assert!(Ack::parse("SuccessWithWarning").is_success());
        assert!(!Ack::parse("Failure").is_success());
        assert!(!Ack::parse("FailureWithWarning").is_success());
        assert_eq!(Ack::parse("Pending"), Ack::Unknown("Pending".into()));
    }

    #[test]
    fn response_without_ack_is_not_success() {
        let resp = NvpResponse::new();
        assert!(resp.ack().is_none());
        assert!(!resp.is_success());
    }

    #[test]
    fn errors_collects_indexed_list() {
        let mut resp = NvpResponse::new();
        resp.insert("ACK", "Failure");
        resp.insert("L_ERRORCODE0", "10002");
        resp.insert("L_SHORTMESSAGE0", "Security error");
        resp.insert("L_SEVERITYCODE0", "Error");
        resp.insert("L_ERRORCODE1", "10004");

        let errors = resp.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code.as_deref(), Some("10002"));
        assert_eq!(errors[0].short_message.as_deref(), Some("Security error"));
        assert_eq!(errors[0].long_message, None);
        assert_eq!(errors[1].code.as_deref(), Some("10004"));
    }

    #[test]
    fn indexed_rows_groups_transaction_lists() {
        let mut resp = NvpResponse::new();
        resp.insert("L_TRANSACTIONID0", "TX0");
        resp.insert("L_AMT0", "10.00");
        resp.insert("L_TRANSACTIONID1", "TX1");
        resp.insert("L_AMT1", "-2.50");
        // Gap at 2: collection stops even though 3 exists.
        resp.insert("L_TRANSACTIONID3", "TX3");

        let rows = resp.indexed_rows(&["L_TRANSACTIONID", "L_AMT"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["L_TRANSACTIONID"], "TX1");
        assert_eq!(rows[1]["L_AMT"], "-2.50");
    }

    #[test]
    fn response_serializes_flat() {
        let mut resp = NvpResponse::new();
        resp.insert("ACK", "Success");
        resp.insert("BALANCE", "12.34");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, serde_json::json!({"ACK": "Success", "BALANCE": "12.34"}));
    }
}
