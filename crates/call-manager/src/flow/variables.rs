//! `${name}` placeholder substitution

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Digits collected on the call
pub const VAR_CALL_DIGITS: &str = "voipbin.call.digits";
pub const VAR_CALL_ID: &str = "voipbin.call.id";
pub const VAR_CALL_SOURCE: &str = "voipbin.call.source.target";
pub const VAR_CALL_DESTINATION: &str = "voipbin.call.destination.target";
pub const VAR_CALL_DIRECTION: &str = "voipbin.call.direction";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^${}]+)\}").expect("static pattern"));

/// Replace every `${name}` in `text`; unknown names become empty
pub fn substitute(text: &str, variables: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            variables
                .get(caps[1].trim())
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// Substitute in every string inside a JSON option
pub fn substitute_json(value: &serde_json::Value, variables: &HashMap<String, String>) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) => Value::String(substitute(s, variables)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_json(v, variables)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_json(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}
