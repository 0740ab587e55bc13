//! Query-string encoding for API parameters and redirect fragments.

use std::collections::HashMap;

use serde_json::{Map, Value};
use url::form_urlencoded;

/// Encode parameters as `application/x-www-form-urlencoded`.
///
/// Strings are used verbatim, `null` becomes an empty value, and everything else
/// uses its JSON text.
#[must_use]
pub fn encode_query(params: &Map<String, Value>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        match value {
            Value::String(text) => serializer.append_pair(key, text),
            Value::Null => serializer.append_pair(key, ""),
            other => serializer.append_pair(key, &other.to_string()),
        };
    }
    serializer.finish()
}

/// Decode a query string or URL fragment. A leading `?` or `#` is ignored and the
/// last occurrence of a key wins.
#[must_use]
pub fn decode_query(raw: &str) -> HashMap<String, String> {
    let trimmed = raw.trim_start_matches(['?', '#']);
    form_urlencoded::parse(trimmed.as_bytes())
        .into_owned()
        .collect()
}
