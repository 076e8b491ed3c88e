//! Helpers for decoding request paths, query strings and bodies.

pub mod request;

use percent_encoding::percent_decode_str;
use serde_json::Value;

/// Represents data that has been successfully percent decoded and is valid UTF-8.
#[derive(Clone, PartialEq, Debug)]
pub struct PercentDecoded {
    val: String,
}

impl PercentDecoded {
    /// Attempt to decode data that has been provided in a percent encoded
    /// format and ensure that the result is valid UTF-8.
    pub(crate) fn new(raw: &str) -> Option<Self> {
        match percent_decode_str(raw).decode_utf8() {
            Ok(pd) => Some(PercentDecoded {
                val: pd.into_owned(),
            }),
            Err(_) => None,
        }
    }
}

impl AsRef<str> for PercentDecoded {
    fn as_ref(&self) -> &str {
        &self.val
    }
}

/// Decode form-urlencoded strings (e.g. query string, or request body with
/// Content-Type: application/x-www-form-urlencoded).
pub(crate) fn form_url_decode(raw: &str) -> Result<String, std::str::Utf8Error> {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8()
        .map(|pd| pd.into_owned())
}

/// Collapses a multi-valued field into the JSON value merged into handler
/// `data`: a bare string for a single value, an array otherwise.
pub(crate) fn collapse_values(mut values: Vec<String>) -> Value {
    if values.len() == 1 {
        Value::String(values.remove(0))
    } else {
        Value::Array(values.into_iter().map(Value::String).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_valid_percent_decode() {
        let pd = PercentDecoded::new("%41+%42%2B%63%20%64").unwrap();
        assert_eq!("A+B+c d", pd.as_ref());
    }

    #[test]
    fn ensure_valid_www_form_url_encoded_value() {
        let f = form_url_decode("%41+%42%2B%63%20%64").unwrap();
        assert_eq!("A B+c d", f);
    }
}
