//! Defines parsing of request bodies into the tagged form handlers consume.

use std::collections::HashMap;

use bytes::Bytes;
use log::trace;
use serde_json::{Map, Value};

use crate::helpers::http::{collapse_values, form_url_decode};

/// The parsed request body, tagged by the content type that produced it.
#[derive(Clone, Debug)]
pub enum BodyKind {
    /// `application/json`.
    Json(Value),
    /// `application/x-www-form-urlencoded` or `multipart/form-data` fields.
    Form(HashMap<String, Vec<String>>),
    /// Any other non-empty payload, untouched.
    Raw(Bytes),
    /// No payload.
    Empty,
}

impl BodyKind {
    /// The fields this body contributes to handler `data`.
    pub(crate) fn data_fields(&self) -> Map<String, Value> {
        match self {
            BodyKind::Json(Value::Object(fields)) => fields.clone(),
            BodyKind::Form(fields) => fields
                .iter()
                .map(|(k, v)| (k.clone(), collapse_values(v.clone())))
                .collect(),
            _ => Map::new(),
        }
    }
}

/// Parses a request payload according to its `Content-Type`.
///
/// Malformed JSON and malformed multipart payloads degrade to `Raw` rather
/// than failing the request; the handler decides what to do with them.
pub(crate) fn parse(content_type: Option<&str>, body: &Bytes) -> BodyKind {
    if body.is_empty() {
        return BodyKind::Empty;
    }

    let content_type = content_type.unwrap_or("");

    if content_type.starts_with("application/json") {
        match serde_json::from_slice(body) {
            Ok(value) => return BodyKind::Json(value),
            Err(e) => {
                trace!(" request body is not valid json: {}", e);
                return BodyKind::Raw(body.clone());
            }
        }
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        if let Ok(raw) = std::str::from_utf8(body) {
            return BodyKind::Form(parse_form_urlencoded(raw));
        }
        return BodyKind::Raw(body.clone());
    }

    if content_type.starts_with("multipart/form-data") {
        if let Some(boundary) = multipart_boundary(content_type) {
            if let Some(fields) = parse_multipart(body, &boundary) {
                return BodyKind::Form(fields);
            }
        }
        return BodyKind::Raw(body.clone());
    }

    BodyKind::Raw(body.clone())
}

fn parse_form_urlencoded(raw: &str) -> HashMap<String, Vec<String>> {
    let mut fields = HashMap::new();

    for pair in raw.split('&').filter(|pair| pair.contains('=')) {
        let mut sp = pair.splitn(2, '=');
        let (k, v) = (sp.next().unwrap(), sp.next().unwrap());
        if let (Ok(k), Ok(v)) = (form_url_decode(k), form_url_decode(v)) {
            fields.entry(k).or_insert_with(Vec::new).push(v);
        }
    }

    fields
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    })
}

/// Extracts the text fields of a multipart payload. Parts carrying a
/// `filename` are skipped; file handling is not a pipeline concern.
fn parse_multipart(body: &Bytes, boundary: &str) -> Option<HashMap<String, Vec<String>>> {
    let text = std::str::from_utf8(body).ok()?;
    let delimiter = format!("--{}", boundary);
    let mut fields = HashMap::new();

    for part in text.split(delimiter.as_str()).skip(1) {
        let part = part.strip_prefix("\r\n").unwrap_or(part);
        if part.starts_with("--") {
            break;
        }

        let (head, value) = match part.find("\r\n\r\n") {
            Some(idx) => (&part[..idx], &part[idx + 4..]),
            None => continue,
        };

        let disposition = match head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))
        {
            Some(line) => line,
            None => continue,
        };
        if disposition.contains("filename=") {
            continue;
        }

        let name = disposition.split(';').find_map(|attr| {
            attr.trim()
                .strip_prefix("name=")
                .map(|n| n.trim_matches('"').to_string())
        });

        if let Some(name) = name {
            let value = value.strip_suffix("\r\n").unwrap_or(value).to_string();
            fields.entry(name).or_insert_with(Vec::new).push(value);
        }
    }

    Some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_bodies() {
        let body = Bytes::from_static(b"{\"id\": 7}");
        match parse(Some("application/json"), &body) {
            BodyKind::Json(v) => assert_eq!(v["id"], 7),
            other => panic!("expected json body, got {:?}", other),
        }
    }

    #[test]
    fn parses_form_urlencoded_bodies() {
        let body = Bytes::from_static(b"name=Ada+L&tag=a&tag=b");
        match parse(Some("application/x-www-form-urlencoded"), &body) {
            BodyKind::Form(fields) => {
                assert_eq!(fields["name"], vec!["Ada L"]);
                assert_eq!(fields["tag"], vec!["a", "b"]);
            }
            other => panic!("expected form body, got {:?}", other),
        }
    }

    #[test]
    fn parses_multipart_text_fields_and_skips_files() {
        let body = Bytes::from_static(
            b"--XX\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n--XX\r\nContent-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\nContent-Type: application/octet-stream\r\n\r\nfilebytes\r\n--XX--\r\n",
        );
        match parse(Some("multipart/form-data; boundary=XX"), &body) {
            BodyKind::Form(fields) => {
                assert_eq!(fields["title"], vec!["hello"]);
                assert!(!fields.contains_key("upload"));
            }
            other => panic!("expected form body, got {:?}", other),
        }
    }

    #[test]
    fn empty_and_unknown_bodies() {
        assert!(matches!(parse(None, &Bytes::new()), BodyKind::Empty));
        assert!(matches!(
            parse(Some("text/csv"), &Bytes::from_static(b"a,b")),
            BodyKind::Raw(_)
        ));
    }

    #[test]
    fn malformed_json_degrades_to_raw() {
        let body = Bytes::from_static(b"{nope");
        assert!(matches!(parse(Some("application/json"), &body), BodyKind::Raw(_)));
    }
}
