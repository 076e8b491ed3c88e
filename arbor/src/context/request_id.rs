//! Defines a unique id per request that is echoed on every response and
//! prefixed to all pipeline logging.

use hyper::HeaderMap;
use log::trace;
use uuid::Uuid;

/// Derives the identifier for a request.
///
/// 1. If the configured request-id header is present, its value is used as is;
/// 2. otherwise a fresh UUID v4 is generated.
///
/// The engine invokes this before any pipeline stage runs, so application
/// code can rely on the id being present and stable for the life of the
/// request.
pub(crate) fn derive_request_id(headers: &HeaderMap, header_name: &str) -> String {
    match headers.get(header_name).and_then(|v| v.to_str().ok()) {
        Some(external) if !external.is_empty() => {
            trace!(
                "[{}] request id set from external source via {} header",
                external,
                header_name
            );
            external.to_string()
        }
        _ => {
            let val = Uuid::new_v4().hyphenated().to_string();
            trace!("[{}] request id generated internally", val);
            val
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_an_external_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "1-2-3-4".parse().unwrap());

        assert_eq!(derive_request_id(&headers, "x-request-id"), "1-2-3-4");
    }

    #[test]
    fn generates_a_unique_request_id() {
        let headers = HeaderMap::new();
        let id = derive_request_id(&headers, "x-request-id");
        assert_eq!(4, Uuid::parse_str(&id).unwrap().get_version_num());
    }

    #[test]
    fn respects_a_custom_header_name() {
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", "abc".parse().unwrap());

        assert_eq!(derive_request_id(&headers, "x-correlation-id"), "abc");
        assert_ne!(derive_request_id(&headers, "x-request-id"), "abc");
    }
}
