//! Defines helper functions for processing the request path.

use crate::helpers::http::PercentDecoded;

const EXCLUDED_SEGMENTS: [&str; 1] = [""];

/// Holder for request URI path segments that have been split into individual
/// segments, used while walking the route table.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestPathSegments {
    segments: Vec<PercentDecoded>,
}

impl RequestPathSegments {
    /// Creates a new RequestPathSegments instance by splitting a request URI
    /// path. Empty segments are skipped, so `/some//path` yields
    /// `["some", "path"]`.
    pub(crate) fn new(path: &str) -> Self {
        let segments = path
            .split('/')
            .filter(|s| !EXCLUDED_SEGMENTS.contains(s))
            .filter_map(PercentDecoded::new)
            .collect();

        RequestPathSegments { segments }
    }

    /// Provide the decoded segments of the request path.
    pub(crate) fn segments(&self) -> &[PercentDecoded] {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_path_segments_tests() {
        let rps = RequestPathSegments::new("/some/path/to//my/handler");

        assert_eq!(
            rps.segments.iter().map(|s| s.as_ref()).collect::<Vec<_>>(),
            vec!["some", "path", "to", "my", "handler"]
        );
    }
}
