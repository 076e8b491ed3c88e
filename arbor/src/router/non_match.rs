//! Defines the type used to indicate a non-matching route, and its
//! conversion into the pipeline error the client sees.

use hyper::{Method, StatusCode};

use crate::error::HttpError;

/// The result of failing to match a request to a routable handler: the
/// status to respond with, and for a 405, the methods the route does accept.
#[derive(Clone, Debug)]
pub struct RouteNonMatch {
    status: StatusCode,
    allow: Vec<Method>,
}

impl RouteNonMatch {
    /// Creates a new `RouteNonMatch` with the given HTTP status.
    pub fn new(status: StatusCode) -> RouteNonMatch {
        RouteNonMatch {
            status,
            allow: Vec::new(),
        }
    }

    /// Attaches the allow list. Required whenever the non-match is due to the
    /// HTTP method, so the `Allow` header can be populated accurately.
    pub fn with_allow_list(self, allow: &[Method]) -> RouteNonMatch {
        RouteNonMatch {
            allow: allow.to_vec(),
            ..self
        }
    }

    /// Splits into status and a sorted, deduplicated allow list.
    pub fn deconstruct(self) -> (StatusCode, Vec<Method>) {
        let mut allow = self.allow;
        allow.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allow.dedup();
        (self.status, allow)
    }
}

impl From<RouteNonMatch> for HttpError {
    fn from(non_match: RouteNonMatch) -> HttpError {
        let (status, allow) = non_match.deconstruct();
        match status {
            StatusCode::METHOD_NOT_ALLOWED => HttpError::method_not_allowed(allow),
            StatusCode::NOT_FOUND => HttpError::route_not_found("request path"),
            other => HttpError::new(other, "request not routable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deconstruct_sorts_and_dedupes() {
        let (status, allow) = RouteNonMatch::new(StatusCode::METHOD_NOT_ALLOWED)
            .with_allow_list(&[Method::POST, Method::GET, Method::POST])
            .deconstruct();

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(allow, vec![Method::GET, Method::POST]);
    }

    #[test]
    fn converts_into_pipeline_errors() {
        let err: HttpError = RouteNonMatch::new(StatusCode::METHOD_NOT_ALLOWED)
            .with_allow_list(&[Method::GET])
            .into();
        assert_eq!(err.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(err.allow, vec![Method::GET]);
    }
}
