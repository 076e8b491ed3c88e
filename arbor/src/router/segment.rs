//! Defines the segment grammar for route patterns.

use std::fmt;

/// One segment of a route pattern.
///
/// Directory and file names of the form `[name]` bind a single request path
/// segment; `[...name]` binds the remainder of the path and may only appear
/// as the final segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Matched exactly, by string equality.
    Literal(String),
    /// Matches any single segment, binding it under the parameter name.
    Param(String),
    /// Matches zero or more trailing segments, binding them joined with `/`.
    CatchAll(String),
}

impl Segment {
    /// Parses one path component of a route file path.
    pub fn parse(raw: &str) -> Segment {
        if let Some(inner) = raw.strip_prefix("[...").and_then(|r| r.strip_suffix(']')) {
            Segment::CatchAll(inner.to_string())
        } else if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            Segment::Param(inner.to_string())
        } else {
            Segment::Literal(raw.to_string())
        }
    }

    /// True for `Param` and `CatchAll` segments.
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, Segment::Literal(_))
    }

    /// True for `CatchAll` segments.
    pub fn is_catch_all(&self) -> bool {
        matches!(self, Segment::CatchAll(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Param(name) => write!(f, "[{}]", name),
            Segment::CatchAll(name) => write!(f, "[...{}]", name),
        }
    }
}
