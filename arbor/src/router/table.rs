//! Defines the ordered route table built from a routes directory, and the
//! matcher that resolves request paths against it.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;

use hyper::{Method, StatusCode};
use log::{trace, warn};

use crate::config::{RoutingConfig, TrailingSlash};
use crate::helpers::http::request::path::RequestPathSegments;
use crate::module::ModuleUrl;
use crate::router::non_match::RouteNonMatch;
use crate::router::segment::Segment;

/// Basenames reserved for pipeline files; never routes.
pub(crate) const RESERVED_BASENAMES: [&str; 4] =
    ["dependencies", "middleware", "interceptors", "shared"];

/// Extensions recognized as route modules, probed in this order.
pub(crate) const MODULE_EXTENSIONS: [&str; 2] = ["ts", "js"];

/// A single discovered route.
#[derive(Clone, Debug)]
pub struct RouteEntry {
    /// The URL pattern, e.g. `/users/[id]`.
    pub pattern: String,
    /// The parsed pattern segments.
    pub segments: Vec<Segment>,
    /// The module that serves the route.
    pub file: ModuleUrl,
    /// Methods the module declares handlers for, resolved by importing the
    /// module when the table is installed.
    pub methods: HashSet<Method>,
    /// Whether the module's `default` export is a handler, serving any
    /// method not declared by name.
    pub default_handler: bool,
}

impl RouteEntry {
    /// Whether the route will serve the method. An empty method set means
    /// the module could not be inspected; matching then defers method
    /// policing to the handler phase.
    pub fn allows(&self, method: &Method) -> bool {
        self.default_handler || self.methods.is_empty() || self.methods.contains(method)
    }
}

/// The ordered list of route patterns for a routes tree.
///
/// Entries are held in specificity order, so matching is a scan that stops at
/// the first hit: fewer parameters beat more, non-catch-alls beat catch-alls,
/// longer literal prefixes beat shorter, and ties fall back to pattern order.
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    trailing_slash: TrailingSlash,
}

impl RouteTable {
    /// Builds a table from an enumerated list of route file paths.
    pub fn from_files<I>(files: I, config: &RoutingConfig) -> RouteTable
    where
        I: IntoIterator<Item = ModuleUrl>,
    {
        let mut entries: Vec<RouteEntry> =
            files.into_iter().filter_map(entry_for).collect();
        entries.sort_by_key(specificity);

        for entry in &entries {
            trace!(" discovered route {} -> {}", entry.pattern, entry.file);
        }

        RouteTable {
            entries,
            trailing_slash: config.trailing_slash,
        }
    }

    /// Builds a table by scanning a routes directory on disk.
    pub fn scan(root: &Path, config: &RoutingConfig) -> io::Result<RouteTable> {
        let mut files = Vec::new();
        collect_files(root, root, &mut files)?;
        files.sort();
        Ok(RouteTable::from_files(files, config))
    }

    /// Matches a request, returning the route and its extracted path
    /// parameters. The first entry in specificity order wins.
    ///
    /// A path that matches a route declaring other methods is a 405 carrying
    /// the declared methods for the `Allow` header; a path no pattern
    /// matches is a 404.
    pub fn match_route(
        &self,
        method: &Method,
        path: &str,
    ) -> std::result::Result<(&RouteEntry, HashMap<String, String>), RouteNonMatch> {
        if self.trailing_slash == TrailingSlash::Preserve
            && path.len() > 1
            && path.ends_with('/')
        {
            return Err(RouteNonMatch::new(StatusCode::NOT_FOUND));
        }

        let segments = RequestPathSegments::new(path);
        let request: Vec<&str> = segments.segments().iter().map(|s| s.as_ref()).collect();

        let matched = self
            .entries
            .iter()
            .find_map(|entry| match_segments(&entry.segments, &request).map(|p| (entry, p)));

        match matched {
            Some((entry, params)) if entry.allows(method) => Ok((entry, params)),
            Some((entry, _)) => {
                let allow: Vec<Method> = entry.methods.iter().cloned().collect();
                Err(RouteNonMatch::new(StatusCode::METHOD_NOT_ALLOWED).with_allow_list(&allow))
            }
            None => Err(RouteNonMatch::new(StatusCode::NOT_FOUND)),
        }
    }

    /// The discovered routes, in specificity order.
    pub fn routes(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub(crate) fn routes_mut(&mut self) -> &mut [RouteEntry] {
        &mut self.entries
    }
}

/// Derives the route entry for a file path, or `None` when the file is not a
/// route (reserved basename, unknown extension, misplaced catch-all).
fn entry_for(file: ModuleUrl) -> Option<RouteEntry> {
    let extension = file.as_str().rsplit('.').next().unwrap_or("");
    if !MODULE_EXTENSIONS.contains(&extension) {
        return None;
    }

    let stem = file.stem();
    if RESERVED_BASENAMES.contains(&stem) {
        return None;
    }

    let mut segments: Vec<Segment> = file
        .directory()
        .split('/')
        .filter(|c| !c.is_empty())
        .map(Segment::parse)
        .collect();

    if stem != "index" {
        segments.push(Segment::parse(stem));
    }

    let misplaced = segments
        .iter()
        .enumerate()
        .any(|(i, s)| s.is_catch_all() && i + 1 != segments.len());
    if misplaced {
        warn!(
            " ignoring route file {}: catch-all must be the last segment",
            file
        );
        return None;
    }

    let pattern = if segments.is_empty() {
        "/".to_string()
    } else {
        let mut pattern = String::new();
        for segment in &segments {
            pattern.push('/');
            pattern.push_str(&segment.to_string());
        }
        pattern
    };

    Some(RouteEntry {
        pattern,
        segments,
        file,
        methods: HashSet::new(),
        default_handler: false,
    })
}

/// The specificity sort key: fewer parameter segments first, then
/// non-catch-alls, then longer literal prefixes, then pattern order.
fn specificity(entry: &RouteEntry) -> (usize, bool, Reverse<usize>, String) {
    let params = entry.segments.iter().filter(|s| s.is_dynamic()).count();
    let catch_all = entry.segments.iter().any(|s| s.is_catch_all());
    let literal_prefix = entry
        .segments
        .iter()
        .take_while(|s| !s.is_dynamic())
        .count();

    (params, catch_all, Reverse(literal_prefix), entry.pattern.clone())
}

fn match_segments(
    pattern: &[Segment],
    request: &[&str],
) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut idx = 0;

    for segment in pattern {
        match segment {
            Segment::Literal(expected) => {
                if request.get(idx) != Some(&expected.as_str()) {
                    return None;
                }
                idx += 1;
            }
            Segment::Param(name) => {
                let value = request.get(idx)?;
                params.insert(name.clone(), (*value).to_string());
                idx += 1;
            }
            Segment::CatchAll(name) => {
                params.insert(name.clone(), request[idx..].join("/"));
                idx = request.len();
            }
        }
    }

    if idx == request.len() {
        Some(params)
    } else {
        None
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<ModuleUrl>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(ModuleUrl::new(relative.to_string_lossy()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;

    fn table(paths: &[&str]) -> RouteTable {
        RouteTable::from_files(
            paths.iter().map(ModuleUrl::new),
            &RoutingConfig::default(),
        )
    }

    fn table_with(paths: &[&str], trailing: TrailingSlash) -> RouteTable {
        let config = RoutingConfig {
            trailing_slash: trailing,
            ..RoutingConfig::default()
        };
        RouteTable::from_files(paths.iter().map(ModuleUrl::new), &config)
    }

    #[test]
    fn index_files_map_to_directory_patterns() {
        let table = table(&["index.ts", "users/index.ts", "users/[id].ts"]);
        let patterns: Vec<&str> =
            table.routes().iter().map(|e| e.pattern.as_str()).collect();

        assert!(patterns.contains(&"/"));
        assert!(patterns.contains(&"/users"));
        assert!(patterns.contains(&"/users/[id]"));
    }

    #[test]
    fn reserved_and_unknown_files_are_not_routes() {
        let table = table(&[
            "middleware.ts",
            "dependencies.ts",
            "interceptors.js",
            "shared.ts",
            "notes.md",
            "users/index.ts",
        ]);

        assert_eq!(table.routes().len(), 1);
        assert_eq!(table.routes()[0].pattern, "/users");
    }

    #[test]
    fn literal_routes_win_over_params() {
        let table = table(&["users/[id].ts", "users/me.ts"]);

        let (entry, params) = table.match_route(&Method::GET, "/users/me").unwrap();
        assert_eq!(entry.pattern, "/users/me");
        assert!(params.is_empty());

        let (entry, params) = table.match_route(&Method::GET, "/users/42").unwrap();
        assert_eq!(entry.pattern, "/users/[id]");
        assert_eq!(params["id"], "42");
    }

    #[test]
    fn non_catch_all_wins_over_catch_all() {
        let table = table(&["docs/[...slug].ts", "docs/[page].ts"]);

        let (entry, _) = table.match_route(&Method::GET, "/docs/intro").unwrap();
        assert_eq!(entry.pattern, "/docs/[page]");

        let (entry, params) = table
            .match_route(&Method::GET, "/docs/getting/started")
            .unwrap();
        assert_eq!(entry.pattern, "/docs/[...slug]");
        assert_eq!(params["slug"], "getting/started");
    }

    #[test]
    fn catch_all_matches_zero_segments() {
        let table = table(&["docs/[...slug].ts"]);
        let (_, params) = table.match_route(&Method::GET, "/docs").unwrap();
        assert_eq!(params["slug"], "");
    }

    #[test]
    fn declared_methods_gate_matching() {
        let mut table = table(&["items.ts"]);
        table.routes_mut()[0].methods.insert(Method::GET);

        assert!(table.match_route(&Method::GET, "/items").is_ok());

        let (status, allow) = table
            .match_route(&Method::POST, "/items")
            .unwrap_err()
            .deconstruct();
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(allow, vec![Method::GET]);

        // A default handler serves any method.
        table.routes_mut()[0].default_handler = true;
        assert!(table.match_route(&Method::POST, "/items").is_ok());
    }

    #[test]
    fn misplaced_catch_all_is_rejected() {
        let table = table(&["docs/[...slug]/extra.ts"]);
        assert!(table.routes().is_empty());
    }

    #[test]
    fn path_params_are_percent_decoded() {
        let table = table(&["users/[id].ts"]);
        let (_, params) = table.match_route(&Method::GET, "/users/ada%20l").unwrap();
        assert_eq!(params["id"], "ada l");
    }

    #[test]
    fn trailing_slash_policies() {
        let preserve = table_with(&["users/index.ts"], TrailingSlash::Preserve);
        assert!(preserve.match_route(&Method::GET, "/users").is_ok());
        assert!(preserve.match_route(&Method::GET, "/users/").is_err());

        let strip = table_with(&["users/index.ts"], TrailingSlash::Strip);
        assert!(strip.match_route(&Method::GET, "/users/").is_ok());

        let add = table_with(&["users/index.ts"], TrailingSlash::Add);
        assert!(add.match_route(&Method::GET, "/users").is_ok());
        assert!(add.match_route(&Method::GET, "/users/").is_ok());

        let root = table_with(&["index.ts"], TrailingSlash::Preserve);
        assert!(root.match_route(&Method::GET, "/").is_ok());
    }

    #[test]
    fn longer_literal_prefix_wins() {
        let table = table(&["a/[x]/c.ts", "a/b/[y].ts"]);
        let (entry, _) = table.match_route(&Method::GET, "/a/b/c").unwrap();
        assert_eq!(entry.pattern, "/a/b/[y]");
    }
}
