//! Defines helper functions for the request query string.

use std::collections::HashMap;

use crate::helpers::http::form_url_decode;

/// Provides a mapping of keys from the request query string to their supplied
/// values. Keys represented more than once collect every value in order.
pub(crate) type QueryStringMapping = HashMap<String, Vec<String>>;

/// Splits a query string into pairs and provides a mapping of keys to values.
///
/// Keys that are provided but with no value associated are skipped.
pub(crate) fn split(query: Option<&str>) -> QueryStringMapping {
    let mut mapping = QueryStringMapping::new();

    if let Some(query) = query {
        let pairs = query.split(is_separator).filter(|pair| pair.contains('='));

        for p in pairs {
            let mut sp = p.splitn(2, '=');
            let (k, v) = (sp.next().unwrap(), sp.next().unwrap());

            if let (Ok(k), Ok(v)) = (form_url_decode(k), form_url_decode(v)) {
                mapping.entry(k).or_insert_with(Vec::new).push(v);
            }
        }
    }

    mapping
}

fn is_separator(c: char) -> bool {
    c == '&' || c == ';'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_pairs(qsm: &QueryStringMapping) -> Vec<(&str, Vec<&str>)> {
        let mut pairs: Vec<(&str, Vec<&str>)> = qsm
            .iter()
            .map(|(k, v)| {
                let mut values: Vec<&str> = v.iter().map(|s| s.as_str()).collect();
                values.sort_unstable();
                (k.as_str(), values)
            })
            .collect();

        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }

    #[test]
    fn query_string_mapping_tests() {
        let qsm = split(Some("a=b&c=d&e=f"));
        assert_eq!(
            to_pairs(&qsm),
            vec![("a", vec!["b"]), ("c", vec!["d"]), ("e", vec!["f"])],
        );

        let qsm = split(Some("a=b&a=d&e=f"));
        assert_eq!(to_pairs(&qsm), vec![("a", vec!["b", "d"]), ("e", vec!["f"])]);

        let qsm = split(Some("a&b"));
        assert_eq!(to_pairs(&qsm), vec![]);

        let qsm = split(Some("a=b;c=d&e=f"));
        assert_eq!(
            to_pairs(&qsm),
            vec![("a", vec!["b"]), ("c", vec!["d"]), ("e", vec!["f"])],
        );

        let qsm = split(Some("a=b=c&d=e"));
        assert_eq!(to_pairs(&qsm), vec![("a", vec!["b=c"]), ("d", vec!["e"])]);
    }
}
