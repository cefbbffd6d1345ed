//! Flat text encoding for node sets and parent lists.

use std::collections::BTreeSet;

pub const NODE_SEPARATOR: char = ';';

/// Node substituted when a stored permission field holds nothing usable
pub const FALLBACK_NODE: &str = "default";

pub fn encode_nodes<I, S>(nodes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut encoded = String::new();
    for node in nodes {
        if !encoded.is_empty() {
            encoded.push(NODE_SEPARATOR);
        }
        encoded.push_str(node.as_ref());
    }
    encoded
}

fn tokens(field: &str) -> impl Iterator<Item = &str> {
    field
        .split(NODE_SEPARATOR)
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Decode a stored permission field.
///
/// A missing, empty or malformed field yields `{"default"}` instead of an
/// error.
pub fn decode_nodes(field: Option<&str>) -> BTreeSet<String> {
    let nodes: BTreeSet<String> = field
        .map(|field| tokens(field).map(str::to_string).collect())
        .unwrap_or_default();

    if nodes.is_empty() {
        return BTreeSet::from([FALLBACK_NODE.to_string()]);
    }
    nodes
}

/// Decode a stored list of group names. Unlike [`decode_nodes`] there is no
/// fallback: an empty field is an empty list.
pub fn decode_names(field: Option<&str>) -> BTreeSet<String> {
    field
        .map(|field| tokens(field).map(str::to_string).collect())
        .unwrap_or_default()
}
