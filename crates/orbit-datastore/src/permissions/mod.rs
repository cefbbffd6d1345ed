//! Permission nodes, matching and inheritance resolution
//!
//! A permission node is a plain string such as `chat.color`, `build.*` or
//! `-chat.spam`. Nodes come in three shapes:
//! - grants, either literal or containing `*` wildcards
//! - negations, written with a leading `-`; the matcher treats the marker as
//!   ordinary text and leaves its meaning to whoever applies the set
//! - raw patterns, written with a leading `$`; the remainder is used as a
//!   regular expression verbatim

pub mod codec;
pub mod matcher;
pub mod resolver;

pub use codec::{decode_names, decode_nodes, encode_nodes, FALLBACK_NODE, NODE_SEPARATOR};
pub use matcher::PermissionMatcher;
pub use resolver::{compute_effective_permissions, Inherit, PermissionResolver};

pub const NEGATION_PREFIX: char = '-';
pub const RAW_PATTERN_PREFIX: char = '$';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind<'a> {
    /// Literal or wildcard grant
    Grant(&'a str),
    /// Negated node; holds the text after the marker
    Negated(&'a str),
    /// Regular expression; holds the text after the marker
    RawPattern(&'a str),
}

impl<'a> NodeKind<'a> {
    pub fn classify(node: &'a str) -> Self {
        if let Some(pattern) = node.strip_prefix(RAW_PATTERN_PREFIX) {
            Self::RawPattern(pattern)
        } else if let Some(rest) = node.strip_prefix(NEGATION_PREFIX) {
            Self::Negated(rest)
        } else {
            Self::Grant(node)
        }
    }
}

pub fn is_negated(node: &str) -> bool {
    matches!(NodeKind::classify(node), NodeKind::Negated(_))
}

/// The node that denies `permission` when present in a set
pub fn negation_of(permission: &str) -> String {
    format!("{NEGATION_PREFIX}{permission}")
}
