//! Compiled permission sets with an optional decision cache.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use tracing::debug;

use super::NodeKind;

#[derive(Debug)]
enum Rule {
    Pattern(Regex),
    /// Used when a node can't be compiled; compares case-insensitively
    Literal(String),
}

impl Rule {
    fn compile(node: &str) -> Self {
        let source = match NodeKind::classify(node) {
            NodeKind::RawPattern(pattern) => pattern.to_string(),
            NodeKind::Grant(_) | NodeKind::Negated(_) => wildcard_source(node),
        };

        match RegexBuilder::new(&format!("^(?:{source})$"))
            .case_insensitive(true)
            .build()
        {
            Ok(regex) => Self::Pattern(regex),
            Err(error) => {
                debug!(node, %error, "Permission node is not a valid pattern, matching literally");
                Self::Literal(node.to_string())
            }
        }
    }

    fn matches(&self, query: &str) -> bool {
        match self {
            Self::Pattern(regex) => regex.is_match(query),
            Self::Literal(node) => node.eq_ignore_ascii_case(query),
        }
    }
}

/// `.` is literal and `*` matches any run of characters. Other regex syntax
/// in the node is left as written.
fn wildcard_source(node: &str) -> String {
    node.replace('.', "\\.").replace('*', "(.*)")
}

#[derive(Debug, Default)]
struct CompiledSet {
    nodes: Vec<String>,
    rules: Vec<Rule>,
}

impl CompiledSet {
    fn compile<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut set = Self::default();

        for node in nodes {
            let node = node.into();
            if !seen.insert(node.clone()) {
                continue;
            }
            set.rules.push(Rule::compile(&node));
            set.nodes.push(node);
        }

        set
    }

    fn matches(&self, query: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(query))
    }
}

/// Answers whether a query string is granted by any node in a set.
///
/// Answers are a pure OR over the compiled nodes: negated nodes are matched
/// as text like any other node. With the decision cache enabled, the answer
/// for each exact query string is remembered until the set is replaced.
///
/// Lookups hold the read side of the set lock while recording a decision and
/// [`update_permission_set`](Self::update_permission_set) swaps the set and
/// purges decisions under the write side, so a decision computed against a
/// replaced set is never served.
#[derive(Debug)]
pub struct PermissionMatcher {
    compiled: RwLock<CompiledSet>,
    decisions: DashMap<String, bool>,
    caching: AtomicBool,
}

impl PermissionMatcher {
    pub fn new<I, S>(nodes: I, caching: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            compiled: RwLock::new(CompiledSet::compile(nodes)),
            decisions: DashMap::new(),
            caching: AtomicBool::new(caching),
        }
    }

    pub fn with_decision_cache<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(nodes, true)
    }

    pub fn without_decision_cache<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(nodes, false)
    }

    pub fn has_permission(&self, query: &str) -> bool {
        let compiled = self.compiled.read().unwrap_or_else(PoisonError::into_inner);

        if !self.caching.load(Ordering::Acquire) {
            return compiled.matches(query);
        }

        if let Some(decision) = self.decisions.get(query) {
            return *decision;
        }

        let decision = compiled.matches(query);
        self.decisions.insert(query.to_string(), decision);
        decision
    }

    /// Replace the node set and drop every cached decision.
    pub fn update_permission_set<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next = CompiledSet::compile(nodes);
        let mut compiled = self.compiled.write().unwrap_or_else(PoisonError::into_inner);
        *compiled = next;
        self.decisions.clear();
    }

    pub fn set_decision_cache(&self, enabled: bool) {
        let _compiled = self.compiled.write().unwrap_or_else(PoisonError::into_inner);
        self.caching.store(enabled, Ordering::Release);
        self.decisions.clear();
    }

    pub fn caches_decisions(&self) -> bool {
        self.caching.load(Ordering::Acquire)
    }

    /// Nodes in insertion order, without duplicates
    pub fn permission_set(&self) -> Vec<String> {
        self.compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .clone()
    }

    /// Whether `node` is literally part of the set (no pattern matching)
    pub fn contains_node(&self, node: &str) -> bool {
        self.compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .iter()
            .any(|candidate| candidate == node)
    }

    pub fn len(&self) -> usize {
        self.compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cached_decisions(&self) -> usize {
        self.decisions.len()
    }
}
