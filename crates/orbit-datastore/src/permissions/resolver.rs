//! Group inheritance resolution
//!
//! Effective permissions are collected by walking the parent graph depth
//! first from the group being resolved. The walk keeps a visited set for the
//! duration of a single resolution, so cyclic and self-referencing parent
//! lists terminate after every reachable group has been seen once.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::trace;

/// A node in the inheritance graph
pub trait Inherit {
    fn name(&self) -> &str;
    fn parents(&self) -> &BTreeSet<String>;
    /// Raw nodes declared on this group, excluding anything inherited
    fn own_permissions(&self) -> &BTreeSet<String>;
}

impl<T: Inherit + ?Sized> Inherit for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn parents(&self) -> &BTreeSet<String> {
        (**self).parents()
    }

    fn own_permissions(&self) -> &BTreeSet<String> {
        (**self).own_permissions()
    }
}

impl<T: Inherit + ?Sized> Inherit for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn parents(&self) -> &BTreeSet<String> {
        (**self).parents()
    }

    fn own_permissions(&self) -> &BTreeSet<String> {
        (**self).own_permissions()
    }
}

/// Resolves groups against a name lookup, typically the group cache.
pub struct PermissionResolver<F> {
    lookup: F,
}

impl<F, G> PermissionResolver<F>
where
    F: Fn(&str) -> Option<G>,
    G: Inherit,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Names of `group` and every reachable ancestor, in walk order.
    ///
    /// The root's own entry always comes first. Parents the lookup can't
    /// resolve are left out; see [`unresolved_parents`](Self::unresolved_parents).
    pub fn ancestry<T: Inherit + ?Sized>(&self, group: &T) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(group, |name, own| {
            if own.is_some() {
                names.push(name.to_string());
            }
        });
        names
    }

    /// Parent names referenced somewhere in the ancestry that don't resolve.
    pub fn unresolved_parents<T: Inherit + ?Sized>(&self, group: &T) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(group, |name, own| {
            if own.is_none() {
                names.push(name.to_string());
            }
        });
        names
    }

    /// The group's own nodes followed by every ancestor's own nodes, keeping
    /// the first occurrence of each node.
    pub fn effective_permissions<T: Inherit + ?Sized>(&self, group: &T) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut effective = Vec::new();

        self.walk(group, |_, own| {
            for node in own.into_iter().flatten() {
                if seen.insert(node.clone()) {
                    effective.push(node.clone());
                }
            }
        });

        effective
    }

    fn walk<T, V>(&self, root: &T, mut visit: V)
    where
        T: Inherit + ?Sized,
        V: FnMut(&str, Option<&BTreeSet<String>>),
    {
        let mut visited: HashSet<String> = HashSet::from([root.name().to_string()]);
        let mut pending = Vec::new();

        visit(root.name(), Some(root.own_permissions()));
        push_parents(&mut pending, root);

        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }

            match (self.lookup)(&name) {
                Some(group) => {
                    visit(&name, Some(group.own_permissions()));
                    push_parents(&mut pending, &group);
                }
                None => {
                    trace!(root = root.name(), parent = %name, "Parent group is not known");
                    visit(&name, None);
                }
            }
        }
    }
}

/// Parents are pushed in reverse so the first declared parent is expanded
/// first. A group listing itself as a parent is ignored.
fn push_parents<T: Inherit + ?Sized>(pending: &mut Vec<String>, group: &T) {
    for parent in group.parents().iter().rev() {
        if parent != group.name() {
            pending.push(parent.clone());
        }
    }
}

/// Shorthand for a one-off [`PermissionResolver::effective_permissions`].
pub fn compute_effective_permissions<T, F, G>(group: &T, lookup: F) -> Vec<String>
where
    T: Inherit + ?Sized,
    F: Fn(&str) -> Option<G>,
    G: Inherit,
{
    PermissionResolver::new(lookup).effective_permissions(group)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, Clone)]
    struct Node {
        name: String,
        parents: BTreeSet<String>,
        own: BTreeSet<String>,
    }

    fn node(name: &str, parents: &[&str], own: &[&str]) -> Node {
        Node {
            name: name.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            own: own.iter().map(|p| p.to_string()).collect(),
        }
    }

    impl Inherit for Node {
        fn name(&self) -> &str {
            &self.name
        }

        fn parents(&self) -> &BTreeSet<String> {
            &self.parents
        }

        fn own_permissions(&self) -> &BTreeSet<String> {
            &self.own
        }
    }

    fn graph(nodes: &[Node]) -> HashMap<String, Node> {
        nodes
            .iter()
            .map(|node| (node.name.clone(), node.clone()))
            .collect()
    }

    #[test]
    fn test_linear_inheritance() {
        let groups = graph(&[
            node("admin", &["mod"], &["server.stop"]),
            node("mod", &["default"], &["chat.mute"]),
            node("default", &[], &["chat.send"]),
        ]);
        let resolver = PermissionResolver::new(|name: &str| groups.get(name));

        assert_eq!(
            resolver.effective_permissions(&groups["admin"]),
            vec!["server.stop", "chat.mute", "chat.send"]
        );
        assert_eq!(resolver.ancestry(&groups["admin"]), vec!["admin", "mod", "default"]);
    }

    #[test]
    fn test_two_group_cycle_terminates() {
        let groups = graph(&[node("a", &["b"], &["x"]), node("b", &["a"], &["y"])]);
        let resolver = PermissionResolver::new(|name: &str| groups.get(name));

        assert_eq!(resolver.effective_permissions(&groups["a"]), vec!["x", "y"]);
        assert_eq!(resolver.effective_permissions(&groups["b"]), vec!["y", "x"]);
    }

    #[test]
    fn test_self_parent_is_ignored() {
        let groups = graph(&[node("loner", &["loner"], &["solo.play"])]);
        let resolver = PermissionResolver::new(|name: &str| groups.get(name));

        assert_eq!(resolver.effective_permissions(&groups["loner"]), vec!["solo.play"]);
        assert_eq!(resolver.ancestry(&groups["loner"]), vec!["loner"]);
    }

    #[test]
    fn test_missing_parent_contributes_nothing() {
        let groups = graph(&[node("orphan", &["ghost"], &["a.b"])]);
        let resolver = PermissionResolver::new(|name: &str| groups.get(name));

        assert_eq!(resolver.effective_permissions(&groups["orphan"]), vec!["a.b"]);
        assert_eq!(resolver.unresolved_parents(&groups["orphan"]), vec!["ghost"]);
    }

    #[test]
    fn test_diamond_visits_shared_ancestor_once() {
        let groups = graph(&[
            node("top", &["left", "right"], &["t"]),
            node("left", &["base"], &["l", "shared"]),
            node("right", &["base"], &["r", "shared"]),
            node("base", &[], &["b"]),
        ]);
        let resolver = PermissionResolver::new(|name: &str| groups.get(name));

        assert_eq!(resolver.ancestry(&groups["top"]), vec!["top", "left", "base", "right"]);
        assert_eq!(
            resolver.effective_permissions(&groups["top"]),
            vec!["t", "l", "shared", "b", "r"]
        );
    }

    #[test]
    fn test_own_nodes_come_first() {
        let groups = graph(&[
            node("child", &["parent"], &["b.node", "-shared"]),
            node("parent", &[], &["a.node", "-shared", "shared"]),
        ]);

        let effective = compute_effective_permissions(&groups["child"], |name: &str| groups.get(name));
        assert_eq!(effective[..2], ["-shared".to_string(), "b.node".to_string()]);
        assert_eq!(effective.len(), 4);
        assert!(effective.contains(&"a.node".to_string()));
        assert!(effective.contains(&"shared".to_string()));
    }

    #[test]
    fn test_uncached_root_resolves_from_itself() {
        let groups = graph(&[node("default", &[], &["chat.send"])]);
        let fresh = node("fresh", &["default"], &["fresh.node"]);

        let effective = compute_effective_permissions(&fresh, |name: &str| groups.get(name));
        assert_eq!(effective, vec!["fresh.node", "chat.send"]);
    }

    #[test]
    fn test_large_cyclic_graph_terminates() {
        let size = 200;
        let nodes: Vec<Node> = (0..size)
            .map(|index| {
                let next = format!("g{}", (index + 1) % size);
                let skip = format!("g{}", (index * 7 + 3) % size);
                node(
                    &format!("g{index}"),
                    &[next.as_str(), skip.as_str()],
                    &[format!("perm.{index}").as_str()],
                )
            })
            .collect();
        let groups = graph(&nodes);
        let resolver = PermissionResolver::new(|name: &str| groups.get(name));

        let effective = resolver.effective_permissions(&groups["g0"]);
        assert_eq!(effective.len(), size);
        assert_eq!(effective[0], "perm.0");
    }
}
