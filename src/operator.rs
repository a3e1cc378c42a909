//! Boolean expression trees over event matchers.
//!
//! A `start on`/`stop on` condition is a binary tree of `and`/`or` nodes
//! whose leaves each match one event by name and arguments. Nodes live in
//! a small arena inside [`EventExpression`]; traversals use explicit
//! stacks because trees are built from untrusted configuration text.
//!
//! A matched leaf latches a reference to its event and blocks it; the
//! block is given back by [`EventExpression::reset`]. While a tree holds a
//! reference, the event's blocker count reflects it exactly once.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::environ;
use crate::error::StateError;
use crate::event::{Blocked, Event, EventId, EventPool};

/// Boolean behaviour of one tree node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperatorType {
    /// True when either child is true.
    Or,
    /// True when both children are true.
    And,
    /// Leaf matching a single event.
    Match,
}

/// One node of an expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    /// Node behaviour.
    pub op: OperatorType,
    /// Current truth value.
    pub value: bool,
    /// Event name to match (`Match` only).
    pub name: Option<String>,
    /// Match patterns, positional then named (`Match` only).
    pub env: Vec<String>,
    /// The latched event; set iff `value` is true on a `Match` node.
    pub event: Option<EventId>,
    left: Option<usize>,
    right: Option<usize>,
}

impl OperatorNode {
    fn leaf(name: String, env: Vec<String>) -> Self {
        Self {
            op: OperatorType::Match,
            value: false,
            name: Some(name),
            env,
            event: None,
            left: None,
            right: None,
        }
    }
}

/// An expression tree with a designated root.
///
/// Every non-leaf node has exactly two children and every leaf has none;
/// both invariants hold by construction.
#[derive(Debug, PartialEq)]
pub struct EventExpression {
    nodes: Vec<OperatorNode>,
    root: usize,
}

/// Serialised form of one node, emitted in post-order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialOperator {
    /// Node behaviour.
    pub op: OperatorType,
    /// Latched truth value.
    pub value: bool,
    /// Event name (`match` nodes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Match patterns (`match` nodes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Pool index of the latched event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<usize>,
}

impl EventExpression {
    /// Builds a single-leaf expression matching `name` with `patterns`.
    pub fn matcher(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            nodes: vec![OperatorNode::leaf(name.into(), patterns)],
            root: 0,
        }
    }

    /// Joins two expressions under a new `and`/`or` root.
    pub fn combine(op: OperatorType, left: Self, right: Self) -> Self {
        debug_assert!(matches!(op, OperatorType::And | OperatorType::Or));
        let mut nodes = left.nodes;
        let offset = nodes.len();
        for mut node in right.nodes {
            node.left = node.left.map(|idx| idx + offset);
            node.right = node.right.map(|idx| idx + offset);
            nodes.push(node);
        }
        let root = OperatorNode {
            op,
            value: false,
            name: None,
            env: Vec::new(),
            event: None,
            left: Some(left.root),
            right: Some(right.root + offset),
        };
        nodes.push(root);
        let root = nodes.len() - 1;
        Self { nodes, root }
    }

    /// Truth value of the whole expression.
    pub fn value(&self) -> bool {
        self.nodes[self.root].value
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree is a lone leaf.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node indices in post-order (children before parents, left before
    /// right), computed with an explicit stack.
    fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            let node = &self.nodes[idx];
            if let Some(left) = node.left {
                stack.push(left);
            }
            if let Some(right) = node.right {
                stack.push(right);
            }
        }
        order.reverse();
        order
    }

    fn update(&mut self, idx: usize) {
        let node = &self.nodes[idx];
        let (Some(left), Some(right)) = (node.left, node.right) else {
            return;
        };
        let left_value = self.nodes[left].value;
        let right_value = self.nodes[right].value;
        let node = &mut self.nodes[idx];
        node.value = match node.op {
            OperatorType::Or => left_value || right_value,
            OperatorType::And => left_value && right_value,
            OperatorType::Match => unreachable!("match nodes have no children"),
        };
    }

    /// Matches `event` against every unlatched leaf, then recomputes every
    /// interior node bottom-up.
    ///
    /// Returns whether any leaf latched onto this event; the caller must
    /// still inspect [`value`](Self::value) to learn whether the whole
    /// expression is now satisfied.
    pub fn handle(
        &mut self,
        pool: &mut EventPool,
        id: EventId,
        expansion_env: &[String],
    ) -> bool {
        let mut blocks = 0;
        let mut latched = false;
        {
            let Some(event) = pool.get(id) else {
                return false;
            };
            for idx in self.post_order() {
                match self.nodes[idx].op {
                    OperatorType::Match => {
                        if !self.nodes[idx].value
                            && match_event(&self.nodes[idx], event, expansion_env)
                        {
                            self.nodes[idx].value = true;
                            self.nodes[idx].event = Some(id);
                            blocks += 1;
                            latched = true;
                        }
                    }
                    _ => self.update(idx),
                }
            }
        }
        for _ in 0..blocks {
            pool.block(id);
        }
        latched
    }

    /// Clears every leaf, releasing latched events, and recomputes every
    /// interior node.
    pub fn reset(&mut self, pool: &mut EventPool) {
        for idx in self.post_order() {
            match self.nodes[idx].op {
                OperatorType::Match => {
                    self.nodes[idx].value = false;
                    if let Some(id) = self.nodes[idx].event.take() {
                        pool.unblock(id);
                    }
                }
                _ => self.update(idx),
            }
        }
    }

    /// Deep copy that preserves matched state; every latched event gains
    /// one further blocker for the copy's reference.
    pub fn copy(&self, pool: &mut EventPool) -> Self {
        let copied = Self {
            nodes: self.nodes.clone(),
            root: self.root,
        };
        for node in &copied.nodes {
            if let Some(id) = node.event {
                pool.block(id);
            }
        }
        copied
    }

    /// Visits the satisfied part of the tree in pre-order, skipping any
    /// subtree whose root value is false.
    fn satisfied_leaves(&self) -> Vec<&OperatorNode> {
        let mut leaves = Vec::new();
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !node.value {
                continue;
            }
            if node.op == OperatorType::Match {
                leaves.push(node);
                continue;
            }
            // Right below left so the left subtree is visited first.
            if let Some(right) = node.right {
                stack.push(right);
            }
            if let Some(left) = node.left {
                stack.push(left);
            }
        }
        leaves
    }

    /// Appends the environment of every event latched in the satisfied
    /// part of the tree into `env` (set semantics), left to right.
    ///
    /// Only events that took an active role are collected: a matched leaf
    /// under an unsatisfied `and` contributes nothing. When `events_key`
    /// is given, a `KEY=name name ...` entry listing the contributing
    /// event names is appended last.
    pub fn environment(
        &self,
        pool: &EventPool,
        env: &mut Vec<String>,
        events_key: Option<&str>,
    ) {
        let mut names = String::new();
        for leaf in self.satisfied_leaves() {
            let id = leaf.event.expect("true match leaf latched an event");
            let Some(event) = pool.get(id) else {
                continue;
            };
            environ::append(env, &event.env);
            if events_key.is_some() {
                if !names.is_empty() {
                    names.push(' ');
                }
                names.push_str(&event.name);
            }
        }
        if let Some(key) = events_key {
            environ::set(env, &format!("{key}={names}"));
        }
    }

    /// Blocks every event in the satisfied part of the tree once more and
    /// returns a [`Blocked`] record per reference, for a waiter's list.
    pub fn events(&self, pool: &mut EventPool) -> Vec<Blocked> {
        let ids: Vec<EventId> = self
            .satisfied_leaves()
            .iter()
            .map(|leaf| leaf.event.expect("true match leaf latched an event"))
            .collect();
        let mut blocked = Vec::with_capacity(ids.len());
        for id in ids {
            pool.block(id);
            blocked.push(Blocked::Event(id));
        }
        blocked
    }

    /// Reconstructs a fully-parenthesised textual form of the expression.
    pub fn collapse(&self) -> String {
        let root = &self.nodes[self.root];
        if root.op == OperatorType::Match {
            return leaf_text(root);
        }

        let mut stack: Vec<String> = Vec::new();
        for idx in self.post_order() {
            let node = &self.nodes[idx];
            if node.op == OperatorType::Match {
                continue;
            }
            let left = node.left.expect("interior node has two children");
            let right = node.right.expect("interior node has two children");

            // The right child's expression was pushed after the left one,
            // so it must be popped first.
            let right_expr = if self.nodes[right].op == OperatorType::Match {
                leaf_text(&self.nodes[right])
            } else {
                stack.pop().expect("right subtree already collapsed")
            };
            let left_expr = if self.nodes[left].op == OperatorType::Match {
                leaf_text(&self.nodes[left])
            } else {
                stack.pop().expect("left subtree already collapsed")
            };

            stack.push(format!("({left_expr} {node_op} {right_expr})", node_op = node.op));
        }

        stack.pop().expect("root expression collapsed")
    }

    /// Serialises the tree as its post-order node array.
    pub fn serialise(&self) -> Vec<SerialOperator> {
        self.post_order()
            .into_iter()
            .map(|idx| {
                let node = &self.nodes[idx];
                SerialOperator {
                    op: node.op,
                    value: node.value,
                    name: node.name.clone(),
                    env: node.env.clone(),
                    event: node.event,
                }
            })
            .collect()
    }

    /// Rebuilds a tree from its post-order node array.
    ///
    /// Each binary node pops its right child first, then its left — the
    /// exact reverse of serialisation order. Latched event references are
    /// restored verbatim; the caller re-blocks them against its pool.
    pub fn deserialise(ops: &[SerialOperator]) -> Result<Self, StateError> {
        if ops.is_empty() {
            return Err(StateError::MalformedOperators("empty operator array"));
        }

        let mut nodes: Vec<OperatorNode> = Vec::with_capacity(ops.len());
        let mut stack: Vec<usize> = Vec::new();
        for op in ops {
            match op.op {
                OperatorType::Match => {
                    let name = op.name.clone().ok_or(StateError::MalformedOperators(
                        "match node without a name",
                    ))?;
                    nodes.push(OperatorNode {
                        op: OperatorType::Match,
                        value: op.value,
                        name: Some(name),
                        env: op.env.clone(),
                        event: op.event,
                        left: None,
                        right: None,
                    });
                    stack.push(nodes.len() - 1);
                }
                kind => {
                    let right = stack.pop().ok_or(StateError::MalformedOperators(
                        "binary node without a right child",
                    ))?;
                    let left = stack.pop().ok_or(StateError::MalformedOperators(
                        "binary node without a left child",
                    ))?;
                    nodes.push(OperatorNode {
                        op: kind,
                        value: op.value,
                        name: None,
                        env: Vec::new(),
                        event: None,
                        left: Some(left),
                        right: Some(right),
                    });
                    stack.push(nodes.len() - 1);
                }
            }
        }

        let root = stack.pop().ok_or(StateError::MalformedOperators(
            "operator array produced no root",
        ))?;
        if !stack.is_empty() {
            return Err(StateError::MalformedOperators(
                "operator array left unattached nodes",
            ));
        }
        Ok(Self { nodes, root })
    }

    /// Takes one blocker per latched event reference; used after
    /// deserialisation to make the pool counts match the tree again.
    pub fn block_events(&self, pool: &mut EventPool) {
        for node in &self.nodes {
            if let Some(id) = node.event {
                pool.block(id);
            }
        }
    }

    /// Iterates the nodes in storage order.
    pub fn nodes(&self) -> impl Iterator<Item = &OperatorNode> {
        self.nodes.iter()
    }
}

fn leaf_text(node: &OperatorNode) -> String {
    let mut text = node.name.clone().unwrap_or_default();
    for pattern in &node.env {
        text.push(' ');
        if pattern.contains(char::is_whitespace)
            || pattern == "and"
            || pattern == "or"
        {
            text.push('"');
            text.push_str(pattern);
            text.push('"');
        } else {
            text.push_str(pattern);
        }
    }
    text
}

fn split_pattern(pattern: &str) -> (Option<&str>, bool, &str) {
    if let Some(idx) = pattern.find("!=") {
        (Some(&pattern[..idx]), true, &pattern[idx + 2..])
    } else if let Some(idx) = pattern.find('=') {
        (Some(&pattern[..idx]), false, &pattern[idx + 1..])
    } else {
        (None, false, pattern)
    }
}

/// Compares one `Match` node against an event.
///
/// Names must be identical. Patterns are matched positionally against the
/// event's values until the first named pattern, then by key lookup. The
/// pattern text is expanded against `expansion_env` first and applied as a
/// filename-style glob; `!=` inverts the result. More positional patterns
/// than event values fails the match, while a `!=` lookup of an absent
/// variable succeeds.
pub fn match_event(node: &OperatorNode, event: &Event, expansion_env: &[String]) -> bool {
    debug_assert_eq!(node.op, OperatorType::Match);
    if node.name.as_deref() != Some(event.name.as_str()) {
        return false;
    }

    let mut position = 0usize;
    for pattern in &node.env {
        let (name, negate, raw) = split_pattern(pattern);

        let found: Option<&str> = match name {
            Some(key) => environ::lookup(&event.env, key),
            None => {
                let entry = event.env.get(position).map(|entry| {
                    environ::value(entry).unwrap_or(entry.as_str())
                });
                position += 1;
                entry
            }
        };

        let Ok(expanded) = environ::expand(raw, expansion_env) else {
            return false;
        };

        match found {
            Some(value) => {
                let matched = glob_match(&expanded, value);
                if matched == negate {
                    return false;
                }
            }
            None => {
                // Positional overflow always fails; a negated lookup of an
                // absent variable succeeds.
                if name.is_none() || !negate {
                    return false;
                }
            }
        }
    }

    true
}

/// Filename-style glob match (`*`, `?`, `[...]`), compiled to an anchored
/// regex.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    class.push('^');
                }
                if chars.peek() == Some(&']') {
                    chars.next();
                    class.push_str(r"\]");
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' {
                        class.push_str(r"\\");
                    } else {
                        class.push(inner);
                    }
                }
                if closed {
                    translated.push('[');
                    translated.push_str(&class);
                    translated.push(']');
                } else {
                    // No closing bracket: the '[' is literal, as is the
                    // consumed remainder.
                    translated.push_str(r"\[");
                    let rest = class.trim_start_matches('^');
                    translated.push_str(&regex::escape(rest));
                }
            }
            '\\' => match chars.next() {
                Some(next) => translated.push_str(&regex::escape(&next.to_string())),
                None => translated.push_str(r"\\"),
            },
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }

    translated.push('$');
    regex::Regex::new(&translated)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(pool: &mut EventPool, name: &str, env: &[&str]) -> EventId {
        pool.emit(name, env.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn glob_match_covers_fnmatch_forms() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("/dev/sd?1", "/dev/sdb1"));
        assert!(!glob_match("/dev/sd?1", "/dev/sdb2"));
        assert!(glob_match("eth[0-9]", "eth3"));
        assert!(!glob_match("eth[!0-9]", "eth3"));
        assert!(glob_match("plain", "plain"));
        assert!(!glob_match("plain", "plain2"));
    }

    #[test]
    fn match_requires_identical_names() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "stopped", &[]);
        let expr = EventExpression::matcher("started", vec![]);
        assert!(!match_event(
            expr.nodes().next().unwrap(),
            pool.get(id).unwrap(),
            &[],
        ));
    }

    #[test]
    fn positional_patterns_match_values_in_order() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "runlevel", &["RUNLEVEL=2", "PREVLEVEL=S"]);
        let ev = pool.get(id).unwrap();

        let node = EventExpression::matcher("runlevel", vec!["2".into()]);
        assert!(match_event(node.nodes().next().unwrap(), ev, &[]));

        let node = EventExpression::matcher("runlevel", vec!["2".into(), "S".into()]);
        assert!(match_event(node.nodes().next().unwrap(), ev, &[]));

        let node = EventExpression::matcher("runlevel", vec!["3".into()]);
        assert!(!match_event(node.nodes().next().unwrap(), ev, &[]));
    }

    #[test]
    fn positional_overflow_fails() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "runlevel", &["RUNLEVEL=2"]);
        let node = EventExpression::matcher(
            "runlevel",
            vec!["2".into(), "S".into(), "x".into()],
        );
        assert!(!match_event(
            node.nodes().next().unwrap(),
            pool.get(id).unwrap(),
            &[],
        ));
    }

    #[test]
    fn named_patterns_use_key_lookup_and_globs() {
        let mut pool = EventPool::new();
        let id = event(
            &mut pool,
            "mount",
            &["DEVICE=/dev/sdb1", "TYPE=ext4", "OPTIONS=ro"],
        );
        let ev = pool.get(id).unwrap();

        let node = EventExpression::matcher(
            "mount",
            vec!["DEVICE=/dev/sd?1".into(), "TYPE=ext4".into()],
        );
        assert!(match_event(node.nodes().next().unwrap(), ev, &[]));

        let node = EventExpression::matcher("mount", vec!["TYPE!=vfat".into()]);
        assert!(match_event(node.nodes().next().unwrap(), ev, &[]));

        let node = EventExpression::matcher("mount", vec!["TYPE!=ext4".into()]);
        assert!(!match_event(node.nodes().next().unwrap(), ev, &[]));
    }

    #[test]
    fn negated_lookup_of_absent_variable_succeeds() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "mount", &["DEVICE=/dev/sdb1"]);
        let ev = pool.get(id).unwrap();

        let node = EventExpression::matcher("mount", vec!["LABEL!=backup".into()]);
        assert!(match_event(node.nodes().next().unwrap(), ev, &[]));

        let node = EventExpression::matcher("mount", vec!["LABEL=backup".into()]);
        assert!(!match_event(node.nodes().next().unwrap(), ev, &[]));
    }

    #[test]
    fn pattern_expansion_against_caller_environment() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "mount", &["DEVICE=/dev/sdb1"]);
        let ev = pool.get(id).unwrap();
        let env: Vec<String> = vec!["DEV=/dev/sdb1".into()];

        let node = EventExpression::matcher("mount", vec!["DEVICE=$DEV".into()]);
        assert!(match_event(node.nodes().next().unwrap(), ev, &env));

        // $UNSET against any value fails.
        let node = EventExpression::matcher("mount", vec!["DEVICE=$UNSET".into()]);
        assert!(!match_event(node.nodes().next().unwrap(), ev, &env));
    }

    #[test]
    fn handle_latches_and_blocks_once_per_leaf() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "mount", &["DEVICE=/dev/sdb1", "TYPE=ext4"]);

        let mut expr = EventExpression::matcher(
            "mount",
            vec!["DEVICE=/dev/sd?1".into(), "TYPE=ext4".into()],
        );
        assert!(expr.handle(&mut pool, id, &[]));
        assert!(expr.value());
        assert_eq!(pool.get(id).unwrap().blockers, 1);

        // A second emission of the same event does not latch again.
        assert!(!expr.handle(&mut pool, id, &[]));
        assert_eq!(pool.get(id).unwrap().blockers, 1);

        expr.reset(&mut pool);
        assert!(!expr.value());
        assert_eq!(pool.get(id).unwrap().blockers, 0);
    }

    #[test]
    fn and_waits_for_both_sides() {
        let mut pool = EventPool::new();
        let mut expr = EventExpression::combine(
            OperatorType::And,
            EventExpression::matcher("local-filesystems", vec![]),
            EventExpression::matcher("net-device-up", vec![]),
        );

        let first = event(&mut pool, "local-filesystems", &[]);
        assert!(expr.handle(&mut pool, first, &[]));
        assert!(!expr.value());

        let second = event(&mut pool, "net-device-up", &[]);
        assert!(expr.handle(&mut pool, second, &[]));
        assert!(expr.value());
    }

    #[test]
    fn or_is_satisfied_by_either_side() {
        let mut pool = EventPool::new();
        let mut expr = EventExpression::combine(
            OperatorType::Or,
            EventExpression::matcher("runlevel", vec!["2".into()]),
            EventExpression::matcher("runlevel", vec!["3".into()]),
        );

        let id = event(&mut pool, "runlevel", &["RUNLEVEL=3"]);
        assert!(expr.handle(&mut pool, id, &[]));
        assert!(expr.value());
    }

    #[test]
    fn copy_preserves_state_and_reblocks() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "startup", &[]);
        let mut expr = EventExpression::matcher("startup", vec![]);
        expr.handle(&mut pool, id, &[]);
        assert_eq!(pool.get(id).unwrap().blockers, 1);

        let mut copied = expr.copy(&mut pool);
        assert!(copied.value());
        assert_eq!(pool.get(id).unwrap().blockers, 2);

        // reset(copy(op)) leaves the same counts as reset(op).
        copied.reset(&mut pool);
        expr.reset(&mut pool);
        assert_eq!(pool.get(id).unwrap().blockers, 0);
    }

    #[test]
    fn environment_collects_only_the_active_side() {
        let mut pool = EventPool::new();
        let mut expr = EventExpression::combine(
            OperatorType::Or,
            EventExpression::matcher("alpha", vec![]),
            EventExpression::matcher("beta", vec![]),
        );
        let id = event(&mut pool, "beta", &["SRC=beta", "EXTRA=1"]);
        expr.handle(&mut pool, id, &[]);

        let mut env = vec!["SRC=class".to_string()];
        expr.environment(&pool, &mut env, Some("EVENTS"));
        assert_eq!(env, vec!["SRC=beta", "EXTRA=1", "EVENTS=beta"]);
    }

    #[test]
    fn environment_overwrites_in_tree_order() {
        let mut pool = EventPool::new();
        let mut expr = EventExpression::combine(
            OperatorType::And,
            EventExpression::matcher("alpha", vec![]),
            EventExpression::matcher("beta", vec![]),
        );
        let a = event(&mut pool, "alpha", &["KEY=left"]);
        let b = event(&mut pool, "beta", &["KEY=right"]);
        expr.handle(&mut pool, a, &[]);
        expr.handle(&mut pool, b, &[]);

        let mut env = Vec::new();
        expr.environment(&pool, &mut env, None);
        assert_eq!(env, vec!["KEY=right"]);
    }

    #[test]
    fn events_blocks_once_per_record() {
        let mut pool = EventPool::new();
        let id = event(&mut pool, "startup", &[]);
        let mut expr = EventExpression::matcher("startup", vec![]);
        expr.handle(&mut pool, id, &[]);

        let blocked = expr.events(&mut pool);
        assert_eq!(blocked.len(), 1);
        assert_eq!(pool.get(id).unwrap().blockers, 2);

        for record in blocked {
            pool.release(record);
        }
        assert_eq!(pool.get(id).unwrap().blockers, 1);
    }

    #[test]
    fn collapse_brackets_every_operator() {
        let expr = EventExpression::combine(
            OperatorType::Or,
            EventExpression::combine(
                OperatorType::And,
                EventExpression::matcher("alpha", vec!["A=1".into()]),
                EventExpression::matcher("beta", vec![]),
            ),
            EventExpression::matcher("gamma", vec![]),
        );
        assert_eq!(expr.collapse(), "((alpha A=1 and beta) or gamma)");

        let lone = EventExpression::matcher("alpha", vec!["x y".into()]);
        assert_eq!(lone.collapse(), "alpha \"x y\"");
    }

    #[test]
    fn serialise_round_trips_an_asymmetric_tree() {
        let mut pool = EventPool::new();
        let mut expr = EventExpression::combine(
            OperatorType::Or,
            EventExpression::matcher("alpha", vec![]),
            EventExpression::combine(
                OperatorType::And,
                EventExpression::matcher("beta", vec!["B=2".into()]),
                EventExpression::combine(
                    OperatorType::Or,
                    EventExpression::matcher("gamma", vec![]),
                    EventExpression::matcher("delta", vec![]),
                ),
            ),
        );
        let id = event(&mut pool, "alpha", &[]);
        expr.handle(&mut pool, id, &[]);

        let serial = expr.serialise();
        let rebuilt = EventExpression::deserialise(&serial).expect("rebuild");
        assert_eq!(rebuilt.serialise(), serial);
        assert_eq!(rebuilt.collapse(), expr.collapse());
        assert_eq!(rebuilt.value(), expr.value());
    }

    #[test]
    fn deserialise_rejects_malformed_arrays() {
        assert!(EventExpression::deserialise(&[]).is_err());

        let dangling = vec![SerialOperator {
            op: OperatorType::And,
            value: false,
            name: None,
            env: vec![],
            event: None,
        }];
        assert!(EventExpression::deserialise(&dangling).is_err());

        let unattached = vec![
            SerialOperator {
                op: OperatorType::Match,
                value: false,
                name: Some("alpha".into()),
                env: vec![],
                event: None,
            },
            SerialOperator {
                op: OperatorType::Match,
                value: false,
                name: Some("beta".into()),
                env: vec![],
                event: None,
            },
        ];
        assert!(EventExpression::deserialise(&unattached).is_err());
    }
}
