//! Elementary selectors for targeting document nodes.
//!
//! Exactly four forms are recognised (`.class`, `#id`, `[attr]`,
//! `[attr=value]`); any other string is compared verbatim against tag names.
//! There are no combinators or pseudo-classes.

use markup5ever_rcdom::Handle;

use crate::document::{element_name, get_attr, has_attr, is_element};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `.name`: `name` is one of the whitespace-separated tokens in `class`.
    Class(String),
    /// `#id`: the `id` attribute equals `id` exactly.
    Id(String),
    /// `[attr]`: the attribute is present, whatever its value.
    HasAttr(String),
    /// `[attr=value]`: the attribute equals `value`. Quotes are stripped at parse time.
    AttrEquals { name: String, value: String },
    /// Anything else: the tag name equals the string verbatim.
    Tag(String),
}

impl Selector {
    /// Classify a selector string. Never fails: unrecognised input is a tag selector.
    pub fn parse(input: &str) -> Selector {
        let selector = input.trim();

        if let Some(class) = selector.strip_prefix('.') {
            return Selector::Class(class.to_string());
        }
        if let Some(id) = selector.strip_prefix('#') {
            return Selector::Id(id.to_string());
        }
        if let Some(inner) = selector
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            return match inner.split_once('=') {
                None => Selector::HasAttr(inner.trim().to_string()),
                Some((name, value)) => Selector::AttrEquals {
                    name: name.trim().to_string(),
                    value: value
                        .trim()
                        .trim_matches(|c| c == '"' || c == '\'')
                        .to_string(),
                },
            };
        }
        Selector::Tag(selector.to_string())
    }

    /// Whether `node` matches. Only elements ever match.
    pub fn matches(&self, node: &Handle) -> bool {
        if !is_element(node) {
            return false;
        }
        match self {
            Selector::Class(class) => get_attr(node, "class")
                .is_some_and(|classes| classes.split_whitespace().any(|c| c == class)),
            Selector::Id(id) => get_attr(node, "id").is_some_and(|v| v == *id),
            Selector::HasAttr(name) => has_attr(node, name),
            Selector::AttrEquals { name, value } => {
                get_attr(node, name).is_some_and(|v| v == *value)
            }
            Selector::Tag(tag) => element_name(node) == Some(tag.as_str()),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Class(class) => write!(f, ".{class}"),
            Selector::Id(id) => write!(f, "#{id}"),
            Selector::HasAttr(name) => write!(f, "[{name}]"),
            Selector::AttrEquals { name, value } => write!(f, "[{name}=\"{value}\"]"),
            Selector::Tag(tag) => f.write_str(tag),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Every node under (and including) `root` that matches, in document order.
///
/// The whole tree is always walked, even for `#id`, so duplicate ids all match.
pub fn find_nodes(root: &Handle, selector: &Selector) -> Vec<Handle> {
    let mut results = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        if selector.matches(&node) {
            results.push(node.clone());
        }
        // Reverse so the leftmost child is visited first.
        for child in node.children.borrow().iter().rev() {
            stack.push(child.clone());
        }
    }
    results
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
