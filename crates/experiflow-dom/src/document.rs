//! Parsed HTML document and the tree primitives the mutation engine uses.
//!
//! The tree is html5ever's reference-counted DOM: each node owns its children
//! and holds a weak back-reference to its parent, which is only used to
//! detach it.

use std::cell::RefCell;
use std::rc::Rc;

use html5ever::serialize::{serialize, SerializeOpts};
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::{parse_document, parse_fragment, Attribute, LocalName, Namespace, ParseOpts, QualName};
use markup5ever_rcdom::{Handle, Node, NodeData, RcDom, SerializableHandle};

use experiflow_types::{ExperiflowError, Result};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A parsed HTML document owned by a single transform pass.
pub struct Document {
    dom: RcDom,
}

impl Document {
    /// Parse a full HTML document.
    pub fn parse(html: &str) -> Result<Self> {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);
        Ok(Self { dom })
    }

    /// Parse a UTF-8 body. Any other encoding is rejected rather than
    /// replaced, since rendering would not give the original bytes back.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let html = std::str::from_utf8(bytes)
            .map_err(|e| ExperiflowError::Parse(format!("body is not UTF-8: {e}")))?;
        Self::parse(html)
    }

    /// The document node.
    pub fn root(&self) -> &Handle {
        &self.dom.document
    }

    /// Serialize the whole tree back to HTML.
    pub fn render(&self) -> Result<String> {
        let mut out = Vec::new();
        let handle = SerializableHandle::from(self.dom.document.clone());
        serialize(&mut out, &handle, SerializeOpts::default())
            .map_err(|e| ExperiflowError::Render(e.to_string()))?;
        String::from_utf8(out).map_err(|e| ExperiflowError::Render(e.to_string()))
    }
}

/// Parse `html` as a fragment inside a generic `<div>` container and return
/// the top-level nodes, detached and ready to be re-parented.
pub fn parse_fragment_nodes(html: &str) -> Vec<Handle> {
    let context = QualName::new(
        None,
        Namespace::from(HTML_NAMESPACE),
        LocalName::from("div"),
    );
    let dom = parse_fragment(RcDom::default(), ParseOpts::default(), context, Vec::new()).one(html);

    // The fragment parser wraps its output in a synthetic <html> root.
    let wrapper = match dom.document.children.borrow().first() {
        Some(wrapper) => wrapper.clone(),
        None => return Vec::new(),
    };
    let nodes = std::mem::take(&mut *wrapper.children.borrow_mut());
    for node in &nodes {
        node.parent.set(None);
    }
    nodes
}

// ---------------------------------------------------------------------------
// Node helpers
// ---------------------------------------------------------------------------

/// Local tag name of an element; `None` for every other node type.
pub fn element_name(node: &Handle) -> Option<&str> {
    match &node.data {
        NodeData::Element { name, .. } => Some(&*name.local),
        _ => None,
    }
}

pub fn is_element(node: &Handle) -> bool {
    matches!(node.data, NodeData::Element { .. })
}

/// Value of attribute `key`, or `None` if absent or not an element.
pub fn get_attr(node: &Handle, key: &str) -> Option<String> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|a| &*a.name.local == key)
            .map(|a| String::from(&*a.value)),
        _ => None,
    }
}

pub fn has_attr(node: &Handle, key: &str) -> bool {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs.borrow().iter().any(|a| &*a.name.local == key),
        _ => false,
    }
}

/// Update attribute `key` in place, or append it. Returns `false` for non-elements.
pub fn set_attr(node: &Handle, key: &str, value: &str) -> bool {
    let NodeData::Element { attrs, .. } = &node.data else {
        return false;
    };
    let mut attrs = attrs.borrow_mut();
    match attrs.iter_mut().find(|a| &*a.name.local == key) {
        Some(existing) => existing.value = StrTendril::from(value),
        None => attrs.push(Attribute {
            name: QualName::new(None, Namespace::from(""), LocalName::from(key)),
            value: StrTendril::from(value),
        }),
    }
    true
}

/// Remove `node` from its parent. Returns `false` if it had no parent.
pub fn detach(node: &Handle) -> bool {
    let Some(weak) = node.parent.take() else {
        return false;
    };
    match weak.upgrade() {
        Some(parent) => {
            parent
                .children
                .borrow_mut()
                .retain(|child| !Rc::ptr_eq(child, node));
            true
        }
        None => false,
    }
}

/// Append `child` as the last child of `parent`, detaching it from any
/// previous parent first.
pub fn append_child(parent: &Handle, child: Handle) {
    detach(&child);
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().push(child);
}

/// Detach every child of `node`.
pub fn clear_children(node: &Handle) {
    let children = std::mem::take(&mut *node.children.borrow_mut());
    for child in &children {
        child.parent.set(None);
    }
}

/// A new text node holding `text`.
pub fn new_text(text: &str) -> Handle {
    Node::new(NodeData::Text {
        contents: RefCell::new(StrTendril::from(text)),
    })
}

/// Concatenated text of `node` and its descendants.
pub fn text_content(node: &Handle) -> String {
    let mut out = String::new();
    let mut stack = vec![node.clone()];
    while let Some(current) = stack.pop() {
        if let NodeData::Text { contents } = &current.data {
            out.push_str(&contents.borrow());
        }
        for child in current.children.borrow().iter().rev() {
            stack.push(child.clone());
        }
    }
    out
}
