//! In-memory page document.
//!
//! Single-threaded (`Rc`), like the page it mirrors. Elements live in an
//! arena and are never freed while the document lives, so an `Element`
//! handle stays valid after its node is detached. Every change produces a
//! `Mutation` that is delivered to observers synchronously, in order; a
//! change made by an observer while a delivery is running is queued and
//! delivered after the current one finishes.

pub mod observer;
pub mod selector;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

pub use observer::{DomObserver, MutationSource};
pub use selector::{SelectorError, SelectorList, SelectorTree};

type NodeId = usize;
type ClickHandler = Rc<dyn Fn(&Element)>;
type MutationListener = Rc<dyn Fn(&Mutation)>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    ChildList {
        target: Element,
        added: Vec<Element>,
        removed: Vec<Element>,
    },
    Attribute {
        target: Element,
        name: String,
        old_value: Option<String>,
    },
}

struct Node {
    tag: String,
    attributes: Vec<(String, String)>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    click_handlers: Vec<ClickHandler>,
}

struct Inner {
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
    url: String,
    listeners: Vec<(u64, MutationListener)>,
    next_listener: u64,
    pending: VecDeque<Mutation>,
    delivering: bool,
}

/// Shared handle to one page document.
#[derive(Clone)]
pub struct Document {
    inner: Rc<RefCell<Inner>>,
}

/// Handle to one element of a `Document`.
#[derive(Clone)]
pub struct Element {
    doc: Document,
    id: NodeId,
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.doc.inner, &other.doc.inner)
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.doc.inner.borrow();
        let node = &inner.nodes[self.id];
        write!(f, "<{}", node.tag)?;
        for (name, value) in &node.attributes {
            write!(f, " {name}=\"{value}\"")?;
        }
        write!(f, "> #{}", self.id)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document").field("url", &self.url()).finish()
    }
}

impl SelectorTree for Inner {
    type Node = NodeId;

    fn tag(&self, node: NodeId) -> &str {
        &self.nodes[node].tag
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes[node]
            .attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }
}

impl Inner {
    fn new_node(&mut self, tag: &str) -> NodeId {
        self.nodes.push(Node {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
            click_handlers: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn is_connected(&self, mut node: NodeId) -> bool {
        loop {
            if node == self.root {
                return true;
            }
            match self.nodes[node].parent {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Descendants of `node` in document order (pre-order), excluding `node`.
    fn descendants(&self, node: NodeId, out: &mut Vec<NodeId>) {
        for &child in &self.nodes[node].children {
            out.push(child);
            self.descendants(child, out);
        }
    }

    fn detach(&mut self, node: NodeId) -> Option<NodeId> {
        let parent = self.nodes[node].parent.take()?;
        self.nodes[parent].children.retain(|&c| c != node);
        Some(parent)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new("about:blank")
    }
}

impl Document {
    /// Empty `<html><head></head><body></body></html>` document at `url`.
    pub fn new(url: &str) -> Self {
        let mut inner = Inner {
            nodes: Vec::new(),
            root: 0,
            body: 0,
            url: url.to_string(),
            listeners: Vec::new(),
            next_listener: 1,
            pending: VecDeque::new(),
            delivering: false,
        };
        let root = inner.new_node("html");
        let head = inner.new_node("head");
        let body = inner.new_node("body");
        inner.nodes[root].children = vec![head, body];
        inner.nodes[head].parent = Some(root);
        inner.nodes[body].parent = Some(root);
        inner.root = root;
        inner.body = body;
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    fn element(&self, id: NodeId) -> Element {
        Element {
            doc: self.clone(),
            id,
        }
    }

    pub fn url(&self) -> String {
        self.inner.borrow().url.clone()
    }

    /// Client-side navigation: the URL changes, the document stays.
    pub fn set_url(&self, url: &str) {
        self.inner.borrow_mut().url = url.to_string();
    }

    pub fn document_element(&self) -> Element {
        let root = self.inner.borrow().root;
        self.element(root)
    }

    pub fn head(&self) -> Element {
        let inner = self.inner.borrow();
        let head = inner.nodes[inner.root].children[0];
        drop(inner);
        self.element(head)
    }

    pub fn body(&self) -> Element {
        let body = self.inner.borrow().body;
        self.element(body)
    }

    pub fn create_element(&self, tag: &str) -> Element {
        let id = self.inner.borrow_mut().new_node(tag);
        self.element(id)
    }

    pub fn query_selector(&self, selector: &str) -> Result<Option<Element>, SelectorError> {
        Ok(self.query_selector_all(selector)?.into_iter().next())
    }

    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, SelectorError> {
        let list = SelectorList::parse(selector)?;
        Ok(self.select(&list))
    }

    /// Connected elements matching `list`, in document order.
    pub fn select(&self, list: &SelectorList) -> Vec<Element> {
        self.document_element().select_within(list, true)
    }

    /// Observe every mutation. Returns a token for `unobserve`.
    pub fn observe(&self, listener: impl Fn(&Mutation) + 'static) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push((id, Rc::new(listener)));
        id
    }

    pub fn unobserve(&self, token: u64) {
        self.inner.borrow_mut().listeners.retain(|(id, _)| *id != token);
    }

    fn notify(&self, mutation: Mutation) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.pending.push_back(mutation);
            if inner.delivering {
                return;
            }
            inner.delivering = true;
        }

        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                match inner.pending.pop_front() {
                    Some(m) => Some((m, inner.listeners.clone())),
                    None => {
                        inner.delivering = false;
                        None
                    }
                }
            };
            let Some((mutation, listeners)) = next else {
                break;
            };
            for (id, listener) in listeners {
                // A listener removed by an earlier one in this round is skipped
                let still_registered = self.inner.borrow().listeners.iter().any(|(l, _)| *l == id);
                if still_registered {
                    listener(&mutation);
                }
            }
        }
    }
}

impl Element {
    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn tag(&self) -> String {
        self.doc.inner.borrow().nodes[self.id].tag.clone()
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.doc.inner.borrow().attribute(self.id, name).map(str::to_string)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.doc.inner.borrow().attribute(self.id, name).is_some()
    }

    pub fn set_attr(&self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        let old_value = {
            let mut inner = self.doc.inner.borrow_mut();
            let attributes = &mut inner.nodes[self.id].attributes;
            match attributes.iter_mut().find(|(k, _)| *k == name) {
                Some((_, v)) if v == value => return,
                Some((_, v)) => Some(std::mem::replace(v, value.to_string())),
                None => {
                    attributes.push((name.clone(), value.to_string()));
                    None
                }
            }
        };
        self.doc.notify(Mutation::Attribute {
            target: self.clone(),
            name,
            old_value,
        });
    }

    /// Builder-style `set_attr` for constructing fixtures and injected UI.
    pub fn with_attr(self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_text(self, text: &str) -> Self {
        self.set_text(text);
        self
    }

    pub fn set_text(&self, text: &str) {
        self.doc.inner.borrow_mut().nodes[self.id].text = text.to_string();
    }

    /// Own and descendant text, trimmed pieces joined by single spaces.
    pub fn text_content(&self) -> String {
        let inner = self.doc.inner.borrow();
        let mut ids = vec![self.id];
        inner.descendants(self.id, &mut ids);
        ids.iter()
            .map(|&id| inner.nodes[id].text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn parent(&self) -> Option<Element> {
        let parent = self.doc.inner.borrow().nodes[self.id].parent;
        parent.map(|p| self.doc.element(p))
    }

    pub fn children(&self) -> Vec<Element> {
        let children = self.doc.inner.borrow().nodes[self.id].children.clone();
        children.into_iter().map(|c| self.doc.element(c)).collect()
    }

    pub fn is_connected(&self) -> bool {
        self.doc.inner.borrow().is_connected(self.id)
    }

    fn contains(&self, other: &Element) -> bool {
        let inner = self.doc.inner.borrow();
        let mut node = Some(other.id);
        while let Some(n) = node {
            if n == self.id {
                return true;
            }
            node = inner.nodes[n].parent;
        }
        false
    }

    fn insert(&self, child: &Element, index: Option<usize>) {
        if !Rc::ptr_eq(&self.doc.inner, &child.doc.inner) || child.contains(self) {
            tracing::warn!(target: "dom", "Refusing to insert {child:?} into {self:?}");
            return;
        }
        // Moving a connected node is a removal from its old parent first
        if child.parent().is_some() {
            child.remove();
        }
        {
            let mut inner = self.doc.inner.borrow_mut();
            let children = &mut inner.nodes[self.id].children;
            let at = index.unwrap_or(children.len()).min(children.len());
            children.insert(at, child.id);
            inner.nodes[child.id].parent = Some(self.id);
        }
        self.doc.notify(Mutation::ChildList {
            target: self.clone(),
            added: vec![child.clone()],
            removed: Vec::new(),
        });
    }

    pub fn append_child(&self, child: &Element) {
        self.insert(child, None);
    }

    pub fn prepend_child(&self, child: &Element) {
        self.insert(child, Some(0));
    }

    /// Insert `child` right before `reference`, which must be a child of `self`.
    pub fn insert_before(&self, child: &Element, reference: &Element) {
        let index = self
            .doc
            .inner
            .borrow()
            .nodes[self.id]
            .children
            .iter()
            .position(|&c| c == reference.id);
        self.insert(child, index);
    }

    /// Insert `sibling` right after this element.
    pub fn insert_after(&self, sibling: &Element) {
        let Some(parent) = self.parent() else {
            return;
        };
        let index = {
            let inner = self.doc.inner.borrow();
            inner.nodes[parent.id]
                .children
                .iter()
                .position(|&c| c == self.id)
                .map(|i| i + 1)
        };
        parent.insert(sibling, index);
    }

    /// Detach from the parent. Detached elements keep their own subtree.
    pub fn remove(&self) {
        let parent = self.doc.inner.borrow_mut().detach(self.id);
        if let Some(parent) = parent {
            self.doc.notify(Mutation::ChildList {
                target: self.doc.element(parent),
                added: Vec::new(),
                removed: vec![self.clone()],
            });
        }
    }

    /// Replace all children with `children`, as a single mutation.
    pub fn replace_children(&self, children: &[Element]) {
        let removed = {
            let mut inner = self.doc.inner.borrow_mut();
            let old = std::mem::take(&mut inner.nodes[self.id].children);
            for &c in &old {
                inner.nodes[c].parent = None;
            }
            old
        };
        let mut added = Vec::new();
        for child in children {
            if child.contains(self) {
                continue;
            }
            child.remove();
            let mut inner = self.doc.inner.borrow_mut();
            inner.nodes[self.id].children.push(child.id);
            inner.nodes[child.id].parent = Some(self.id);
            added.push(child.clone());
        }
        self.doc.notify(Mutation::ChildList {
            target: self.clone(),
            added,
            removed: removed.into_iter().map(|id| self.doc.element(id)).collect(),
        });
    }

    fn select_within(&self, list: &SelectorList, include_self: bool) -> Vec<Element> {
        let inner = self.doc.inner.borrow();
        let mut ids = Vec::new();
        if include_self {
            ids.push(self.id);
        }
        inner.descendants(self.id, &mut ids);
        ids.into_iter()
            .filter(|&id| list.matches(&*inner, id))
            .map(|id| self.doc.element(id))
            .collect()
    }

    pub fn matches(&self, selector: &str) -> Result<bool, SelectorError> {
        let list = SelectorList::parse(selector)?;
        Ok(list.matches(&*self.doc.inner.borrow(), self.id))
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, selector: &str) -> Result<Option<Element>, SelectorError> {
        let list = SelectorList::parse(selector)?;
        let inner = self.doc.inner.borrow();
        let mut node = Some(self.id);
        while let Some(n) = node {
            if list.matches(&*inner, n) {
                return Ok(Some(self.doc.element(n)));
            }
            node = inner.nodes[n].parent;
        }
        Ok(None)
    }

    /// Descendants matching `selector`, in document order.
    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, SelectorError> {
        let list = SelectorList::parse(selector)?;
        Ok(self.select_within(&list, false))
    }

    pub fn query_selector(&self, selector: &str) -> Result<Option<Element>, SelectorError> {
        Ok(self.query_selector_all(selector)?.into_iter().next())
    }

    pub fn add_click_listener(&self, handler: impl Fn(&Element) + 'static) {
        self.doc.inner.borrow_mut().nodes[self.id]
            .click_handlers
            .push(Rc::new(handler));
    }

    /// Dispatch a click to this element's listeners.
    pub fn click(&self) {
        let handlers = self.doc.inner.borrow().nodes[self.id].click_handlers.clone();
        for handler in handlers {
            handler(self);
        }
    }
}
