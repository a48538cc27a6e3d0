//! Native stand-in for the host page's DOM.
//!
//! The host owns a [`HostDocument`] and mutates it; the widget reads slots
//! out of it, writes marker attributes onto them and swaps their children.
//! Structural changes made by the host are published to observers in
//! batches, clicks are dispatched to handlers registered on nodes (bubbling
//! from the target towards the root), and custom events go to document-level
//! listeners.

use kuchiki::traits::*;
use kuchiki::{NodeRef, Selectors};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const FRAGMENT_WRAPPER_ID: &str = "__hotlabel_fragment_wrapper";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("query selector `{0}` failed")]
    Selector(String),
}

pub type ClickHandler = Rc<dyn Fn()>;
pub type EventListener = Rc<dyn Fn(&CustomEvent)>;

/// A named event with a JSON detail payload, dispatched on the document.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub name: String,
    pub detail: Value,
}

/// Nodes the host inserted in one mutation.
#[derive(Debug, Clone)]
pub struct MutationBatch {
    pub added: Vec<NodeRef>,
}

pub type MutationStream = UnboundedReceiverStream<MutationBatch>;

#[derive(Clone)]
pub struct HostDocument {
    inner: Rc<DocumentInner>,
}

struct DocumentInner {
    root: NodeRef,
    observers: RefCell<Vec<mpsc::UnboundedSender<MutationBatch>>>,
    click_handlers: RefCell<Vec<(NodeRef, ClickHandler)>>,
    listeners: RefCell<Vec<(String, EventListener)>>,
}

impl HostDocument {
    pub fn parse(html: &str) -> Self {
        Self {
            inner: Rc::new(DocumentInner {
                root: kuchiki::parse_html().one(html),
                observers: RefCell::new(Vec::new()),
                click_handlers: RefCell::new(Vec::new()),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn root(&self) -> &NodeRef {
        &self.inner.root
    }

    pub fn body(&self) -> NodeRef {
        self.inner
            .root
            .select_first("body")
            .map(|body| body.as_node().clone())
            .unwrap_or_else(|()| self.inner.root.clone())
    }

    pub fn to_html(&self) -> String {
        self.inner.root.to_string()
    }

    pub fn select_all(&self, selector: &str) -> Result<Vec<NodeRef>, DocumentError> {
        let nodes = self
            .inner
            .root
            .select(selector)
            .map_err(|()| DocumentError::Selector(selector.to_string()))?;
        Ok(nodes.map(|el| el.as_node().clone()).collect())
    }

    pub fn select_first(&self, selector: &str) -> Result<Option<NodeRef>, DocumentError> {
        Ok(self.select_all(selector)?.into_iter().next())
    }

    /// Whether `node` is still attached to this document.
    pub fn contains(&self, node: &NodeRef) -> bool {
        node.inclusive_ancestors()
            .any(|ancestor| ancestor == self.inner.root)
    }

    /// Host-side insertion: parses `html`, appends it under `parent` and
    /// notifies observers with the top-level nodes that were added.
    pub fn append_html(&self, parent: &NodeRef, html: &str) -> Vec<NodeRef> {
        let added = parse_fragment(html);
        for node in &added {
            parent.append(node.clone());
        }
        self.notify(MutationBatch {
            added: added.clone(),
        });
        added
    }

    /// Host-side removal. Observers only track insertions, so nothing is
    /// published.
    pub fn remove(&self, node: &NodeRef) {
        node.detach();
        self.prune_click_handlers();
    }

    /// Replaces the children of `node` with parsed `html` and returns the new
    /// top-level nodes. Used by the widget for its own views; not published
    /// to observers.
    pub fn replace_children(&self, node: &NodeRef, html: &str) -> Vec<NodeRef> {
        let existing: Vec<_> = node.children().collect();
        for child in existing {
            child.detach();
        }
        let inserted = parse_fragment(html);
        for child in &inserted {
            node.append(child.clone());
        }
        self.prune_click_handlers();
        inserted
    }

    /// Subscribes to host insertions. Batches queue up until the stream is
    /// polled; dropping the stream unsubscribes.
    pub fn observe(&self) -> MutationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.observers.borrow_mut().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    fn notify(&self, batch: MutationBatch) {
        if batch.added.is_empty() {
            return;
        }
        self.inner
            .observers
            .borrow_mut()
            .retain(|tx| tx.send(batch.clone()).is_ok());
    }

    pub fn on_click(&self, node: &NodeRef, handler: ClickHandler) {
        self.inner
            .click_handlers
            .borrow_mut()
            .push((node.clone(), handler));
    }

    /// Simulates a user click on `target`. Handlers on the target run first,
    /// then those on its ancestors. Returns whether any handler ran.
    pub fn click(&self, target: &NodeRef) -> bool {
        if !self.contains(target) {
            return false;
        }
        let handlers: Vec<ClickHandler> = {
            let registered = self.inner.click_handlers.borrow();
            target
                .inclusive_ancestors()
                .flat_map(|node| {
                    registered
                        .iter()
                        .filter(move |(bound, _)| *bound == node)
                        .map(|(_, handler)| Rc::clone(handler))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for handler in &handlers {
            handler();
        }
        !handlers.is_empty()
    }

    /// Drops click handlers bound to nodes that left the document.
    pub fn prune_click_handlers(&self) {
        let root = self.inner.root.clone();
        self.inner
            .click_handlers
            .borrow_mut()
            .retain(|(node, _)| node.inclusive_ancestors().any(|a| a == root));
    }

    pub fn add_event_listener(&self, name: &str, listener: EventListener) {
        self.inner
            .listeners
            .borrow_mut()
            .push((name.to_string(), listener));
    }

    pub fn dispatch_event(&self, event: CustomEvent) {
        let listeners: Vec<EventListener> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .filter(|(name, _)| *name == event.name)
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Parses an HTML fragment into detached top-level nodes.
pub fn parse_fragment(html: &str) -> Vec<NodeRef> {
    // Wrapped so the parser keeps the fragment's own structure intact.
    let wrapper_html = format!("<div id=\"{FRAGMENT_WRAPPER_ID}\">{html}</div>");
    let fragment_doc = kuchiki::parse_html().one(wrapper_html);
    match fragment_doc.select_first(&format!("#{FRAGMENT_WRAPPER_ID}")) {
        Ok(wrapper) => wrapper.as_node().children().collect(),
        Err(()) => Vec::new(),
    }
}

pub fn inner_html(node: &NodeRef) -> String {
    node.children().map(|child| child.to_string()).collect()
}

pub fn matches(node: &NodeRef, selectors: &Selectors) -> bool {
    node.clone()
        .into_element_ref()
        .is_some_and(|element| selectors.matches(&element))
}

pub fn attr(node: &NodeRef, name: &str) -> Option<String> {
    node.as_element()
        .and_then(|el| el.attributes.borrow().get(name).map(str::to_string))
}

pub fn has_attr(node: &NodeRef, name: &str) -> bool {
    node.as_element()
        .is_some_and(|el| el.attributes.borrow().contains(name))
}

pub fn set_attr(node: &NodeRef, name: &str, value: impl Into<String>) {
    if let Some(el) = node.as_element() {
        el.attributes.borrow_mut().insert(name, value.into());
    }
}

pub fn remove_attr(node: &NodeRef, name: &str) {
    if let Some(el) = node.as_element() {
        el.attributes.borrow_mut().remove(name);
    }
}
