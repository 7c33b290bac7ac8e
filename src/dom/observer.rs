//! Selector subscriptions over a mutating document.
//!
//! After every mutation the observer recomputes the set of matching nodes
//! and diffs it against the previous set: nodes that left it get `on_remove`,
//! nodes that joined it get `on_add`. Host pages re-render subtrees freely, so
//! the same logical mount point can come back as a new node and produce a
//! second `on_add`; callbacks have to check before inserting.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::selector::{SelectorError, SelectorList};
use super::{Document, Element};

/// Something that can be queried with selectors and reports changes.
pub trait MutationSource: Clone + 'static {
    type Node: Clone + PartialEq + 'static;

    /// Currently matching nodes, in document order.
    fn matching(&self, selector: &SelectorList) -> Vec<Self::Node>;

    /// Call `listener` after every change. Returns an unsubscribe token.
    fn subscribe(&self, listener: Rc<dyn Fn()>) -> u64;

    fn unsubscribe(&self, token: u64);
}

impl MutationSource for Document {
    type Node = Element;

    fn matching(&self, selector: &SelectorList) -> Vec<Element> {
        self.select(selector)
    }

    fn subscribe(&self, listener: Rc<dyn Fn()>) -> u64 {
        self.observe(move |_| listener())
    }

    fn unsubscribe(&self, token: u64) {
        self.unobserve(token);
    }
}

type Callback<N> = Rc<dyn Fn(&N)>;

struct State<N> {
    token: Option<u64>,
    matched: Vec<N>,
    /// Initial matches `start` has not reported yet
    pending: Vec<N>,
    on_add: Option<Callback<N>>,
    on_remove: Option<Callback<N>>,
}

pub struct DomObserver<S: MutationSource> {
    source: S,
    selector: SelectorList,
    state: Rc<RefCell<State<S::Node>>>,
}

impl<S: MutationSource> DomObserver<S> {
    pub fn new(source: S, selector: &str) -> Result<Self, SelectorError> {
        Ok(Self {
            source,
            selector: SelectorList::parse(selector)?,
            state: Rc::new(RefCell::new(State {
                token: None,
                matched: Vec::new(),
                pending: Vec::new(),
                on_add: None,
                on_remove: None,
            })),
        })
    }

    pub fn selector(&self) -> &SelectorList {
        &self.selector
    }

    pub fn is_observing(&self) -> bool {
        self.state.borrow().token.is_some()
    }

    /// Begin observing. `on_add` fires for every node that already matches
    /// before this returns, unless an earlier callback detached it or made it
    /// stop matching. Calling `start` while observing does nothing.
    pub fn start(
        &self,
        on_add: impl Fn(&S::Node) + 'static,
        on_remove: Option<Box<dyn Fn(&S::Node)>>,
    ) {
        if self.is_observing() {
            return;
        }

        let weak: Weak<RefCell<State<S::Node>>> = Rc::downgrade(&self.state);
        let source = self.source.clone();
        let selector = self.selector.clone();
        let listener: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(state) = weak.upgrade() {
                reconcile(&source, &selector, &state);
            }
        });

        let initial = self.source.matching(&self.selector);
        let token = self.source.subscribe(listener);
        let on_add: Callback<S::Node> = Rc::new(on_add);
        {
            let mut state = self.state.borrow_mut();
            state.token = Some(token);
            state.matched = initial.clone();
            state.pending = initial.clone();
            state.on_add = Some(on_add.clone());
            state.on_remove = on_remove.map(|f| -> Callback<S::Node> { Rc::from(f) });
        }

        for node in &initial {
            if !self.is_observing() {
                break;
            }
            let still_pending = {
                let mut state = self.state.borrow_mut();
                match state.pending.iter().position(|n| n == node) {
                    Some(i) => {
                        state.pending.remove(i);
                        true
                    }
                    None => false,
                }
            };
            if still_pending {
                on_add(node);
            }
        }
    }

    /// Stop observing. Safe to call when never started or already stopped.
    pub fn stop(&self) {
        let token = {
            let mut state = self.state.borrow_mut();
            state.on_add = None;
            state.on_remove = None;
            state.matched.clear();
            state.pending.clear();
            state.token.take()
        };
        if let Some(token) = token {
            self.source.unsubscribe(token);
        }
    }
}

impl<S: MutationSource> Drop for DomObserver<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reconcile<S: MutationSource>(source: &S, selector: &SelectorList, state: &Rc<RefCell<State<S::Node>>>) {
    let current = source.matching(selector);
    let (added, removed, on_add, on_remove) = {
        let mut st = state.borrow_mut();
        if st.token.is_none() {
            return;
        }
        let mut removed: Vec<S::Node> = st
            .matched
            .iter()
            .filter(|n| !current.contains(n))
            .cloned()
            .collect();
        // Unreported initial matches leave silently
        if !st.pending.is_empty() {
            let pending = std::mem::take(&mut st.pending);
            let (gone, kept): (Vec<_>, Vec<_>) = pending.into_iter().partition(|n| removed.contains(n));
            removed.retain(|n| !gone.contains(n));
            st.pending = kept;
        }
        let added: Vec<S::Node> = current
            .iter()
            .filter(|n| !st.matched.contains(n))
            .cloned()
            .collect();
        st.matched = current;
        (added, removed, st.on_add.clone(), st.on_remove.clone())
    };

    let active = || state.borrow().token.is_some();
    if let Some(on_remove) = on_remove {
        for node in &removed {
            if !active() {
                return;
            }
            on_remove(node);
        }
    }
    if let Some(on_add) = on_add {
        for node in &added {
            if !active() {
                return;
            }
            on_add(node);
        }
    }
}
