//! Injected "clone" and "open file" buttons.
//!
//! Every injected container carries `data-toolbox-injected`; injection into
//! a mount point that already holds one is a no-op, so mount-point observers
//! may fire repeatedly for the same element.

use std::rc::Rc;

use super::FileLocation;
use crate::dom::{Document, Element};
use crate::messaging::{CloneAction, NavigateAction, PerformAction};
use crate::tools::Tool;

pub const INJECTED_MARKER: &str = "data-toolbox-injected";

/// Receives the action of a clicked button.
pub type ActionSink = Rc<dyn Fn(PerformAction)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affordance {
    Clone,
    OpenFile,
}

impl Affordance {
    pub fn marker(self) -> &'static str {
        match self {
            Affordance::Clone => "clone",
            Affordance::OpenFile => "open-file",
        }
    }

    fn selector(self) -> String {
        format!("[{INJECTED_MARKER}=\"{}\"]", self.marker())
    }
}

fn is_injected(mount: &Element, affordance: Affordance) -> bool {
    mount
        .query_selector(&affordance.selector())
        .ok()
        .flatten()
        .is_some()
}

fn button(doc: &Document, tool: &Tool, title: String, action: PerformAction, sink: &ActionSink) -> Element {
    let button = doc
        .create_element("a")
        .with_attr("class", "toolbox-button")
        .with_attr("data-tool-tag", &tool.tag)
        .with_attr("title", &title)
        .with_attr("href", &action.toolbox_url());
    button.append_child(
        &doc.create_element("img")
            .with_attr("src", &tool.icon)
            .with_attr("alt", &tool.name),
    );
    let sink = Rc::clone(sink);
    button.add_click_listener(move |_| sink(action.clone()));
    button
}

fn container(doc: &Document, affordance: Affordance, buttons: Vec<Element>) -> Element {
    let container = doc
        .create_element("div")
        .with_attr("class", "toolbox-actions")
        .with_attr(INJECTED_MARKER, affordance.marker());
    container.replace_children(&buttons);
    container
}

/// Add one clone button per tool to `mount`. Returns whether anything was
/// inserted.
pub fn inject_clone_buttons(mount: &Element, tools: &[Tool], clone_url: &str, sink: &ActionSink) -> bool {
    if tools.is_empty() || is_injected(mount, Affordance::Clone) {
        return false;
    }
    let doc = mount.document();
    let buttons = tools
        .iter()
        .map(|tool| {
            let action = PerformAction::Clone(CloneAction {
                tool_tag: tool.tag.clone(),
                clone_url: clone_url.to_string(),
            });
            button(doc, tool, format!("Clone in {}", tool.name), action, sink)
        })
        .collect();
    mount.append_child(&container(doc, Affordance::Clone, buttons));
    true
}

/// Add one open-file button per tool to `mount`.
pub fn inject_file_buttons(
    mount: &Element,
    tools: &[Tool],
    project: &str,
    location: &FileLocation,
    sink: &ActionSink,
) -> bool {
    if tools.is_empty() || is_injected(mount, Affordance::OpenFile) {
        return false;
    }
    let doc = mount.document();
    let buttons = tools
        .iter()
        .map(|tool| {
            let action = PerformAction::Navigate(NavigateAction {
                tool_tag: tool.tag.clone(),
                project: project.to_string(),
                file_path: location.path.clone(),
                line_number: location.line,
            });
            button(doc, tool, format!("Open in {}", tool.name), action, sink)
        })
        .collect();
    mount.prepend_child(&container(doc, Affordance::OpenFile, buttons));
    true
}

/// Remove injected containers of `affordance`, or all of them. Returns how
/// many were removed.
pub fn remove_injected(doc: &Document, affordance: Option<Affordance>) -> usize {
    let selector = match affordance {
        Some(a) => a.selector(),
        None => format!("[{INJECTED_MARKER}]"),
    };
    let found = match doc.query_selector_all(&selector) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(target: "inject", "{e}");
            return 0;
        }
    };
    for element in &found {
        element.remove();
    }
    found.len()
}
