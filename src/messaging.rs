//! Messages exchanged between the background, content scripts and the popup.
//!
//! On the wire a message is `{"type": "<kebab-name>", "payload": {...}}`;
//! payload-less messages omit the field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::storage::Protocol;
use crate::toolbox_url::{get_toolbox_clone_url, get_toolbox_navigate_url};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    GetProtocol,
    SaveProtocol {
        protocol: Protocol,
    },
    GetModifyPages,
    SaveModifyPages {
        allow: bool,
    },
    EnablePageAction {
        project: String,
        https: String,
        ssh: String,
    },
    DisablePageAction,
    GetTools,
    PerformAction(PerformAction),
    ProtocolChanged {
        #[serde(rename = "newValue")]
        new_value: Protocol,
    },
    ModifyPagesChanged {
        #[serde(rename = "newValue")]
        new_value: bool,
    },
    GetLogging,
    SaveLogging {
        value: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneAction {
    pub tool_tag: String,
    pub clone_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateAction {
    pub tool_tag: String,
    pub project: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

/// What a click on an injected button asks the companion application to do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerformAction {
    Clone(CloneAction),
    Navigate(NavigateAction),
}

impl PerformAction {
    pub fn tool_tag(&self) -> &str {
        match self {
            PerformAction::Clone(a) => &a.tool_tag,
            PerformAction::Navigate(a) => &a.tool_tag,
        }
    }

    /// The `jetbrains://` URL the companion application should open.
    pub fn toolbox_url(&self) -> String {
        match self {
            PerformAction::Clone(a) => get_toolbox_clone_url(&a.tool_tag, &a.clone_url),
            PerformAction::Navigate(a) => {
                get_toolbox_navigate_url(&a.tool_tag, &a.project, &a.file_path, a.line_number)
            }
        }
    }
}

/// How a handler answers a message.
#[derive(Debug)]
pub enum Reply {
    /// Answer available immediately
    Now(Value),
    /// Answer delivered once the handler's work completes
    Later(oneshot::Receiver<Value>),
    /// The handler does not answer this message
    None,
}

impl Reply {
    /// A pending reply plus the sender that completes it.
    pub fn later() -> (oneshot::Sender<Value>, Reply) {
        let (tx, rx) = oneshot::channel();
        (tx, Reply::Later(rx))
    }

    /// Wait for the answer. A dropped sender resolves to `None`.
    pub async fn resolve(self) -> Option<Value> {
        match self {
            Reply::Now(value) => Some(value),
            Reply::Later(rx) => rx.await.ok(),
            Reply::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_messages_have_no_payload() {
        let json = serde_json::to_value(Message::GetProtocol).unwrap();
        assert_eq!(json, json!({"type": "get-protocol"}));
        let back: Message = serde_json::from_value(json!({"type": "disable-page-action"})).unwrap();
        assert_eq!(back, Message::DisablePageAction);
    }

    #[test]
    fn payload_messages_use_wire_names() {
        let json = serde_json::to_value(Message::ProtocolChanged {
            new_value: Protocol::Ssh,
        })
        .unwrap();
        assert_eq!(json, json!({"type": "protocol-changed", "payload": {"newValue": "SSH"}}));

        let save: Message =
            serde_json::from_value(json!({"type": "save-modify-pages", "payload": {"allow": false}})).unwrap();
        assert_eq!(save, Message::SaveModifyPages { allow: false });
    }

    #[test]
    fn perform_action_clone_shape() {
        let msg: Message = serde_json::from_value(json!({
            "type": "perform-action",
            "payload": {"toolTag": "idea", "cloneUrl": "https://x/y.git"}
        }))
        .unwrap();
        let Message::PerformAction(action) = msg else {
            panic!("expected perform-action");
        };
        assert_eq!(action.tool_tag(), "idea");
        assert_eq!(
            action.toolbox_url(),
            "jetbrains://idea/checkout/git?checkout.repo=https://x/y.git&idea.required.plugins.id=Git4Idea"
        );
    }

    #[test]
    fn perform_action_navigate_shape() {
        let msg: Message = serde_json::from_value(json!({
            "type": "perform-action",
            "payload": {"toolTag": "idea", "project": "proj", "filePath": "a/b.txt", "lineNumber": 42}
        }))
        .unwrap();
        let Message::PerformAction(action) = msg else {
            panic!("expected perform-action");
        };
        assert_eq!(
            action.toolbox_url(),
            "jetbrains://idea/navigate/reference?project=proj&path=a/b.txt:41:0"
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_value::<Message>(json!({"type": "self-destruct"})).is_err());
    }

    #[tokio::test]
    async fn later_reply_resolves_when_sent() {
        let (tx, reply) = Reply::later();
        tx.send(json!(["idea"])).unwrap();
        assert_eq!(reply.resolve().await, Some(json!(["idea"])));
    }

    #[tokio::test]
    async fn dropped_sender_resolves_to_none() {
        let (tx, reply) = Reply::later();
        drop(tx);
        assert_eq!(reply.resolve().await, None);
        assert_eq!(Reply::None.resolve().await, None);
    }
}
