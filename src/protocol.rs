use std::fmt;

use serde::{Deserialize, Serialize};

/// MessageKind identifies what kind of frame is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A chat line. Spelled `msg` on the wire.
    #[serde(rename = "msg")]
    Chat,
    Join,
    Leave,
    /// Hub → client: the hub is going away.
    Close,
}

/// Every frame is a single JSON object followed by a newline character (\n).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: String,
    /// Sender identity, set by the hub on relayed chat lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Message {
    pub fn new(kind: MessageKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            from: None,
        }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, text)
    }

    /// A chat line as relayed by the hub, tagged with the sender's identity.
    pub fn relayed(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            ..Self::chat(text)
        }
    }

    pub fn join(id: impl Into<String>) -> Self {
        Self::new(MessageKind::Join, id)
    }

    pub fn leave(id: impl Into<String>) -> Self {
        Self::new(MessageKind::Leave, id)
    }

    pub fn close() -> Self {
        Self::new(MessageKind::Close, "")
    }

    pub fn is_close(&self) -> bool {
        self.kind == MessageKind::Close
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.from) {
            (MessageKind::Chat, Some(from)) => write!(f, "{}: \"{}\"", from, self.data),
            (MessageKind::Chat, None) => f.write_str(&self.data),
            (MessageKind::Join, _) => write!(f, "{} has joined the server", self.data),
            (MessageKind::Leave, _) => write!(f, "{} has left the server", self.data),
            (MessageKind::Close, _) => f.write_str("server closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_uses_msg_on_the_wire() {
        let encoded = serde_json::to_string(&Message::chat("hi")).unwrap();
        assert_eq!(encoded, r#"{"type":"msg","data":"hi"}"#);
    }

    #[test]
    fn relayed_chat_carries_sender() {
        let encoded = serde_json::to_value(Message::relayed("10.0.0.1:4000", "hi")).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({"type": "msg", "data": "hi", "from": "10.0.0.1:4000"})
        );
    }

    #[test]
    fn bare_close_parses_with_empty_data() {
        let msg: Message = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
        assert_eq!(msg, Message::close());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"type":"shout","data":"x"}"#).is_err());
    }

    #[test]
    fn display_matches_console_format() {
        assert_eq!(
            Message::relayed("1.2.3.4:5", "hello").to_string(),
            "1.2.3.4:5: \"hello\""
        );
        assert_eq!(
            Message::join("1.2.3.4:5").to_string(),
            "1.2.3.4:5 has joined the server"
        );
        assert_eq!(
            Message::leave("1.2.3.4:5").to_string(),
            "1.2.3.4:5 has left the server"
        );
    }
}
