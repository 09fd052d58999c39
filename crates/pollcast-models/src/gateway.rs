use serde::{Deserialize, Serialize};

/// Messages a client may send over the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "pollId")]
        poll_id: String,
        #[serde(default, alias = "identityToken")]
        token: Option<String>,
    },
    Unsubscribe {
        #[serde(rename = "pollId")]
        poll_id: String,
    },
}

/// Acknowledgements and errors sent back on the same connection.
/// Live pushes are [`crate::event::UpdateEvent`] payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        #[serde(rename = "pollId")]
        poll_id: String,
    },
    Unsubscribed {
        #[serde(rename = "pollId")]
        poll_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
