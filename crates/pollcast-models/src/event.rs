use serde::{Deserialize, Serialize};

use crate::poll::PollResults;

/// Live update fanned out to every process over the shared bus.
///
/// The serialized form is also exactly what subscribed WebSocket clients
/// receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    VoteUpdate {
        #[serde(rename = "pollId")]
        poll_id: String,
        data: VoteTally,
    },
    PollClosed {
        #[serde(rename = "pollId")]
        poll_id: String,
        #[serde(default)]
        data: ClosedMarker,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub votes: Vec<i64>,
    pub total_votes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedMarker {
    pub closed: bool,
}

impl Default for ClosedMarker {
    fn default() -> Self {
        Self { closed: true }
    }
}

impl UpdateEvent {
    pub fn vote_update(poll_id: impl Into<String>, results: &PollResults) -> Self {
        UpdateEvent::VoteUpdate {
            poll_id: poll_id.into(),
            data: VoteTally {
                votes: results.votes.clone(),
                total_votes: results.total_votes,
            },
        }
    }

    pub fn poll_closed(poll_id: impl Into<String>) -> Self {
        UpdateEvent::PollClosed {
            poll_id: poll_id.into(),
            data: ClosedMarker::default(),
        }
    }

    pub fn poll_id(&self) -> &str {
        match self {
            UpdateEvent::VoteUpdate { poll_id, .. } | UpdateEvent::PollClosed { poll_id, .. } => {
                poll_id
            }
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            UpdateEvent::VoteUpdate { .. } => "vote_update",
            UpdateEvent::PollClosed { .. } => "poll_closed",
        }
    }
}
